//! Blocking adapters between `std::io` streams and the codecs.
//!
//! - [`FramedReader`]: drives a `Decoder` over any `Read`, keeping unconsumed bytes
//! - [`PayloadReader`]: one decoded message body as a `Read`, trailers via [`TrailerSlot`]
//! - [`PayloadWriter`]: one framed message body as a `Write`

mod framed_reader;
mod payload_reader;
mod payload_writer;

pub use framed_reader::{FrameSource, FramedReader};
pub use payload_reader::{PayloadReader, TrailerSlot};
pub use payload_writer::PayloadWriter;

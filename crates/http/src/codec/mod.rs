//! HTTP codec module for encoding and decoding HTTP/1.x messages
//!
//! The codecs implement the `tokio_util::codec` traits over `BytesMut` and hold no I/O
//! of their own, the [`io`](crate::io) module drives them over blocking streams.
//!
//! # Architecture
//!
//! - Heads, via the [`header`] module:
//!   - [`RequestHeadDecoder`] / [`ResponseHeadDecoder`]: parse a head and resolve the
//!     [`PayloadSize`](crate::protocol::PayloadSize) of the body that follows
//!   - [`RequestHeadEncoder`] / [`ResponseHeadEncoder`]: serialize a head with framing
//!     headers that match the body
//!
//! - Payloads, via the [`body`] module:
//!   - [`PayloadDecoder`]: content-length, chunked (with trailers) or until-eof bodies
//!   - [`PayloadEncoder`]: the same framings on the way out
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use intercept_http::codec::{PayloadDecoder, RequestHeadDecoder};
//! use tokio_util::codec::Decoder;
//!
//! let mut buffer = BytesMut::from("POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n");
//! let (header, payload_size) = RequestHeadDecoder.decode(&mut buffer).unwrap().unwrap();
//! assert_eq!(header.path(), "/");
//!
//! let mut payload_decoder = PayloadDecoder::from(payload_size);
//! let chunk = payload_decoder.decode(&mut buffer).unwrap().unwrap();
//! assert_eq!(&chunk.into_bytes().unwrap()[..], b"abc");
//! ```

mod body;
mod header;

pub use body::{ChunkedDecoder, ChunkedEncoder, LengthDecoder, LengthEncoder, PayloadDecoder, PayloadEncoder, UntilEofDecoder};
pub use header::{RequestHeadDecoder, RequestHeadEncoder, ResponseHeadDecoder, ResponseHeadEncoder};

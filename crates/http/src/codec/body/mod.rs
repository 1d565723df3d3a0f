//! HTTP body handling module for processing message payloads
//!
//! This module provides functionality for encoding and decoding HTTP message bodies
//! using different transfer strategies.
//!
//! # Components
//!
//! ## Decoders
//! - [`ChunkedDecoder`]: Handles chunked transfer encoded payloads, including trailers
//! - [`LengthDecoder`]: Processes fixed-length payloads
//! - [`UntilEofDecoder`]: Reads a response body until the connection closes
//! - [`PayloadDecoder`]: Main decoder that coordinates different decoding strategies
//!
//! ## Encoders
//! - [`ChunkedEncoder`]: Implements chunked transfer encoding, including trailers
//! - [`LengthEncoder`]: Handles fixed-length payload encoding
//! - [`PayloadEncoder`]: Main encoder that manages different encoding strategies

mod chunked_decoder;
mod chunked_encoder;
mod length_decoder;
mod length_encoder;
mod payload_decoder;
mod payload_encoder;
mod until_eof_decoder;

pub use chunked_decoder::ChunkedDecoder;
pub use chunked_encoder::ChunkedEncoder;
pub use length_decoder::LengthDecoder;
pub use length_encoder::LengthEncoder;
pub use payload_decoder::PayloadDecoder;
pub use payload_encoder::PayloadEncoder;
pub use until_eof_decoder::UntilEofDecoder;

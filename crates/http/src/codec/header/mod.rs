//! HTTP head processing module for encoding and decoding message heads
//!
//! This module handles the start line and header fields of both requests and responses,
//! in both directions: the proxy decodes requests from clients and responses from
//! upstream servers, and encodes the opposite pair.
//!
//! # Components
//!
//! - [`RequestHeadDecoder`]: Decodes a request head and resolves its body framing
//! - [`ResponseHeadDecoder`]: Decodes a response head, framing depends on the request method
//! - [`ResponseHeadEncoder`]: Encodes a response head with consistent framing headers
//! - [`RequestHeadEncoder`]: Encodes a request head with consistent framing headers
//!
//! # Features
//!
//! - Header size and count limits
//! - Content-Length and Transfer-Encoding validation
//! - Interim `1xx` responses skipped while waiting for the final one

mod header_decoder;
mod header_encoder;

pub use header_decoder::{RequestHeadDecoder, ResponseHeadDecoder};
pub use header_encoder::{RequestHeadEncoder, ResponseHeadEncoder};

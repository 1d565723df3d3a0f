//! A blocking HTTP/1.1 codec for intercepting proxies
//!
//! This crate provides the message level half of an HTTP proxy: parsing request and
//! response heads, decoding and re-encoding bodies in every HTTP/1.1 framing, and
//! adapters that run those codecs over plain `std::io` streams. It does no socket
//! handling of its own.
//!
//! # Features
//!
//! - HTTP/1.0 and HTTP/1.1 heads, in both directions
//! - Content-Length, chunked and read-until-close bodies
//! - Chunked trailers, decoded and re-emitted
//! - Framing headers kept consistent with the body actually sent
//! - Explicit errors for oversized heads, oversized chunks and truncated bodies
//!
//! # Example
//!
//! ```
//! use std::io::{Cursor, Read, Write};
//! use http::HeaderMap;
//! use intercept_http::codec::{PayloadDecoder, RequestHeadDecoder};
//! use intercept_http::io::{FramedReader, PayloadReader, PayloadWriter};
//!
//! let wire = b"POST /echo HTTP/1.1\r\nHost: example.com\r\nContent-Length: 5\r\n\r\nhello".to_vec();
//! let mut framed = FramedReader::new(Cursor::new(wire));
//!
//! let (header, payload_size) = framed.decode(&mut RequestHeadDecoder).unwrap().unwrap();
//! assert_eq!(header.path(), "/echo");
//!
//! let mut body = String::new();
//! PayloadReader::new(&mut framed, PayloadDecoder::from(payload_size)).read_to_string(&mut body).unwrap();
//!
//! let mut writer = PayloadWriter::chunked(Vec::new(), 1024);
//! writer.write_all(body.as_bytes()).unwrap();
//! let encoded = writer.finish(HeaderMap::new()).unwrap();
//! assert_eq!(&encoded[..], b"5\r\nhello\r\n0\r\n\r\n");
//! ```
//!
//! # Architecture
//!
//! - [`protocol`]: message heads, payload framing information and error types
//! - [`codec`]: `tokio_util::codec` decoders and encoders for heads and payloads
//! - [`io`]: blocking readers and writers driving the codecs
//!
//! ## Error Handling
//!
//! - [`protocol::HttpError`]: Top-level error type
//! - [`protocol::ParseError`]: Message parsing errors
//! - [`protocol::SendError`]: Message sending errors
//!
//! Both convert into `std::io::Error` when they travel through `Read` or `Write`, keeping
//! protocol failures apart from a plain end of stream.
//!
//! # Limitations
//!
//! - HTTP/1.x only (HTTP/2 or HTTP/3 is not supported)
//! - Maximum header size: 8KB
//! - Maximum number of headers: 64

pub mod codec;
pub mod io;
pub mod protocol;

mod utils;
pub(crate) use utils::ensure;

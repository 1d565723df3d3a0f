//! HTTP head encoders for serializing request and response heads
//!
//! This module encodes a message head into raw bytes. The framing headers are rewritten
//! from the [`PayloadSize`] the body will actually be sent with, so the head can never
//! disagree with the body that follows it.
//!
//! # Features
//!
//! - Status line or request line serialization for HTTP/1.0 and HTTP/1.1
//! - Content-Length and Transfer-Encoding kept consistent with the payload framing
//! - Header order and repeated fields preserved

use crate::protocol::headers::force_chunked;
use crate::protocol::{PayloadSize, RequestHeader, ResponseHead, SendError, status_forbids_body};

use bytes::{BufMut, BytesMut};

use http::{HeaderMap, HeaderValue, Version, header};
use std::io;
use std::io::{ErrorKind, Write};
use tokio_util::codec::Encoder;
use tracing::error;

/// Initial buffer size allocated for header serialization
const INIT_HEADER_SIZE: usize = 4 * 1024;

/// Encoder for HTTP response heads implementing the [`Encoder`] trait.
///
/// This encoder serializes a [`ResponseHead`] and [`PayloadSize`] into raw bytes,
/// rewriting Content-Length or Transfer-Encoding based on the payload size.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResponseHeadEncoder;

impl Encoder<(ResponseHead, PayloadSize)> for ResponseHeadEncoder {
    type Error = SendError;

    /// Encodes an HTTP response head into the provided bytes buffer.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - HTTP version is not supported (only HTTP/1.0 and HTTP/1.1 are)
    /// - The payload size can't be expressed for this response
    fn encode(&mut self, item: (ResponseHead, PayloadSize), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (mut header, payload_size) = item;

        dst.reserve(INIT_HEADER_SIZE);
        let version = version_str(header.version())?;
        write!(
            FastWrite(dst),
            "{} {} {}\r\n",
            version,
            header.status().as_str(),
            header.status().canonical_reason().unwrap_or("")
        )?;

        let allows_body = !status_forbids_body(header.status());
        let http_10 = header.version() == Version::HTTP_10;
        let headers = header.headers_mut();
        match payload_size {
            PayloadSize::Length(n) => set_length(headers, n),
            PayloadSize::Chunked if http_10 => {
                return Err(SendError::invalid_body("chunked transfer coding is not available for HTTP/1.0"));
            }
            PayloadSize::Chunked => force_chunked(headers),
            PayloadSize::UntilEof => {
                headers.remove(header::CONTENT_LENGTH);
                headers.remove(header::TRANSFER_ENCODING);
            }
            // a bodiless response to HEAD keeps the framing headers of the entity it describes
            PayloadSize::Empty => {
                if allows_body && !headers.contains_key(header::CONTENT_LENGTH) && !headers.contains_key(header::TRANSFER_ENCODING) {
                    const ZERO_VALUE: HeaderValue = HeaderValue::from_static("0");
                    headers.insert(header::CONTENT_LENGTH, ZERO_VALUE);
                }
            }
        }

        write_headers(header.headers(), dst);
        Ok(())
    }
}

/// Encoder for HTTP request heads sent to an upstream server.
///
/// The request target is written as it is found in the uri, callers convert it to
/// origin-form first when talking to an origin server.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestHeadEncoder;

impl Encoder<(RequestHeader, PayloadSize)> for RequestHeadEncoder {
    type Error = SendError;

    fn encode(&mut self, item: (RequestHeader, PayloadSize), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (mut header, payload_size) = item;

        dst.reserve(INIT_HEADER_SIZE);
        let version = version_str(header.version())?;
        write!(FastWrite(dst), "{} {} {}\r\n", header.method().as_str(), header.uri(), version)?;

        let headers = header.headers_mut();
        match payload_size {
            PayloadSize::Length(n) => set_length(headers, n),
            PayloadSize::Chunked => force_chunked(headers),
            PayloadSize::UntilEof => {
                error!("request body can't be delimited by closing the connection");
                return Err(SendError::invalid_body("request body without framing"));
            }
            PayloadSize::Empty => {
                headers.remove(header::TRANSFER_ENCODING);
                if let Some(value) = headers.get_mut(header::CONTENT_LENGTH) {
                    *value = 0.into();
                }
            }
        }

        write_headers(header.headers(), dst);
        Ok(())
    }
}

fn version_str(version: Version) -> Result<&'static str, SendError> {
    match version {
        Version::HTTP_11 => Ok("HTTP/1.1"),
        Version::HTTP_10 => Ok("HTTP/1.0"),
        v => {
            error!(http_version = ?v, "unsupported http version");
            Err(io::Error::from(ErrorKind::Unsupported).into())
        }
    }
}

fn set_length(headers: &mut HeaderMap, n: u64) {
    headers.remove(header::TRANSFER_ENCODING);
    headers.insert(header::CONTENT_LENGTH, n.into());
}

fn write_headers(headers: &HeaderMap, dst: &mut BytesMut) {
    for (header_name, header_value) in headers.iter() {
        dst.put_slice(header_name.as_ref());
        dst.put_slice(b": ");
        dst.put_slice(header_value.as_ref());
        dst.put_slice(b"\r\n");
    }
    dst.put_slice(b"\r\n");
}

/// Fast writer implementation for writing to BytesMut.
///
/// Writes go straight into the reserved space of the buffer.
struct FastWrite<'a>(&'a mut BytesMut);

impl Write for FastWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

//! HTTP head decoders for requests and responses
//!
//! This module parses the head of an HTTP message (start line plus header fields) into
//! the typed `http` structures and resolves how the body that follows is framed.
//!
//! # Features
//!
//! - Header parsing using `httparse`
//! - Support for HTTP/1.0 and HTTP/1.1
//! - Built-in protection against oversized heads
//! - Payload framing resolved from Transfer-Encoding and Content-Length
//!
//! # Limits
//!
//! - Maximum number of headers: 64
//! - Maximum head size: 8KB

use bytes::BytesMut;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Version};
use httparse::{Error, Status};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::ensure;

use crate::protocol::headers::{request_payload_size, response_payload_size};
use crate::protocol::{ParseError, PayloadSize, RequestHeader, ResponseHead};

/// Maximum number of headers allowed in a message
const MAX_HEADER_NUM: usize = 64;

/// Maximum size in bytes allowed for the entire head section
const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Decoder for HTTP request heads implementing the [`Decoder`] trait.
///
/// This decoder parses raw bytes into a structured [`RequestHeader`] and determines the
/// [`PayloadSize`] of the body based on the Content-Length and Transfer-Encoding headers.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestHeadDecoder;

impl Decoder for RequestHeadDecoder {
    type Item = (RequestHeader, PayloadSize);
    type Error = ParseError;

    /// Attempts to decode a request head from the provided bytes buffer.
    ///
    /// # Returns
    ///
    /// - `Ok(Some((header, payload_size)))` if a complete head was successfully parsed
    /// - `Ok(None)` if more data is needed
    /// - `Err(ParseError)` if parsing failed
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_NUM];
        let mut req = httparse::Request::new(&mut headers);

        let parsed_result = req.parse(src).map_err(|e| match e {
            Error::TooManyHeaders => ParseError::too_many_headers(MAX_HEADER_NUM),
            e => ParseError::invalid_header(e.to_string()),
        });

        match parsed_result? {
            Status::Complete(body_offset) => {
                trace!(head_size = body_offset, "parsed request head");
                ensure!(body_offset <= MAX_HEADER_BYTES, ParseError::too_large_header(body_offset, MAX_HEADER_BYTES));

                let version = parse_version(req.version)?;

                let mut header_builder = Request::builder()
                    .method(Method::from_bytes(req.method.ok_or(ParseError::InvalidMethod)?.as_bytes()).map_err(|_| ParseError::InvalidMethod)?)
                    .uri(req.path.ok_or(ParseError::InvalidUri)?)
                    .version(version);

                if let Some(header_map) = header_builder.headers_mut() {
                    copy_headers(req.headers, header_map)?;
                }

                let header = RequestHeader::from(header_builder.body(()).map_err(|_| ParseError::InvalidUri)?);
                let payload_size = request_payload_size(header.headers())?;

                let _ = src.split_to(body_offset);
                Ok(Some((header, payload_size)))
            }
            Status::Partial => {
                ensure!(src.len() <= MAX_HEADER_BYTES, ParseError::too_large_header(src.len(), MAX_HEADER_BYTES));
                Ok(None)
            }
        }
    }
}

/// Decoder for HTTP response heads read back from an upstream server.
///
/// The request method is needed to frame the body: a response to `HEAD` never has one.
/// Interim `1xx` responses other than `101 Switching Protocols` are consumed and skipped.
#[derive(Debug, Clone)]
pub struct ResponseHeadDecoder {
    head_request: bool,
}

impl ResponseHeadDecoder {
    pub fn for_request(method: &Method) -> Self {
        Self { head_request: method == Method::HEAD }
    }
}

impl Decoder for ResponseHeadDecoder {
    type Item = (ResponseHead, PayloadSize);
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.is_empty() {
                return Ok(None);
            }

            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_NUM];
            let mut resp = httparse::Response::new(&mut headers);

            let parsed_result = resp.parse(src).map_err(|e| match e {
                Error::TooManyHeaders => ParseError::too_many_headers(MAX_HEADER_NUM),
                e => ParseError::invalid_header(e.to_string()),
            });

            match parsed_result? {
                Status::Complete(body_offset) => {
                    trace!(head_size = body_offset, "parsed response head");
                    ensure!(body_offset <= MAX_HEADER_BYTES, ParseError::too_large_header(body_offset, MAX_HEADER_BYTES));

                    let version = parse_version(resp.version)?;
                    let status = resp.code.map(StatusCode::from_u16).ok_or(ParseError::InvalidStatus)?.map_err(|_| ParseError::InvalidStatus)?;

                    if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
                        trace!(status = status.as_u16(), "skip interim response");
                        let _ = src.split_to(body_offset);
                        continue;
                    }

                    let mut builder = Response::builder().status(status).version(version);
                    if let Some(header_map) = builder.headers_mut() {
                        copy_headers(resp.headers, header_map)?;
                    }
                    let head = builder.body(()).map_err(|_| ParseError::InvalidStatus)?;
                    let payload_size = response_payload_size(status, self.head_request, head.headers())?;

                    let _ = src.split_to(body_offset);
                    return Ok(Some((head, payload_size)));
                }
                Status::Partial => {
                    ensure!(src.len() <= MAX_HEADER_BYTES, ParseError::too_large_header(src.len(), MAX_HEADER_BYTES));
                    return Ok(None);
                }
            }
        }
    }
}

fn parse_version(version: Option<u8>) -> Result<Version, ParseError> {
    match version {
        Some(0) => Ok(Version::HTTP_10),
        Some(1) => Ok(Version::HTTP_11),
        // Currently HTTP/2 and HTTP/3 not supported
        _ => Err(ParseError::InvalidVersion(version)),
    }
}

fn copy_headers(parsed: &[httparse::Header<'_>], headers: &mut HeaderMap) -> Result<(), ParseError> {
    headers.reserve(parsed.len());
    for header in parsed {
        let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(ParseError::invalid_header)?;
        let value = HeaderValue::from_bytes(header.value).map_err(ParseError::invalid_header)?;
        headers.append(name, value);
    }
    Ok(())
}

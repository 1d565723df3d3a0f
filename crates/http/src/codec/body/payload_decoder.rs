//! Decoder implementation for HTTP message payloads.
//!
//! This module provides a unified decoder for handling different types of HTTP message bodies:
//! - Content-Length based payloads
//! - Chunked transfer encoding
//! - Response bodies delimited by connection close
//! - Messages with no body
//!
//! The decoder is picked from the [`PayloadSize`] resolved out of the message headers.

use crate::codec::body::chunked_decoder::ChunkedDecoder;
use crate::codec::body::length_decoder::LengthDecoder;
use crate::codec::body::until_eof_decoder::UntilEofDecoder;
use crate::protocol::{ParseError, PayloadItem, PayloadSize};
use bytes::BytesMut;
use http::HeaderMap;
use tokio_util::codec::Decoder;

/// A unified decoder for handling HTTP message payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadDecoder {
    /// The specific decoding strategy to use
    kind: Kind,
}

/// Enum representing different payload decoding strategies.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    /// Decode payload with a fixed content length
    Length(LengthDecoder),

    /// Decode payload using chunked transfer encoding
    Chunked(ChunkedDecoder),

    /// Decode payload until the stream ends
    UntilEof(UntilEofDecoder),

    /// Handle messages with no body
    NoBody,
}

impl PayloadDecoder {
    /// Creates a PayloadDecoder for messages with no body.
    pub fn empty() -> Self {
        Self { kind: Kind::NoBody }
    }

    /// Creates a PayloadDecoder for chunked transfer encoding.
    pub fn chunked() -> Self {
        Self { kind: Kind::Chunked(ChunkedDecoder::new()) }
    }

    /// Creates a PayloadDecoder for a fixed-length payload.
    pub fn fix_length(size: u64) -> Self {
        Self { kind: Kind::Length(LengthDecoder::new(size)) }
    }

    /// Creates a PayloadDecoder reading until the stream ends.
    pub fn until_eof() -> Self {
        Self { kind: Kind::UntilEof(UntilEofDecoder::new()) }
    }

    /// Builds the decoder for `payload_size`, capping declared chunk sizes at `max_chunk_size`.
    pub fn with_max_chunk_size(payload_size: PayloadSize, max_chunk_size: Option<u64>) -> Self {
        match (payload_size, max_chunk_size) {
            (PayloadSize::Chunked, Some(max)) => Self { kind: Kind::Chunked(ChunkedDecoder::with_max_chunk_size(max)) },
            (payload_size, _) => payload_size.into(),
        }
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self.kind, Kind::Chunked(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.kind, Kind::NoBody)
    }

    pub fn is_fix_length(&self) -> bool {
        matches!(self.kind, Kind::Length(_))
    }

    /// Takes the trailer fields of a finished chunked payload, empty for other framings.
    pub fn take_trailers(&mut self) -> HeaderMap {
        match &mut self.kind {
            Kind::Chunked(decoder) => decoder.take_trailers(),
            _ => HeaderMap::new(),
        }
    }
}

impl From<PayloadSize> for PayloadDecoder {
    fn from(payload_size: PayloadSize) -> Self {
        match payload_size {
            PayloadSize::Length(length) => PayloadDecoder::fix_length(length),
            PayloadSize::Chunked => PayloadDecoder::chunked(),
            PayloadSize::UntilEof => PayloadDecoder::until_eof(),
            PayloadSize::Empty => PayloadDecoder::empty(),
        }
    }
}

/// Delegates to the appropriate decoder based on the payload type.
impl Decoder for PayloadDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match &mut self.kind {
            Kind::Length(length_decoder) => length_decoder.decode(src),
            Kind::Chunked(chunked_decoder) => chunked_decoder.decode(src),
            Kind::UntilEof(until_eof_decoder) => until_eof_decoder.decode(src),
            Kind::NoBody => Ok(Some(PayloadItem::Eof)),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match &mut self.kind {
            Kind::Length(length_decoder) => length_decoder.decode_eof(src),
            Kind::Chunked(chunked_decoder) => chunked_decoder.decode_eof(src),
            Kind::UntilEof(until_eof_decoder) => until_eof_decoder.decode_eof(src),
            Kind::NoBody => Ok(Some(PayloadItem::Eof)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_decoder_from_size() {
        assert!(PayloadDecoder::from(PayloadSize::Chunked).is_chunked());
        assert!(PayloadDecoder::from(PayloadSize::Length(3)).is_fix_length());
        assert!(PayloadDecoder::from(PayloadSize::Empty).is_empty());
    }

    #[test]
    fn no_body_is_immediately_eof() {
        let mut decoder = PayloadDecoder::empty();
        let mut buffer = BytesMut::from(&b"GET / HTTP/1.1\r\n"[..]);
        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
        assert_eq!(buffer.len(), 16);
    }

    #[test]
    fn chunked_trailers_are_exposed() {
        let mut decoder = PayloadDecoder::with_max_chunk_size(PayloadSize::Chunked, Some(16));
        let mut buffer = BytesMut::from(&b"1\r\na\r\n0\r\nexpires: never\r\n\r\n"[..]);
        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_chunk());
        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
        assert_eq!(decoder.take_trailers().get("expires").unwrap(), "never");
    }
}

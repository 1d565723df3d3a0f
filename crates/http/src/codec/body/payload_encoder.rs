use crate::codec::body::chunked_encoder::ChunkedEncoder;
use crate::codec::body::length_encoder::LengthEncoder;
use crate::protocol::{PayloadItem, PayloadSize, SendError};
use bytes::{Buf, BytesMut};
use http::HeaderMap;

use tokio_util::codec::Encoder;

/// encode payload for a message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadEncoder {
    kind: Kind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    /// content-length payload
    Length(LengthEncoder),

    /// transfer-encoding chunked payload
    Chunked(ChunkedEncoder),

    /// payload delimited by closing the connection, bytes pass unframed
    Raw { eof: bool },

    /// have no body with the message
    NoBody,
}

impl PayloadEncoder {
    /// create an empty `PayloadEncoder`
    pub fn empty() -> Self {
        Self { kind: Kind::NoBody }
    }

    /// create a chunked `PayloadEncoder`
    pub fn chunked() -> Self {
        Self { kind: Kind::Chunked(ChunkedEncoder::new()) }
    }

    /// create a fixed length `PayloadEncoder`
    pub fn fix_length(size: u64) -> Self {
        Self { kind: Kind::Length(LengthEncoder::new(size)) }
    }

    /// create a `PayloadEncoder` for a body that ends with the connection
    pub fn raw() -> Self {
        Self { kind: Kind::Raw { eof: false } }
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

    pub fn is_finish(&self) -> bool {
        match &self.kind {
            Kind::Length(encoder) => encoder.is_finish(),
            Kind::Chunked(encoder) => encoder.is_finish(),
            Kind::Raw { eof } => *eof,
            Kind::NoBody => true,
        }
    }

    /// Trailer fields to emit after the last chunk, `None` unless the payload is chunked.
    pub fn trailers_mut(&mut self) -> Option<&mut HeaderMap> {
        match &mut self.kind {
            Kind::Chunked(encoder) => Some(encoder.trailers_mut()),
            _ => None,
        }
    }
}

impl From<PayloadSize> for PayloadEncoder {
    fn from(payload_size: PayloadSize) -> Self {
        match payload_size {
            PayloadSize::Length(size) => PayloadEncoder::fix_length(size),
            PayloadSize::Chunked => PayloadEncoder::chunked(),
            PayloadSize::UntilEof => PayloadEncoder::raw(),
            PayloadSize::Empty => PayloadEncoder::empty(),
        }
    }
}

impl<D: Buf> Encoder<PayloadItem<D>> for PayloadEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match &mut self.kind {
            Kind::Length(encoder) => encoder.encode(item, dst),
            Kind::Chunked(encoder) => encoder.encode(item, dst),
            Kind::Raw { eof } => {
                match item {
                    PayloadItem::Chunk(mut bytes) => {
                        while bytes.has_remaining() {
                            let chunk = bytes.chunk();
                            let len = chunk.len();
                            dst.extend_from_slice(chunk);
                            bytes.advance(len);
                        }
                    }
                    PayloadItem::Eof => *eof = true,
                }
                Ok(())
            }
            Kind::NoBody => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn only_chunked_has_trailers() {
        assert!(PayloadEncoder::chunked().trailers_mut().is_some());
        assert!(PayloadEncoder::fix_length(3).trailers_mut().is_none());
        assert!(PayloadEncoder::empty().trailers_mut().is_none());
    }

    #[test]
    fn no_body_writes_nothing() {
        let mut encoder = PayloadEncoder::from(PayloadSize::Empty);
        let mut dst = BytesMut::new();
        encoder.encode(PayloadItem::Chunk(Bytes::from_static(b"ignored")), &mut dst).unwrap();
        assert!(dst.is_empty());
        assert!(encoder.is_finish());
    }

    #[test]
    fn raw_passes_bytes() {
        let mut encoder = PayloadEncoder::from(PayloadSize::UntilEof);
        let mut dst = BytesMut::new();
        encoder.encode(PayloadItem::Chunk(Bytes::from_static(b"as is")), &mut dst).unwrap();
        assert!(!encoder.is_finish());
        encoder.encode(PayloadItem::<Bytes>::Eof, &mut dst).unwrap();
        assert_eq!(&dst[..], b"as is");
        assert!(encoder.is_finish());
    }
}

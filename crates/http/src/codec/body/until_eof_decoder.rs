//! Decoder for response bodies delimited by the peer closing the connection.

use crate::protocol::{ParseError, PayloadItem};
use bytes::BytesMut;
use tokio_util::codec::Decoder;

/// Hands out everything it is given, the body ends when the underlying stream does.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UntilEofDecoder {
    eof: bool,
}

impl UntilEofDecoder {
    pub fn new() -> Self {
        Self { eof: false }
    }
}

impl Decoder for UntilEofDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.eof {
            return Ok(Some(PayloadItem::Eof));
        }
        if src.is_empty() {
            return Ok(None);
        }
        Ok(Some(PayloadItem::Chunk(src.split().freeze())))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        self.eof = true;
        Ok(Some(PayloadItem::Eof))
    }
}

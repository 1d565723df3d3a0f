//! Bodies framed by `Content-Length`.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::protocol::{ParseError, PayloadItem};

/// Yields whatever part of the body is buffered, never more than is still owed.
///
/// Bytes beyond the declared length stay in the buffer, they belong to the next message
/// on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthDecoder {
    remaining: u64,
}

impl LengthDecoder {
    pub fn new(length: u64) -> Self {
        Self { remaining: length }
    }

    /// Bytes of the body not decoded yet.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl Decoder for LengthDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.remaining == 0 {
            return Ok(Some(PayloadItem::Eof));
        }
        if src.is_empty() {
            return Ok(None);
        }

        let take = usize::try_from(self.remaining).map_or(src.len(), |remaining| remaining.min(src.len()));
        let chunk = src.split_to(take).freeze();
        self.remaining -= chunk.len() as u64;
        Ok(Some(PayloadItem::Chunk(chunk)))
    }

    /// The peer closed before sending `Content-Length` bytes.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decode(src)?.map_or(Err(ParseError::UnexpectedEof), |item| Ok(Some(item)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaves_next_message_in_buffer() {
        let mut buffer = BytesMut::from(&b"hello worldGET / HTTP/1.1\r\n"[..]);
        let mut decoder = LengthDecoder::new(11);

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap().into_bytes().unwrap();
        assert_eq!(&chunk[..], b"hello world");
        assert_eq!(decoder.remaining(), 0);
        assert_eq!(&buffer[..], b"GET / HTTP/1.1\r\n");
        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
    }

    #[test]
    fn partial_body_waits_for_more() {
        let mut buffer = BytesMut::from(&b"abc"[..]);
        let mut decoder = LengthDecoder::new(5);

        assert_eq!(decoder.decode(&mut buffer).unwrap().unwrap().as_bytes().unwrap().len(), 3);
        assert_eq!(decoder.remaining(), 2);
        assert!(decoder.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(b"de");
        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_chunk());
        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
    }

    #[test]
    fn truncated_body() {
        let mut buffer = BytesMut::from(&b"ab"[..]);
        let mut decoder = LengthDecoder::new(3);

        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_chunk());
        assert!(matches!(decoder.decode_eof(&mut buffer), Err(ParseError::UnexpectedEof)));
    }
}

//! Encoder implementation for HTTP chunked transfer encoding.
//!
//! Every data item becomes one `<HEX-SIZE>\r\n<data>\r\n` chunk. The end of stream
//! emits the zero-size chunk, the registered trailer fields and the final blank line.

use crate::protocol::{PayloadItem, SendError};
use bytes::{Buf, BufMut, BytesMut};
use http::HeaderMap;
use std::io::Write;

use tokio_util::codec::Encoder;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedEncoder {
    eof: bool,
    send_size: u64,
    trailers: HeaderMap,
}

impl ChunkedEncoder {
    pub fn new() -> Self {
        Self { eof: false, send_size: 0, trailers: HeaderMap::new() }
    }

    /// Trailer fields written after the zero-size chunk.
    pub fn trailers_mut(&mut self) -> &mut HeaderMap {
        &mut self.trailers
    }

    pub fn is_finish(&self) -> bool {
        self.eof
    }

    /// Total number of data bytes encoded so far, framing excluded.
    pub fn send_size(&self) -> u64 {
        self.send_size
    }
}

impl Default for ChunkedEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Buf> Encoder<PayloadItem<D>> for ChunkedEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if self.eof {
            return Ok(());
        }

        match item {
            PayloadItem::Chunk(mut bytes) => {
                // a zero-size chunk would end the stream early
                if !bytes.has_remaining() {
                    return Ok(());
                }
                let size = bytes.remaining();
                write!(helper::Writer(dst), "{size:x}\r\n")?;
                dst.reserve(size + 2);
                while bytes.has_remaining() {
                    let chunk = bytes.chunk();
                    let len = chunk.len();
                    dst.extend_from_slice(chunk);
                    bytes.advance(len);
                }
                dst.extend_from_slice(b"\r\n");
                self.send_size += size as u64;
                Ok(())
            }
            PayloadItem::Eof => {
                self.eof = true;
                dst.extend_from_slice(b"0\r\n");
                for (name, value) in &self.trailers {
                    dst.put_slice(name.as_ref());
                    dst.put_slice(b": ");
                    dst.put_slice(value.as_bytes());
                    dst.put_slice(b"\r\n");
                }
                dst.extend_from_slice(b"\r\n");
                trace!(send_size = self.send_size, trailers = self.trailers.len(), "finished chunked payload");
                Ok(())
            }
        }
    }
}

mod helper {
    use bytes::{BufMut, BytesMut};
    use std::io;

    pub struct Writer<'a>(pub &'a mut BytesMut);

    impl io::Write for Writer<'_> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.put_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn encode_chunks_and_eof() {
        let mut encoder = ChunkedEncoder::new();
        let mut dst = BytesMut::new();

        encoder.encode(PayloadItem::Chunk(Bytes::from_static(b"hello world, hello")), &mut dst).unwrap();
        encoder.encode(PayloadItem::<Bytes>::Eof, &mut dst).unwrap();

        assert_eq!(&dst[..], b"12\r\nhello world, hello\r\n0\r\n\r\n");
        assert!(encoder.is_finish());
        assert_eq!(encoder.send_size(), 18);
    }

    #[test]
    fn size_is_lowercase_hex() {
        let mut encoder = ChunkedEncoder::new();
        let mut dst = BytesMut::new();

        encoder.encode(PayloadItem::Chunk(Bytes::from_static(b"abcdefghijklmnopqrstuvwxyz")), &mut dst).unwrap();
        assert!(dst.starts_with(b"1a\r\nabcdefghijklmnopqrstuvwxyz\r\n"));
    }

    #[test]
    fn empty_chunk_is_skipped() {
        let mut encoder = ChunkedEncoder::new();
        let mut dst = BytesMut::new();

        encoder.encode(PayloadItem::Chunk(Bytes::new()), &mut dst).unwrap();
        assert!(dst.is_empty());
        assert!(!encoder.is_finish());
    }

    #[test]
    fn trailers_follow_last_chunk() {
        let mut encoder = ChunkedEncoder::new();
        encoder.trailers_mut().insert("x-checksum", "abc".parse().unwrap());
        let mut dst = BytesMut::new();

        encoder.encode(PayloadItem::Chunk(Bytes::from_static(b"a")), &mut dst).unwrap();
        encoder.encode(PayloadItem::<Bytes>::Eof, &mut dst).unwrap();
        // nothing after eof
        encoder.encode(PayloadItem::Chunk(Bytes::from_static(b"b")), &mut dst).unwrap();

        assert_eq!(&dst[..], b"1\r\na\r\n0\r\nx-checksum: abc\r\n\r\n");
    }
}

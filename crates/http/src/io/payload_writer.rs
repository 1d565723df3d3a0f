//! Writes one message body with the framing resolved for it.

use std::io;
use std::io::Write;

use bytes::BytesMut;
use http::HeaderMap;
use tokio_util::codec::Encoder;
use tracing::{trace, warn};

use crate::codec::PayloadEncoder;
use crate::protocol::{PayloadItem, PayloadSize};

const DEFAULT_BLOCK_SIZE: usize = 8 * 1024;

/// A [`Write`] that frames everything written to it.
///
/// Written bytes are collected up to `block_size` and handed to the [`PayloadEncoder`] as
/// one item, so a chunked body gets chunks of at most that size no matter how small the
/// individual writes are. [`flush`](Write::flush) emits the partial block.
///
/// [`finish`](PayloadWriter::finish) must be called to end the body. Dropping the writer
/// instead leaves a chunked body without its terminal chunk.
#[derive(Debug)]
pub struct PayloadWriter<W: Write> {
    inner: W,
    encoder: PayloadEncoder,
    pending: BytesMut,
    encoded: BytesMut,
    block_size: usize,
}

impl<W: Write> PayloadWriter<W> {
    pub fn new(inner: W, payload_size: PayloadSize) -> Self {
        Self::with_block_size(inner, payload_size, DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(inner: W, payload_size: PayloadSize, block_size: usize) -> Self {
        let block_size = block_size.max(1);
        Self {
            inner,
            encoder: PayloadEncoder::from(payload_size),
            pending: BytesMut::with_capacity(block_size),
            encoded: BytesMut::new(),
            block_size,
        }
    }

    /// A writer producing the chunked transfer coding.
    pub fn chunked(inner: W, block_size: usize) -> Self {
        Self::with_block_size(inner, PayloadSize::Chunked, block_size)
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    fn emit_pending(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let block = self.pending.split().freeze();
        trace!(size = block.len(), "emit payload block");
        self.encoder.encode(PayloadItem::Chunk(block), &mut self.encoded).map_err(|e| e.into_io())?;
        self.write_encoded()
    }

    fn write_encoded(&mut self) -> io::Result<()> {
        if !self.encoded.is_empty() {
            self.inner.write_all(&self.encoded)?;
            self.encoded.clear();
        }
        Ok(())
    }

    /// Ends the body: the last partial block, then for chunked bodies the zero-size chunk,
    /// `trailers` and the closing blank line. Returns the inner writer, flushed.
    ///
    /// Trailers can only travel with a chunked body, for any other framing they are
    /// dropped.
    pub fn finish(mut self, trailers: HeaderMap) -> io::Result<W> {
        self.emit_pending()?;
        match self.encoder.trailers_mut() {
            Some(slot) => *slot = trailers,
            None if !trailers.is_empty() => warn!(count = trailers.len(), "drop trailers of a body that is not chunked"),
            None => {}
        }
        self.encoder.encode(PayloadItem::<bytes::Bytes>::Eof, &mut self.encoded).map_err(|e| e.into_io())?;
        self.write_encoded()?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for PayloadWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let room = self.block_size - self.pending.len();
        let len = room.min(buf.len());
        self.pending.extend_from_slice(&buf[..len]);
        if self.pending.len() >= self.block_size {
            self.emit_pending()?;
        }
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.emit_pending()?;
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PayloadDecoder;
    use crate::io::{FramedReader, PayloadReader};
    use std::io::{Cursor, Read};

    fn chunked_round_trip(len: usize, block_size: usize) {
        let body: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let mut writer = PayloadWriter::chunked(Vec::new(), block_size);
        writer.write_all(&body).unwrap();
        let wire = writer.finish(HeaderMap::new()).unwrap();

        let mut reader = PayloadReader::new(FramedReader::new(Cursor::new(wire)), PayloadDecoder::chunked());
        let mut decoded = Vec::new();
        reader.read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, body, "len {len}");
    }

    #[test]
    fn chunked_sizes_around_block() {
        let block = 16;
        for len in [0, 1, block - 1, block, block + 1, block * 5 + 3] {
            chunked_round_trip(len, block);
        }
    }

    #[test]
    fn chunks_are_block_sized() {
        let mut writer = PayloadWriter::chunked(Vec::new(), 4);
        for byte in b"abcdef" {
            writer.write_all(&[*byte]).unwrap();
        }
        let wire = writer.finish(HeaderMap::new()).unwrap();
        assert_eq!(&wire[..], b"4\r\nabcd\r\n2\r\nef\r\n0\r\n\r\n");
    }

    #[test]
    fn trailers_round_trip() {
        let mut trailers = HeaderMap::new();
        trailers.insert("x-digest", "sha-256=abc".parse().unwrap());
        trailers.insert("x-count", "2".parse().unwrap());

        let mut writer = PayloadWriter::chunked(Vec::new(), 8);
        writer.write_all(b"payload").unwrap();
        let wire = writer.finish(trailers).unwrap();

        let mut reader = PayloadReader::new(FramedReader::new(Cursor::new(wire)), PayloadDecoder::chunked());
        let slot = reader.trailer_slot();
        reader.read_to_end(&mut Vec::new()).unwrap();
        let decoded = slot.take().unwrap();
        assert_eq!(decoded.get("x-digest").unwrap(), "sha-256=abc");
        assert_eq!(decoded.get("x-count").unwrap(), "2");
    }

    #[test]
    fn flush_emits_partial_block() {
        let mut writer = PayloadWriter::chunked(Vec::new(), 1024);
        writer.write_all(b"hi").unwrap();
        writer.flush().unwrap();
        assert_eq!(&writer.get_ref()[..], b"2\r\nhi\r\n");
    }

    #[test]
    fn length_body_must_match() {
        let mut writer = PayloadWriter::new(Vec::new(), PayloadSize::Length(3));
        writer.write_all(b"abc").unwrap();
        assert_eq!(&writer.finish(HeaderMap::new()).unwrap()[..], b"abc");

        let mut writer = PayloadWriter::with_block_size(Vec::new(), PayloadSize::Length(3), 2);
        assert!(writer.write_all(b"abcd").is_err());

        let writer = PayloadWriter::new(Vec::new(), PayloadSize::Length(3));
        assert!(writer.finish(HeaderMap::new()).is_err());
    }

    #[test]
    fn raw_body_is_unframed() {
        let mut writer = PayloadWriter::new(Vec::new(), PayloadSize::UntilEof);
        writer.write_all(b"until close").unwrap();
        assert_eq!(&writer.finish(HeaderMap::new()).unwrap()[..], b"until close");
    }
}

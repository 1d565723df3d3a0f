//! Blocking counterpart of `tokio_util::codec::FramedRead`.
//!
//! A [`FramedReader`] owns a read buffer in front of any [`Read`] and drives a
//! [`Decoder`] over it: read, try to decode, read more. Bytes the decoder did not consume
//! stay in the buffer for the next decoder, which is how a request head decoder hands
//! over to a payload decoder and how pipelined requests survive between exchanges.

use std::io;
use std::io::Read;

use bytes::BytesMut;
use tokio_util::codec::Decoder;
use tracing::trace;

const DEFAULT_READ_SIZE: usize = 8 * 1024;

/// Something frames can be decoded from.
///
/// Implemented by [`FramedReader`] and by mutable references to any source, so a body
/// reader can either own its source or borrow it for the length of one message.
pub trait FrameSource {
    fn next_frame<D: Decoder>(&mut self, decoder: &mut D) -> Result<Option<D::Item>, D::Error>;
}

#[derive(Debug)]
pub struct FramedReader<R> {
    inner: R,
    buffer: BytesMut,
    read_size: usize,
    eof: bool,
}

impl<R: Read> FramedReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_capacity(inner, DEFAULT_READ_SIZE)
    }

    /// `read_size` is the number of bytes asked from the inner reader on each fill.
    pub fn with_capacity(inner: R, read_size: usize) -> Self {
        Self { inner, buffer: BytesMut::with_capacity(read_size), read_size: read_size.max(1), eof: false }
    }

    /// Starts from bytes that were already read off the stream.
    pub fn with_buffer(inner: R, buffer: BytesMut, read_size: usize) -> Self {
        Self { inner, buffer, read_size: read_size.max(1), eof: false }
    }

    /// Decodes the next frame, blocking on the inner reader until one is complete.
    ///
    /// Returns `Ok(None)` only when the stream ended cleanly, that is with no partial
    /// frame left in the buffer. A stream ending in the middle of a frame is reported by
    /// the decoder's `decode_eof`.
    pub fn decode<D: Decoder>(&mut self, decoder: &mut D) -> Result<Option<D::Item>, D::Error> {
        loop {
            if self.eof {
                return decoder.decode_eof(&mut self.buffer);
            }

            // decoders that need no input, like an empty payload, finish without a read
            if let Some(frame) = decoder.decode(&mut self.buffer)? {
                return Ok(Some(frame));
            }

            let filled = self.fill()?;
            if filled == 0 {
                trace!(remaining = self.buffer.len(), "framed reader reached eof");
                self.eof = true;
            }
        }
    }

    fn fill(&mut self) -> io::Result<usize> {
        let len = self.buffer.len();
        self.buffer.resize(len + self.read_size, 0);
        let result = loop {
            match self.inner.read(&mut self.buffer[len..]) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };
        let read = *result.as_ref().unwrap_or(&0);
        self.buffer.truncate(len + read);
        result
    }

    /// Returns true once the inner reader reported the end of the stream.
    pub fn is_eof(&self) -> bool {
        self.eof
    }
}

impl<R> FramedReader<R> {
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Bytes read from the stream but not consumed by any decoder yet.
    pub fn buffer(&self) -> &BytesMut {
        &self.buffer
    }

    /// Gives up the inner reader, keeping only the unconsumed bytes.
    pub fn into_remaining(self) -> BytesMut {
        self.buffer
    }

    pub fn into_parts(self) -> (R, BytesMut) {
        (self.inner, self.buffer)
    }
}

impl<R: Read> FrameSource for FramedReader<R> {
    fn next_frame<D: Decoder>(&mut self, decoder: &mut D) -> Result<Option<D::Item>, D::Error> {
        self.decode(decoder)
    }
}

impl<T: FrameSource + ?Sized> FrameSource for &mut T {
    fn next_frame<D: Decoder>(&mut self, decoder: &mut D) -> Result<Option<D::Item>, D::Error> {
        (**self).next_frame(decoder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{PayloadDecoder, RequestHeadDecoder};
    use crate::protocol::{PayloadItem, PayloadSize};
    use indoc::indoc;
    use std::io::Cursor;

    /// Hands out at most `step` bytes per read, like a socket would.
    struct Trickle<R> {
        inner: R,
        step: usize,
    }

    impl<R: Read> Read for Trickle<R> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let len = buf.len().min(self.step);
            self.inner.read(&mut buf[..len])
        }
    }

    #[test]
    fn decodes_head_then_body() {
        let str = indoc! {r##"
        POST /upload HTTP/1.1
        Host: 127.0.0.1:8080
        Content-Length: 5

        helloGET"##};

        let mut reader = FramedReader::new(Trickle { inner: Cursor::new(str.replace('\n', "\r\n")), step: 3 });

        let (header, payload_size) = reader.decode(&mut RequestHeadDecoder).unwrap().unwrap();
        assert_eq!(header.path(), "/upload");
        assert_eq!(payload_size, PayloadSize::Length(5));

        let mut payload_decoder = PayloadDecoder::from(payload_size);
        let mut body = Vec::new();
        loop {
            match reader.decode(&mut payload_decoder).unwrap().unwrap() {
                PayloadItem::Chunk(bytes) => body.extend_from_slice(&bytes),
                PayloadItem::Eof => break,
            }
        }
        assert_eq!(body, b"hello");

        // pipelined bytes read with the body stay buffered, the rest is still in the stream
        let (mut inner, remaining) = reader.into_parts();
        assert_eq!(&remaining[..], b"G");
        let mut rest = Vec::new();
        inner.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"ET");
    }

    #[test]
    fn clean_eof_is_none() {
        let mut reader = FramedReader::new(Cursor::new(Vec::new()));
        assert!(reader.decode(&mut RequestHeadDecoder).unwrap().is_none());
        assert!(reader.is_eof());
    }

    #[test]
    fn eof_inside_head_is_error() {
        let mut reader = FramedReader::new(Cursor::new(b"GET / HTTP/1.1\r\nHost".to_vec()));
        assert!(reader.decode(&mut RequestHeadDecoder).is_err());
    }

    #[test]
    fn empty_payload_does_not_read() {
        struct Unreadable;
        impl Read for Unreadable {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                panic!("must not read")
            }
        }
        let mut reader = FramedReader::new(Unreadable);
        assert!(reader.decode(&mut PayloadDecoder::empty()).unwrap().unwrap().is_eof());
    }

    #[test]
    fn truncated_body_is_error() {
        let mut reader = FramedReader::with_buffer(Cursor::new(Vec::new()), BytesMut::from(&b"abc"[..]), 16);
        let mut decoder = PayloadDecoder::fix_length(10);
        assert!(reader.decode(&mut decoder).unwrap().unwrap().is_chunk());
        assert!(reader.decode(&mut decoder).is_err());
    }
}

//! A message body as a plain [`Read`].

use std::io;
use std::io::Read;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::{Buf, Bytes};
use http::HeaderMap;
use tracing::trace;

use crate::codec::PayloadDecoder;
use crate::io::FrameSource;
use crate::protocol::{ParseError, PayloadItem};

/// Shared hand-off point for the trailer fields of a chunked body.
///
/// The trailers only exist once the body has been read to its end, by which time the
/// reader has usually been moved into a filter chain. Whoever writes the outbound message
/// keeps a clone of the slot and takes the trailers after copying the body.
#[derive(Debug, Clone, Default)]
pub struct TrailerSlot(Arc<Mutex<Option<HeaderMap>>>);

impl TrailerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, trailers: HeaderMap) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(trailers);
    }

    pub fn take(&self) -> Option<HeaderMap> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Reads the decoded payload of one message out of a [`FrameSource`].
///
/// Reading returns `0` once the payload is complete, even if the underlying stream holds
/// more bytes (the next message). Protocol errors surface as [`io::ErrorKind::InvalidData`]
/// and a stream that ends early as [`io::ErrorKind::UnexpectedEof`].
pub struct PayloadReader<S> {
    source: S,
    decoder: PayloadDecoder,
    current: Bytes,
    finished: bool,
    trailers: TrailerSlot,
}

impl<S: FrameSource> PayloadReader<S> {
    pub fn new(source: S, decoder: PayloadDecoder) -> Self {
        Self { source, decoder, current: Bytes::new(), finished: false, trailers: TrailerSlot::new() }
    }

    /// Uses an existing slot, so trailers end up where the caller already looks for them.
    pub fn with_trailer_slot(source: S, decoder: PayloadDecoder, trailers: TrailerSlot) -> Self {
        Self { source, decoder, current: Bytes::new(), finished: false, trailers }
    }

    pub fn trailer_slot(&self) -> TrailerSlot {
        self.trailers.clone()
    }

    /// Returns true once every byte of the payload was handed out.
    pub fn is_finished(&self) -> bool {
        self.finished && self.current.is_empty()
    }

    /// Reads and discards the rest of the payload, returns how many bytes were skipped.
    pub fn drain(&mut self) -> io::Result<u64> {
        io::copy(self, &mut io::sink())
    }

    pub fn into_source(self) -> S {
        self.source
    }

    fn next_chunk(&mut self) -> io::Result<()> {
        while self.current.is_empty() && !self.finished {
            match self.source.next_frame(&mut self.decoder).map_err(ParseError::into_io)? {
                Some(PayloadItem::Chunk(bytes)) => self.current = bytes,
                Some(PayloadItem::Eof) => {
                    trace!("payload finished");
                    self.finished = true;
                    let trailers = self.decoder.take_trailers();
                    if !trailers.is_empty() {
                        self.trailers.set(trailers);
                    }
                }
                None => return Err(ParseError::UnexpectedEof.into_io()),
            }
        }
        Ok(())
    }
}

impl<S: FrameSource> Read for PayloadReader<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.next_chunk()?;
        let len = buf.len().min(self.current.len());
        buf[..len].copy_from_slice(&self.current[..len]);
        self.current.advance(len);
        Ok(len)
    }
}

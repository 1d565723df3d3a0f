//! Decoder implementation for HTTP chunked transfer encoding.
//!
//! This module decodes message bodies framed with the chunked transfer coding
//! as specified in [RFC 7230 Section 4.1](https://tools.ietf.org/html/rfc7230#section-4.1),
//! including the trailer section that may follow the last chunk.

use crate::protocol::{ParseError, PayloadItem};
use bytes::{Buf, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue};
use std::task::Poll;
use tokio_util::codec::Decoder;
use tracing::trace;
use ChunkedState::*;

/// Upper bound for the whole trailer section, same as the head limit.
const MAX_TRAILER_BYTES: usize = 8 * 1024;

/// A decoder for handling HTTP chunked transfer encoding.
///
/// The decoder processes incoming bytes according to the chunked format:
/// - Each chunk starts with its size in hexadecimal, optionally followed by `;extensions`
/// - Followed by CRLF, the chunk data and CRLF
/// - A zero-sized chunk indicates the end of the data, trailer fields may follow
/// - A blank line ends the message
///
/// Chunk data is handed out as soon as it arrives, so a chunk never has to fit in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedDecoder {
    state: ChunkedState,
    remaining_size: u64,
    size_digits: usize,
    max_chunk_size: Option<u64>,
    trailer_line: Vec<u8>,
    trailer_bytes: usize,
    trailers: HeaderMap,
}

impl ChunkedDecoder {
    /// Creates a new ChunkedDecoder instance.
    ///
    /// The decoder starts in the Size state, ready to read the size of the first chunk.
    pub fn new() -> Self {
        Self {
            state: Size,
            remaining_size: 0,
            size_digits: 0,
            max_chunk_size: None,
            trailer_line: Vec::new(),
            trailer_bytes: 0,
            trailers: HeaderMap::new(),
        }
    }

    /// Rejects any chunk declaring more than `max_chunk_size` bytes with [`ParseError::ChunkTooLarge`].
    pub fn with_max_chunk_size(max_chunk_size: u64) -> Self {
        Self { max_chunk_size: Some(max_chunk_size), ..Self::new() }
    }

    /// Returns true once the terminating blank line has been consumed.
    pub fn is_finished(&self) -> bool {
        self.state == End
    }

    /// Trailer fields collected after the last chunk.
    pub fn trailers(&self) -> &HeaderMap {
        &self.trailers
    }

    /// Takes the collected trailer fields, leaving an empty map behind.
    pub fn take_trailers(&mut self) -> HeaderMap {
        std::mem::take(&mut self.trailers)
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkedState {
    /// Read the chunk size in hex
    Size,
    /// Handle whitespace after size
    SizeLws,
    /// Skip chunk extensions
    Extension,
    /// Read LF after chunk size
    SizeLf,
    /// Read chunk data
    Body,
    /// Read CR after chunk data
    BodyCr,
    /// Read LF after chunk data
    BodyLf,
    /// Read one trailer line, an empty line ends the message
    Trailer,
    /// Read LF after a trailer line
    TrailerLf,
    /// Final state after reading the terminating blank line
    End,
}

impl Decoder for ChunkedDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    /// Decodes chunked transfer encoded data from the input buffer.
    ///
    /// # Returns
    /// - `Ok(Some(PayloadItem::Chunk(bytes)))` when chunk data is available
    /// - `Ok(Some(PayloadItem::Eof))` when the message is complete, and on every call after that
    /// - `Ok(None)` when more data is needed
    /// - `Err(ParseError)` if the chunked encoding is invalid
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if self.state == End {
                trace!("finished reading chunked data");
                return Ok(Some(PayloadItem::Eof));
            }

            if src.is_empty() {
                // need more data
                return Ok(None);
            }

            let mut buf = None;

            self.state = match self.step(src, &mut buf) {
                Poll::Pending => return Ok(None),
                Poll::Ready(Ok(new_state)) => new_state,
                Poll::Ready(Err(e)) => return Err(e),
            };

            if let Some(bytes) = buf {
                trace!(len = bytes.len(), "read chunked bytes");
                return Ok(Some(PayloadItem::Chunk(bytes)));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None => Err(ParseError::UnexpectedEof),
        }
    }
}

macro_rules! try_next_byte {
    ($src:ident) => {{
        if $src.len() > 0 {
            $src.get_u8()
        } else {
            return Poll::Pending;
        }
    }};
}

impl ChunkedDecoder {
    /// Processes the next step in the chunked decoding state machine.
    fn step(&mut self, src: &mut BytesMut, buf: &mut Option<Bytes>) -> Poll<Result<ChunkedState, ParseError>> {
        match self.state {
            Size => self.read_size(src),
            SizeLws => Self::read_size_lws(src),
            Extension => Self::read_extension(src),
            SizeLf => self.read_size_lf(src),
            Body => self.read_body(src, buf),
            BodyCr => Self::read_body_cr(src),
            BodyLf => Self::read_body_lf(src),
            Trailer => self.read_trailer(src),
            TrailerLf => self.read_trailer_lf(src),
            End => Poll::Ready(Ok(End)),
        }
    }

    /// Reads the chunk size in hexadecimal, one digit at a time.
    ///
    /// Only hex digits are accepted, there is no sign and an overflowing size is an error
    /// rather than being truncated.
    fn read_size(&mut self, src: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        let digit = match try_next_byte!(src) {
            b @ b'0'..=b'9' => b - b'0',
            b @ b'a'..=b'f' => b + 10 - b'a',
            b @ b'A'..=b'F' => b + 10 - b'A',
            b'\t' | b' ' if self.size_digits > 0 => return Poll::Ready(Ok(SizeLws)),
            b';' if self.size_digits > 0 => return Poll::Ready(Ok(Extension)),
            b'\r' if self.size_digits > 0 => return Poll::Ready(Ok(SizeLf)),
            _ => return Poll::Ready(Err(ParseError::invalid_chunk_size("invalid chunk size line"))),
        };

        let size = self.remaining_size.checked_mul(16).and_then(|size| size.checked_add(u64::from(digit)));
        match size {
            Some(size) => {
                self.remaining_size = size;
                self.size_digits += 1;
                Poll::Ready(Ok(Size))
            }
            None => Poll::Ready(Err(ParseError::invalid_chunk_size("chunk size overflow"))),
        }
    }

    /// Processes linear whitespace after the chunk size, no more digits can come.
    fn read_size_lws(src: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\t' | b' ' => Poll::Ready(Ok(SizeLws)),
            b';' => Poll::Ready(Ok(Extension)),
            b'\r' => Poll::Ready(Ok(SizeLf)),
            _ => Poll::Ready(Err(ParseError::invalid_chunk_size("invalid chunk size linear white space"))),
        }
    }

    /// Skips chunk extensions up to the CR, a bare LF inside an extension is rejected.
    fn read_extension(src: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\r' => Poll::Ready(Ok(SizeLf)),
            b'\n' => Poll::Ready(Err(ParseError::invalid_chunk_size("invalid chunk extension contains newline"))),
            _ => Poll::Ready(Ok(Extension)),
        }
    }

    /// Validates the LF ending the size line and picks body or trailer parsing.
    fn read_size_lf(&mut self, src: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\n' => {
                self.size_digits = 0;
                if self.remaining_size == 0 {
                    return Poll::Ready(Ok(Trailer));
                }
                if let Some(max_size) = self.max_chunk_size {
                    if self.remaining_size > max_size {
                        return Poll::Ready(Err(ParseError::chunk_too_large(self.remaining_size, max_size)));
                    }
                }
                Poll::Ready(Ok(Body))
            }
            _ => Poll::Ready(Err(ParseError::invalid_chunk_size("invalid chunk size LF"))),
        }
    }

    /// Reads up to the remaining chunk bytes from the buffer.
    fn read_body(&mut self, src: &mut BytesMut, buf: &mut Option<Bytes>) -> Poll<Result<ChunkedState, ParseError>> {
        // cap remaining bytes at the max capacity of usize
        let remaining = usize::try_from(self.remaining_size).unwrap_or(usize::MAX);
        let read_size = std::cmp::min(remaining, src.len());

        self.remaining_size -= read_size as u64;
        *buf = Some(src.split_to(read_size).freeze());

        if self.remaining_size > 0 { Poll::Ready(Ok(Body)) } else { Poll::Ready(Ok(BodyCr)) }
    }

    fn read_body_cr(src: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\r' => Poll::Ready(Ok(BodyLf)),
            _ => Poll::Ready(Err(ParseError::invalid_body("invalid chunk body CR"))),
        }
    }

    fn read_body_lf(src: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\n' => Poll::Ready(Ok(Size)),
            _ => Poll::Ready(Err(ParseError::invalid_body("invalid chunk body LF"))),
        }
    }

    /// Collects one trailer line up to its CR.
    fn read_trailer(&mut self, src: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\r' => Poll::Ready(Ok(TrailerLf)),
            b'\n' => Poll::Ready(Err(ParseError::invalid_header("trailer line contains bare LF"))),
            b => {
                self.trailer_bytes += 1;
                if self.trailer_bytes > MAX_TRAILER_BYTES {
                    return Poll::Ready(Err(ParseError::too_large_header(self.trailer_bytes, MAX_TRAILER_BYTES)));
                }
                self.trailer_line.push(b);
                Poll::Ready(Ok(Trailer))
            }
        }
    }

    /// An empty line ends the message, anything else must be a `name: value` field.
    fn read_trailer_lf(&mut self, src: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\n' => {
                if self.trailer_line.is_empty() {
                    return Poll::Ready(Ok(End));
                }
                let line = std::mem::take(&mut self.trailer_line);
                Poll::Ready(self.push_trailer(&line).map(|()| Trailer))
            }
            _ => Poll::Ready(Err(ParseError::invalid_header("invalid trailer end LF"))),
        }
    }

    fn push_trailer(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let Some(colon) = line.iter().position(|b| *b == b':') else {
            return Err(ParseError::invalid_header("trailer line without colon"));
        };
        let (name, value) = line.split_at(colon);

        let name = HeaderName::from_bytes(name.trim_ascii()).map_err(ParseError::invalid_header)?;
        let value = HeaderValue::from_bytes(value[1..].trim_ascii()).map_err(ParseError::invalid_header)?;
        trace!(name = %name, "read chunked trailer");
        self.trailers.append(name, value);
        Ok(())
    }
}

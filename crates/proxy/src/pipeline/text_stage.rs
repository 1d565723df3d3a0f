use std::io;
use std::io::{BufRead, BufReader, Read};

use bytes::{Buf, Bytes};
use tracing::{debug, warn};

use crate::filter::{TextFilter, TextObserver};
use crate::pipeline::Charset;

/// Runs text observers and text filters over a body, one line at a time.
///
/// Lines keep their terminator. A line longer than the configured maximum is handed over
/// in pieces; with UTF-8 a piece never ends inside a character. Lines no filter changed
/// are emitted as the original bytes.
pub struct LineFilterReader<R> {
    inner: BufReader<R>,
    charset: Charset,
    filters: Vec<Box<dyn TextFilter>>,
    observers: Vec<Box<dyn TextObserver>>,
    max_line_length: usize,
    carry: Vec<u8>,
    output: Bytes,
    passthrough: bool,
    finished: bool,
}

impl<R> std::fmt::Debug for LineFilterReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineFilterReader")
            .field("charset", &self.charset)
            .field("filters", &self.filters.len())
            .field("observers", &self.observers.len())
            .field("max_line_length", &self.max_line_length)
            .field("passthrough", &self.passthrough)
            .finish_non_exhaustive()
    }
}

impl<R: Read> LineFilterReader<R> {
    pub fn new(
        inner: R,
        charset: Charset,
        filters: Vec<Box<dyn TextFilter>>,
        observers: Vec<Box<dyn TextObserver>>,
        block_size: usize,
        max_line_length: usize,
    ) -> Self {
        Self {
            inner: BufReader::with_capacity(block_size, inner),
            charset,
            filters,
            observers,
            max_line_length: max_line_length.max(4),
            carry: Vec::new(),
            output: Bytes::new(),
            passthrough: false,
            finished: false,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.passthrough
    }

    fn fill(&mut self) -> io::Result<()> {
        let mut line = std::mem::take(&mut self.carry);
        let limit = self.max_line_length.saturating_sub(line.len()).max(1);
        let read = (&mut self.inner).take(limit as u64).read_until(b'\n', &mut line)?;

        if read == 0 {
            self.finished = true;
            if !line.is_empty() {
                self.output = self.process(line);
            }
            return Ok(());
        }

        let cut = !line.ends_with(b"\n") && read == limit;
        if cut && self.charset == Charset::Utf8 {
            if let Err(e) = std::str::from_utf8(&line) {
                // a character split by the length cap goes with the next piece
                if e.error_len().is_none() {
                    self.carry = line.split_off(e.valid_up_to());
                }
            }
        }
        if !line.is_empty() {
            self.output = self.process(line);
        }
        Ok(())
    }

    fn process(&mut self, raw: Vec<u8>) -> Bytes {
        if self.passthrough {
            return Bytes::from(raw);
        }

        let text = match self.charset.decode(&raw) {
            Ok(text) => text,
            Err(e) => {
                debug!(charset = self.charset.name(), cause = %e, "line can't be decoded, passing it through");
                return Bytes::from(raw);
            }
        };

        for (index, observer) in self.observers.iter_mut().enumerate() {
            if let Err(e) = observer.observe(&text) {
                warn!(observer = index, cause = %e, "text observer failed, passing body through");
                self.passthrough = true;
                return Bytes::from(raw);
            }
        }

        if self.filters.is_empty() {
            return Bytes::from(raw);
        }

        let mut text = text;
        for (index, filter) in self.filters.iter_mut().enumerate() {
            match filter.filter(text) {
                Ok(filtered) => text = filtered,
                Err(e) => {
                    warn!(filter = index, cause = %e, "text filter failed, passing body through");
                    self.passthrough = true;
                    return Bytes::from(raw);
                }
            }
        }

        match self.charset.encode(&text) {
            Ok(encoded) => Bytes::from(encoded),
            Err(e) => {
                warn!(charset = self.charset.name(), cause = %e, "filtered line can't be encoded, passing body through");
                self.passthrough = true;
                Bytes::from(raw)
            }
        }
    }
}

impl<R: Read> Read for LineFilterReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if !self.output.is_empty() {
                let len = buf.len().min(self.output.len());
                buf[..len].copy_from_slice(&self.output[..len]);
                self.output.advance(len);
                return Ok(len);
            }
            if self.finished {
                return Ok(0);
            }
            self.fill()?;
        }
    }
}

use std::io;
use std::io::Read;

use bytes::{Buf, Bytes, BytesMut};
use tracing::{trace, warn};

use crate::filter::{ByteFilter, ByteObserver};

/// Runs byte observers and byte filters over a body, one block at a time.
///
/// A block is refilled only once the previous output was read completely. When a filter
/// fails the failing block is passed on as read and every later block passes untouched.
pub struct ByteFilterReader<R> {
    inner: R,
    filters: Vec<Box<dyn ByteFilter>>,
    observers: Vec<Box<dyn ByteObserver>>,
    block_size: usize,
    output: Bytes,
    passthrough: bool,
    finished: bool,
}

impl<R> std::fmt::Debug for ByteFilterReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteFilterReader")
            .field("filters", &self.filters.len())
            .field("observers", &self.observers.len())
            .field("block_size", &self.block_size)
            .field("passthrough", &self.passthrough)
            .finish_non_exhaustive()
    }
}

impl<R: Read> ByteFilterReader<R> {
    pub fn new(inner: R, filters: Vec<Box<dyn ByteFilter>>, observers: Vec<Box<dyn ByteObserver>>, block_size: usize) -> Self {
        Self { inner, filters, observers, block_size, output: Bytes::new(), passthrough: false, finished: false }
    }

    pub fn is_passthrough(&self) -> bool {
        self.passthrough
    }

    /// Reads until a whole block is there or the body ended.
    fn read_block(&mut self) -> io::Result<Bytes> {
        let mut block = BytesMut::zeroed(self.block_size);
        let mut filled = 0;
        while filled < self.block_size {
            match self.inner.read(&mut block[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        block.truncate(filled);
        Ok(block.freeze())
    }

    fn fill(&mut self) -> io::Result<()> {
        let block = self.read_block()?;
        if block.is_empty() {
            self.finished = true;
            if !self.passthrough {
                self.output = self.finish_filters();
            }
            return Ok(());
        }

        if self.passthrough {
            self.output = block;
            return Ok(());
        }

        for (index, observer) in self.observers.iter_mut().enumerate() {
            if let Err(e) = observer.observe(&block) {
                warn!(observer = index, cause = %e, "byte observer failed, passing body through");
                self.passthrough = true;
                self.output = block;
                return Ok(());
            }
        }

        let mut data = block.clone();
        for (index, filter) in self.filters.iter_mut().enumerate() {
            match filter.filter(data) {
                Ok(filtered) => data = filtered,
                Err(e) => {
                    warn!(filter = index, cause = %e, "byte filter failed, passing body through");
                    self.passthrough = true;
                    self.output = block;
                    return Ok(());
                }
            }
        }
        trace!(read = block.len(), emitted = data.len(), "filtered block");
        self.output = data;
        Ok(())
    }

    /// Collects what the filters held back; output of a filter still goes through the
    /// filters after it.
    fn finish_filters(&mut self) -> Bytes {
        let mut carry = BytesMut::new();
        for (index, filter) in self.filters.iter_mut().enumerate() {
            let result = if carry.is_empty() { Ok(Bytes::new()) } else { filter.filter(carry.split().freeze()) };
            let tail = result.and_then(|filtered| filter.finish().map(|tail| (filtered, tail)));
            match tail {
                Ok((filtered, tail)) => {
                    carry.extend_from_slice(&filtered);
                    carry.extend_from_slice(&tail);
                }
                Err(e) => {
                    warn!(filter = index, cause = %e, "byte filter failed to finish");
                    self.passthrough = true;
                    return Bytes::new();
                }
            }
        }
        carry.freeze()
    }
}

impl<R: Read> Read for ByteFilterReader<R> {
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
            // filters may return an empty block, keep reading until something comes out
            self.fill()?;
        }
    }
}

use std::io;
use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Buf, BytesMut};
use tracing::{trace, warn};

struct TapState<'a> {
    raw: Box<dyn Read + Send + 'a>,
    recorded: BytesMut,
    recording: bool,
    raw_failed: bool,
}

/// The raw body of a content-coded message, shared between the decoder feeding the
/// observers and the sender.
///
/// Reading from a tap reads the raw body; while recording, every byte read is also kept
/// for the sender.
#[derive(Clone)]
pub(crate) struct Tap<'a>(Arc<Mutex<TapState<'a>>>);

impl<'a> Tap<'a> {
    pub(crate) fn new(raw: Box<dyn Read + Send + 'a>) -> Self {
        Self(Arc::new(Mutex::new(TapState { raw, recorded: BytesMut::new(), recording: true, raw_failed: false })))
    }

    fn lock(&self) -> MutexGuard<'_, TapState<'a>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The decoded body is what gets sent, nothing has to be kept anymore.
    pub(crate) fn stop_recording(&self) {
        let mut state = self.lock();
        state.recording = false;
        state.recorded.clear();
    }
}

impl Read for Tap<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.lock();
        match state.raw.read(buf) {
            Ok(n) => {
                if state.recording {
                    state.recorded.extend_from_slice(&buf[..n]);
                }
                Ok(n)
            }
            Err(e) => {
                state.raw_failed = e.kind() != io::ErrorKind::Interrupted;
                Err(e)
            }
        }
    }
}

/// Sends a content-coded body as it arrived while its decoded form runs past observers.
///
/// Every read first drives the observed stream until the tap recorded new raw bytes, then
/// hands those out. Once the decoded body ended, or could not be decoded, whatever is
/// left of the raw body passes straight through.
pub(crate) struct TeeReader<'a> {
    tap: Tap<'a>,
    observed: Option<Box<dyn Read + Send + 'a>>,
    scratch: Box<[u8]>,
}

impl std::fmt::Debug for TeeReader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeeReader").field("observing", &self.observed.is_some()).finish_non_exhaustive()
    }
}

impl<'a> TeeReader<'a> {
    pub(crate) fn new(tap: Tap<'a>, observed: Box<dyn Read + Send + 'a>, block_size: usize) -> Self {
        Self { tap, observed: Some(observed), scratch: vec![0; block_size.max(1)].into_boxed_slice() }
    }

    fn observe_more(&mut self) -> io::Result<()> {
        let Some(observed) = self.observed.as_mut() else {
            return Ok(());
        };
        match observed.read(&mut self.scratch) {
            Ok(0) => {
                trace!("observed body ended");
                self.observed = None;
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                if self.tap.lock().raw_failed {
                    return Err(e);
                }
                warn!(cause = %e, "can't decode body for observers, sending the rest unobserved");
                self.observed = None;
            }
        }
        Ok(())
    }
}

impl Read for TeeReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            {
                let mut state = self.tap.lock();
                if !state.recorded.is_empty() {
                    let n = buf.len().min(state.recorded.len());
                    buf[..n].copy_from_slice(&state.recorded[..n]);
                    state.recorded.advance(n);
                    return Ok(n);
                }
                if self.observed.is_none() {
                    return state.raw.read(buf);
                }
            }
            // the observed stream reads through the tap, so the lock must be free here
            self.observe_more()?;
        }
    }
}

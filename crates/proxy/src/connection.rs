//! Blocking byte streams over a non-blocking socket.
//!
//! A [`Connection`] owns one accepted socket. Worker threads use it through
//! [`ConnectionReader`] and [`ConnectionWriter`], which block like ordinary streams, while
//! the socket itself is only ever read and written by the reactor thread:
//!
//! - a reader that finds the read buffer empty arms read interest, wakes the reactor and
//!   waits; the reactor fills the buffer, disarms and notifies
//! - a writer that fills the write buffer (or flushes) arms write interest and waits; the
//!   reactor drains the buffer to the socket, disarms and notifies
//!
//! Locks are always taken socket first, then a direction, never the other way around.

use std::fmt;
use std::io;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Token};
use tracing::{debug, trace, warn};

use crate::ProxyError;
use crate::config::ProxyConfig;
use crate::reactor::{EventHandler, Ops, ReactorHandle, Role};

type Delegate = Box<dyn FnOnce(std::net::TcpStream, Bytes) + Send>;

/// Which directions of a connection are still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    ReadHalfClosed,
    WriteHalfClosed,
    Closed,
}

struct SocketIo {
    stream: Option<TcpStream>,
    ops: Ops,
    delegate: Option<Delegate>,
}

#[derive(Default)]
struct ReadState {
    buffer: BytesMut,
    eof: bool,
    closed: bool,
    error: Option<io::Error>,
    waiting: bool,
}

impl ReadState {
    fn is_pending(&self) -> bool {
        self.buffer.is_empty() && !self.eof && !self.closed && self.error.is_none()
    }

    /// `Some(0)` at the end of the stream, `None` if the caller has to wait.
    fn take_ready(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        if !self.buffer.is_empty() {
            let len = buf.len().min(self.buffer.len());
            buf[..len].copy_from_slice(&self.buffer[..len]);
            self.buffer.advance(len);
            return Ok(Some(len));
        }
        if let Some(e) = self.error.take() {
            self.eof = true;
            return Err(e);
        }
        if self.eof || self.closed {
            return Ok(Some(0));
        }
        Ok(None)
    }
}

#[derive(Default)]
struct WriteState {
    buffer: BytesMut,
    closed: bool,
    error: Option<io::Error>,
    waiting: bool,
}

impl WriteState {
    fn check(&mut self) -> io::Result<()> {
        if let Some(e) = self.error.take() {
            self.closed = true;
            return Err(e);
        }
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, ProxyError::Closed));
        }
        Ok(())
    }
}

/// One client socket bridged to blocking streams.
pub struct Connection {
    token: Token,
    reactor: ReactorHandle,
    peer_addr: Option<SocketAddr>,
    buffer_size: usize,
    io_timeout: Duration,
    io: Mutex<SocketIo>,
    read: Mutex<ReadState>,
    readable: Condvar,
    write: Mutex<WriteState>,
    writable: Condvar,
    released: AtomicBool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("token", &self.token.0)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn copy_error(e: &io::Error) -> io::Error {
    io::Error::new(e.kind(), e.to_string())
}

impl Connection {
    /// Takes over `stream` and attaches it to the reactor.
    ///
    /// The socket is registered lazily, the first time a worker waits on it.
    pub fn open(stream: TcpStream, reactor: &ReactorHandle, config: &ProxyConfig) -> Arc<Self> {
        let token = reactor.next_token();
        let connection = Arc::new(Self {
            token,
            reactor: reactor.clone(),
            peer_addr: stream.peer_addr().ok(),
            buffer_size: config.buffer_size,
            io_timeout: config.io_timeout(),
            io: Mutex::new(SocketIo { stream: Some(stream), ops: Ops::default(), delegate: None }),
            read: Mutex::new(ReadState { buffer: BytesMut::with_capacity(config.buffer_size), ..ReadState::default() }),
            readable: Condvar::new(),
            write: Mutex::new(WriteState { buffer: BytesMut::with_capacity(config.buffer_size), ..WriteState::default() }),
            writable: Condvar::new(),
            released: AtomicBool::new(false),
        });
        reactor.attach(token, Role::Stream, Arc::clone(&connection) as Arc<dyn EventHandler>);
        debug!(token = token.0, peer_addr = ?connection.peer_addr, "connection opened");
        connection
    }

    pub fn reader(self: &Arc<Self>) -> ConnectionReader {
        ConnectionReader { connection: Arc::clone(self) }
    }

    pub fn writer(self: &Arc<Self>) -> ConnectionWriter {
        ConnectionWriter { connection: Arc::clone(self) }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        let read_closed = lock(&self.read).closed;
        let write_closed = lock(&self.write).closed;
        match (read_closed, write_closed) {
            (false, false) => ConnectionState::Open,
            (true, false) => ConnectionState::ReadHalfClosed,
            (false, true) => ConnectionState::WriteHalfClosed,
            (true, true) => ConnectionState::Closed,
        }
    }

    /// Returns true once the socket was closed or handed to a delegate.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Puts bytes back in front of the read buffer, for data read ahead of one exchange.
    pub fn unread(&self, bytes: BytesMut) {
        if bytes.is_empty() {
            return;
        }
        let mut state = lock(&self.read);
        if state.buffer.is_empty() {
            state.buffer = bytes;
        } else {
            let mut joined = bytes;
            joined.extend_from_slice(&state.buffer);
            state.buffer = joined;
        }
    }

    /// Asks for the raw socket instead of closing it once both directions are closed.
    ///
    /// `delegate` gets a blocking `std` socket and the bytes left in the read buffer. It
    /// runs on the thread that closes the last direction.
    pub fn delegate<F>(&self, delegate: F)
    where
        F: FnOnce(std::net::TcpStream, Bytes) + Send + 'static,
    {
        lock(&self.io).delegate = Some(Box::new(delegate));
    }

    /// Stops reading, the write direction stays usable.
    pub fn close_read(&self) {
        {
            let mut io = lock(&self.io);
            let SocketIo { stream, ops, delegate } = &mut *io;
            if let Some(stream) = stream.as_mut() {
                if let Err(e) = ops.disarm(self.reactor.registry(), stream, self.token, Interest::READABLE) {
                    warn!(token = self.token.0, cause = %e, "can't disarm read interest");
                }
            }
            let mut state = lock(&self.read);
            state.closed = true;
            if delegate.is_none() {
                state.buffer.clear();
            }
        }
        self.readable.notify_all();
        trace!(token = self.token.0, "read side closed");
        self.release_if_closed();
    }

    /// Flushes what is buffered, then shuts the write direction of the socket down.
    ///
    /// The direction counts as closed even if the flush fails.
    pub fn close_write(&self) -> io::Result<()> {
        let flushed = self.drain_write();
        {
            let mut io = lock(&self.io);
            let SocketIo { stream, ops, delegate } = &mut *io;
            if let Some(stream) = stream.as_mut() {
                if delegate.is_none() {
                    if let Err(e) = stream.shutdown(Shutdown::Write) {
                        trace!(token = self.token.0, cause = %e, "shutdown write failed");
                    }
                }
                if let Err(e) = ops.disarm(self.reactor.registry(), stream, self.token, Interest::WRITABLE) {
                    warn!(token = self.token.0, cause = %e, "can't disarm write interest");
                }
            }
            lock(&self.write).closed = true;
        }
        self.writable.notify_all();
        trace!(token = self.token.0, "write side closed");
        self.release_if_closed();
        flushed
    }

    /// Closes both directions, flushing pending output first.
    pub fn close(&self) {
        self.close_read();
        if let Err(e) = self.close_write() {
            debug!(token = self.token.0, cause = %e, "flush on close failed");
        }
    }

    /// Wakes every waiting worker with an error and drops the socket without flushing.
    pub fn abort(&self) {
        self.fail(io::Error::new(io::ErrorKind::ConnectionAborted, ProxyError::Closed));
    }

    fn fail(&self, error: io::Error) {
        debug!(token = self.token.0, cause = %error, "connection failed");
        {
            let mut state = lock(&self.read);
            if state.error.is_none() {
                state.error = Some(copy_error(&error));
            }
            state.closed = true;
        }
        {
            let mut state = lock(&self.write);
            if state.error.is_none() {
                state.error = Some(error);
            }
            state.closed = true;
            state.buffer.clear();
        }
        self.readable.notify_all();
        self.writable.notify_all();
        self.release(false);
    }

    fn release_if_closed(&self) {
        if self.state() == ConnectionState::Closed {
            self.release(true);
        }
    }

    fn release(&self, allow_delegate: bool) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }

        let (stream, delegate) = {
            let mut io = lock(&self.io);
            let SocketIo { stream, ops, delegate } = &mut *io;
            let mut stream = stream.take();
            if let Some(stream) = stream.as_mut() {
                if let Err(e) = ops.clear(self.reactor.registry(), stream) {
                    trace!(token = self.token.0, cause = %e, "deregister failed");
                }
            }
            (stream, delegate.take())
        };
        self.reactor.detach(self.token);

        let leftover = lock(&self.read).buffer.split().freeze();
        match (stream, delegate) {
            (Some(stream), Some(delegate)) if allow_delegate => {
                let stream = std::net::TcpStream::from(stream);
                match stream.set_nonblocking(false) {
                    Ok(()) => {
                        debug!(token = self.token.0, leftover = leftover.len(), "connection delegated");
                        delegate(stream, leftover);
                    }
                    Err(e) => warn!(token = self.token.0, cause = %e, "can't delegate connection"),
                }
            }
            _ => debug!(token = self.token.0, "connection released"),
        }
    }

    /// Adds interest for the calling worker and interrupts the current poll.
    fn arm(&self, interest: Interest) -> io::Result<()> {
        let changed = {
            let mut io = lock(&self.io);
            let SocketIo { stream, ops, .. } = &mut *io;
            let Some(stream) = stream.as_mut() else {
                return Err(io::Error::new(io::ErrorKind::NotConnected, ProxyError::Closed));
            };
            ops.arm(self.reactor.registry(), stream, self.token, interest)?
        };
        if changed {
            self.reactor.wake()?;
        }
        Ok(())
    }

    fn time_out(&self, direction: &'static str) -> io::Error {
        warn!(token = self.token.0, direction, timeout = ?self.io_timeout, "connection wait timed out");
        self.fail(io::Error::new(io::ErrorKind::TimedOut, ProxyError::Timeout(self.io_timeout)));
        io::Error::new(io::ErrorKind::TimedOut, ProxyError::Timeout(self.io_timeout))
    }

    fn read_into(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            {
                let mut state = lock(&self.read);
                if let Some(len) = state.take_ready(buf)? {
                    return Ok(len);
                }
                if state.waiting {
                    return Err(io::Error::other(ProxyError::ConcurrentWait("read")));
                }
                state.waiting = true;
            }

            if let Err(e) = self.arm(Interest::READABLE) {
                lock(&self.read).waiting = false;
                return Err(e);
            }

            let state = lock(&self.read);
            let (mut state, wait) =
                self.readable.wait_timeout_while(state, self.io_timeout, |state| state.is_pending()).unwrap_or_else(PoisonError::into_inner);
            state.waiting = false;
            if wait.timed_out() {
                drop(state);
                return Err(self.time_out("read"));
            }
        }
    }

    fn write_from(&self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            {
                let mut state = lock(&self.write);
                state.check()?;
                let room = self.buffer_size.saturating_sub(state.buffer.len());
                if room > 0 {
                    let len = room.min(buf.len());
                    state.buffer.extend_from_slice(&buf[..len]);
                    return Ok(len);
                }
            }
            self.drain_write()?;
        }
    }

    /// Blocks until the reactor wrote the whole write buffer to the socket.
    fn drain_write(&self) -> io::Result<()> {
        {
            let mut state = lock(&self.write);
            if let Some(e) = state.error.take() {
                return Err(e);
            }
            if state.buffer.is_empty() {
                return Ok(());
            }
            if state.waiting {
                return Err(io::Error::other(ProxyError::ConcurrentWait("write")));
            }
            state.waiting = true;
        }

        if let Err(e) = self.arm(Interest::WRITABLE) {
            lock(&self.write).waiting = false;
            return Err(e);
        }

        let state = lock(&self.write);
        let (mut state, wait) = self
            .writable
            .wait_timeout_while(state, self.io_timeout, |state| !state.buffer.is_empty() && state.error.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        state.waiting = false;
        if wait.timed_out() {
            drop(state);
            return Err(self.time_out("write"));
        }
        match state.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl EventHandler for Connection {
    /// Moves what the socket has into the read buffer.
    fn on_read(&self) -> io::Result<()> {
        let mut io = lock(&self.io);
        let SocketIo { stream, ops, .. } = &mut *io;
        let Some(stream) = stream.as_mut() else {
            return Ok(());
        };

        let mut state = lock(&self.read);
        let mut progressed = false;
        while !state.closed && state.buffer.len() < self.buffer_size {
            let len = state.buffer.len();
            state.buffer.resize(self.buffer_size, 0);
            let result = stream.read(&mut state.buffer[len..]);
            let read = *result.as_ref().unwrap_or(&0);
            state.buffer.truncate(len + read);
            match result {
                Ok(0) => {
                    trace!(token = self.token.0, "peer closed its write side");
                    state.eof = true;
                    progressed = true;
                    break;
                }
                Ok(_) => progressed = true,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    state.error = Some(e);
                    progressed = true;
                    break;
                }
            }
        }

        let full = state.buffer.len() >= self.buffer_size;
        if progressed || full || state.closed {
            trace!(token = self.token.0, buffered = state.buffer.len(), "read ready");
            drop(state);
            ops.disarm(self.reactor.registry(), stream, self.token, Interest::READABLE)?;
            self.readable.notify_all();
        }
        Ok(())
    }

    /// Moves the write buffer to the socket as far as it takes it.
    fn on_write(&self) -> io::Result<()> {
        let mut io = lock(&self.io);
        let SocketIo { stream, ops, .. } = &mut *io;
        let Some(stream) = stream.as_mut() else {
            return Ok(());
        };

        let mut state = lock(&self.write);
        while !state.buffer.is_empty() {
            match stream.write(&state.buffer) {
                Ok(0) => {
                    state.error = Some(io::Error::from(io::ErrorKind::WriteZero));
                    break;
                }
                Ok(written) => state.buffer.advance(written),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    state.error = Some(e);
                    break;
                }
            }
        }

        if state.buffer.is_empty() || state.error.is_some() {
            if state.error.is_some() {
                state.buffer.clear();
            }
            trace!(token = self.token.0, "write drained");
            drop(state);
            ops.disarm(self.reactor.registry(), stream, self.token, Interest::WRITABLE)?;
            self.writable.notify_all();
        }
        Ok(())
    }

    fn on_error(&self, error: io::Error) {
        self.fail(error);
    }

    fn on_shutdown(&self) {
        self.abort();
    }
}

/// Blocking read half handed to a worker.
#[derive(Debug, Clone)]
pub struct ConnectionReader {
    connection: Arc<Connection>,
}

impl ConnectionReader {
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }
}

impl Read for ConnectionReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.connection.read_into(buf)
    }
}

/// Blocking write half handed to a worker.
#[derive(Debug, Clone)]
pub struct ConnectionWriter {
    connection: Arc<Connection>,
}

impl Write for ConnectionWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.connection.write_from(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.connection.drain_write()
    }
}

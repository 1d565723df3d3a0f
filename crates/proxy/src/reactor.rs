//! Single threaded readiness multiplexer.
//!
//! One thread owns the [`mio::Poll`] and is the only thread doing socket I/O. Every
//! registered socket has an [`EventHandler`] which the loop calls when the socket becomes
//! ready. Other threads change what a socket is interested in through [`Ops`] and wake
//! the loop so the change applies before the next poll.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use mio::event::{Event, Source};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tracing::{debug, error, info, trace, warn};

use crate::config::ProxyConfig;

const WAKER_TOKEN: Token = Token(0);
const EVENTS_CAPACITY: usize = 1024;

/// How the loop dispatches readiness of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// A listening socket, readable means connections are waiting to be accepted
    Acceptor,
    /// A data connection, readable and writable map to reads and writes
    Stream,
}

/// Callbacks of one registration, all of them run on the reactor thread.
///
/// An error returned from a callback is handed to [`on_error`](EventHandler::on_error)
/// and the registration is dropped from the loop.
pub trait EventHandler: Send + Sync {
    fn on_accept(&self) -> io::Result<()> {
        Ok(())
    }

    fn on_read(&self) -> io::Result<()> {
        Ok(())
    }

    fn on_write(&self) -> io::Result<()> {
        Ok(())
    }

    /// The registration failed, the handler must release its socket.
    fn on_error(&self, error: io::Error);

    /// The reactor is stopping.
    fn on_shutdown(&self);
}

struct Registered {
    role: Role,
    handler: Arc<dyn EventHandler>,
}

struct Shared {
    registry: Registry,
    waker: Waker,
    handlers: Mutex<HashMap<Token, Registered>>,
    next_token: AtomicUsize,
    running: AtomicBool,
}

/// Cloneable access to a running [`Reactor`] from any thread.
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ReactorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorHandle").field("running", &self.is_running()).finish_non_exhaustive()
    }
}

impl ReactorHandle {
    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    /// Reserves a token for a new registration.
    pub fn next_token(&self) -> Token {
        Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Attaches `handler` to `token`, events for the token are dispatched to it from now on.
    pub fn attach(&self, token: Token, role: Role, handler: Arc<dyn EventHandler>) {
        self.handlers().insert(token, Registered { role, handler });
    }

    /// Forgets the handler of `token`, events still queued for it are ignored.
    pub fn detach(&self, token: Token) {
        self.handlers().remove(&token);
    }

    /// Interrupts the current blocking poll.
    pub fn wake(&self) -> io::Result<()> {
        self.shared.waker.wake()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Stops the loop, every handler still attached gets `on_shutdown`.
    pub fn shutdown(&self) {
        if self.shared.running.swap(false, Ordering::AcqRel) {
            info!("reactor shutdown requested");
            if let Err(e) = self.wake() {
                warn!(cause = %e, "can't wake reactor for shutdown");
            }
        }
    }

    fn handlers(&self) -> MutexGuard<'_, HashMap<Token, Registered>> {
        self.shared.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, token: Token) -> Option<(Role, Arc<dyn EventHandler>)> {
        self.handlers().get(&token).map(|registered| (registered.role, Arc::clone(&registered.handler)))
    }
}

/// Interest a registration currently has, `None` while it's not registered at all.
///
/// mio can't register a socket with an empty interest, so dropping the last interest
/// deregisters the socket and adding one back registers it again. Both re-evaluate the
/// readiness of the socket, which is what brings back an edge that fired while the
/// interest was off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ops {
    current: Option<Interest>,
}

impl Ops {
    pub fn interest(&self) -> Option<Interest> {
        self.current
    }

    pub fn contains(&self, interest: Interest) -> bool {
        self.current.is_some_and(|current| (current.is_readable() || !interest.is_readable()) && (current.is_writable() || !interest.is_writable()))
    }

    /// Adds `interest`, returns true if the registration changed.
    pub fn arm<S: Source + ?Sized>(&mut self, registry: &Registry, source: &mut S, token: Token, interest: Interest) -> io::Result<bool> {
        let next = match self.current {
            Some(current) => current.add(interest),
            None => interest,
        };
        self.apply(registry, source, token, Some(next))
    }

    /// Removes `interest`, returns true if the registration changed.
    pub fn disarm<S: Source + ?Sized>(&mut self, registry: &Registry, source: &mut S, token: Token, interest: Interest) -> io::Result<bool> {
        let next = self.current.and_then(|current| current.remove(interest));
        self.apply(registry, source, token, next)
    }

    /// Drops every interest.
    pub fn clear<S: Source + ?Sized>(&mut self, registry: &Registry, source: &mut S) -> io::Result<()> {
        if self.current.take().is_some() {
            registry.deregister(source)?;
        }
        Ok(())
    }

    fn apply<S: Source + ?Sized>(&mut self, registry: &Registry, source: &mut S, token: Token, next: Option<Interest>) -> io::Result<bool> {
        if next == self.current {
            return Ok(false);
        }
        match (self.current, next) {
            (None, Some(interest)) => registry.register(source, token, interest)?,
            (Some(_), Some(interest)) => registry.reregister(source, token, interest)?,
            (Some(_), None) => registry.deregister(source)?,
            (None, None) => {}
        }
        trace!(token = token.0, from = ?self.current, to = ?next, "interest changed");
        self.current = next;
        Ok(true)
    }
}

/// The multiplexer loop, run it on its own thread with [`Reactor::run`].
pub struct Reactor {
    poll: Poll,
    handle: ReactorHandle,
    poll_timeout: Duration,
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor").field("poll_timeout", &self.poll_timeout).finish_non_exhaustive()
    }
}

impl Reactor {
    pub fn new(config: &ProxyConfig) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let shared = Shared {
            registry,
            waker,
            handlers: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(WAKER_TOKEN.0 + 1),
            running: AtomicBool::new(true),
        };
        Ok(Self { poll, handle: ReactorHandle { shared: Arc::new(shared) }, poll_timeout: config.poll_timeout() })
    }

    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    /// Polls and dispatches until [`ReactorHandle::shutdown`] is called.
    ///
    /// Failures of single registrations never end the loop, only a failing poll does.
    pub fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        info!("reactor started");

        let result = loop {
            if !self.handle.is_running() {
                break Ok(());
            }

            if let Err(e) = self.poll.poll(&mut events, Some(self.poll_timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(cause = %e, "reactor poll failed");
                break Err(e);
            }

            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                self.dispatch(event);
            }
        };

        self.handle.shared.running.store(false, Ordering::Release);
        let remaining: Vec<_> = self.handle.handlers().drain().map(|(_, registered)| registered.handler).collect();
        debug!(count = remaining.len(), "notify handlers of shutdown");
        for handler in remaining {
            handler.on_shutdown();
        }
        info!("reactor stopped");
        result
    }

    fn dispatch(&self, event: &Event) {
        let token = event.token();
        let Some((role, handler)) = self.handle.lookup(token) else {
            trace!(token = token.0, "event for a detached registration");
            return;
        };

        let result = match role {
            Role::Acceptor => {
                if event.is_readable() {
                    handler.on_accept()
                } else {
                    Ok(())
                }
            }
            Role::Stream => {
                let mut result = Ok(());
                if event.is_readable() || event.is_read_closed() || event.is_error() {
                    result = handler.on_read();
                }
                if result.is_ok() && (event.is_writable() || event.is_write_closed()) {
                    result = handler.on_write();
                }
                result
            }
        };

        if let Err(e) = result {
            warn!(token = token.0, ?role, cause = %e, "registration failed, closing it");
            self.handle.detach(token);
            handler.on_error(e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::mpsc;
    use std::thread;

    struct Probe {
        events: mpsc::Sender<&'static str>,
        fail: bool,
    }

    impl EventHandler for Probe {
        fn on_read(&self) -> io::Result<()> {
            let _ = self.events.send("read");
            if self.fail { Err(io::Error::other("boom")) } else { Ok(()) }
        }

        fn on_error(&self, _error: io::Error) {
            let _ = self.events.send("error");
        }

        fn on_shutdown(&self) {
            let _ = self.events.send("shutdown");
        }
    }

    fn socket_pair() -> (std::net::TcpStream, mio::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (client, mio::net::TcpStream::from_std(server))
    }

    #[test]
    fn ops_register_on_demand() {
        let poll = Poll::new().unwrap();
        let (_client, mut server) = socket_pair();
        let mut ops = Ops::default();

        assert!(ops.arm(poll.registry(), &mut server, Token(1), Interest::READABLE).unwrap());
        assert!(!ops.arm(poll.registry(), &mut server, Token(1), Interest::READABLE).unwrap());
        assert!(ops.arm(poll.registry(), &mut server, Token(1), Interest::WRITABLE).unwrap());
        assert!(ops.contains(Interest::READABLE));
        assert!(ops.contains(Interest::WRITABLE));

        assert!(ops.disarm(poll.registry(), &mut server, Token(1), Interest::READABLE).unwrap());
        assert!(!ops.contains(Interest::READABLE));
        assert!(ops.disarm(poll.registry(), &mut server, Token(1), Interest::WRITABLE).unwrap());
        assert_eq!(ops.interest(), None);
    }

    #[test]
    fn failing_handler_does_not_stop_loop() {
        let config = ProxyConfig { poll_timeout_ms: 50, ..ProxyConfig::default() };
        let reactor = Reactor::new(&config).unwrap();
        let handle = reactor.handle();
        let join = thread::spawn(move || reactor.run());

        let (tx, rx) = mpsc::channel();
        let (mut bad_client, mut bad_server) = socket_pair();
        let (mut good_client, mut good_server) = socket_pair();

        let bad_token = handle.next_token();
        handle.attach(bad_token, Role::Stream, Arc::new(Probe { events: tx.clone(), fail: true }));
        handle.registry().register(&mut bad_server, bad_token, Interest::READABLE).unwrap();
        bad_client.write_all(b"x").unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "read");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "error");

        let good_token = handle.next_token();
        handle.attach(good_token, Role::Stream, Arc::new(Probe { events: tx, fail: false }));
        handle.registry().register(&mut good_server, good_token, Interest::READABLE).unwrap();
        good_client.write_all(b"y").unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "read");

        handle.shutdown();
        join.join().unwrap().unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "shutdown");
        assert!(!handle.is_running());
    }
}

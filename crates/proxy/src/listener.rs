use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use mio::net::TcpListener;
use mio::{Interest, Token};
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::connection::Connection;
use crate::pool::WorkerPool;
use crate::reactor::{EventHandler, ReactorHandle, Role};

/// Accepts clients on the reactor thread and hands each one to the worker pool.
pub struct Listener {
    token: Token,
    socket: Mutex<TcpListener>,
    local_addr: SocketAddr,
    reactor: ReactorHandle,
    pool: WorkerPool,
    config: Arc<ProxyConfig>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener").field("token", &self.token.0).field("local_addr", &self.local_addr).finish_non_exhaustive()
    }
}

impl Listener {
    /// Registers `socket` for accept readiness.
    pub fn register(mut socket: TcpListener, reactor: &ReactorHandle, pool: WorkerPool, config: Arc<ProxyConfig>) -> io::Result<Arc<Self>> {
        let token = reactor.next_token();
        let local_addr = socket.local_addr()?;
        reactor.registry().register(&mut socket, token, Interest::READABLE)?;

        let listener = Arc::new(Self { token, socket: Mutex::new(socket), local_addr, reactor: reactor.clone(), pool, config });
        reactor.attach(token, Role::Acceptor, Arc::clone(&listener) as Arc<dyn EventHandler>);
        info!(%local_addr, "listening");
        Ok(listener)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn deregister(&self) {
        let mut socket = self.socket.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = self.reactor.registry().deregister(&mut *socket) {
            debug!(cause = %e, "listener deregister failed");
        }
    }
}

impl EventHandler for Listener {
    fn on_accept(&self) -> io::Result<()> {
        let socket = self.socket.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match socket.accept() {
                Ok((stream, peer_addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer_addr, cause = %e, "can't set nodelay");
                    }
                    let connection = Connection::open(stream, &self.reactor, &self.config);
                    self.pool.submit(connection);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if matches!(e.kind(), io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset) => {
                    debug!(cause = %e, "client gone before accept");
                }
                Err(e) => {
                    // out of descriptors and the like, keep listening for the next readiness
                    warn!(cause = %e, "accept failed");
                    return Ok(());
                }
            }
        }
    }

    fn on_error(&self, error: io::Error) {
        error!(local_addr = %self.local_addr, cause = %error, "listener failed");
        self.deregister();
    }

    fn on_shutdown(&self) {
        info!(local_addr = %self.local_addr, "listener stopped");
        self.deregister();
    }
}

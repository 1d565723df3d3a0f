//! Wires reactor, listener, worker pool and exchange into a running proxy.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use mio::net::TcpListener;
use tracing::{error, info};

use crate::ProxyError;
use crate::config::ProxyConfig;
use crate::exchange::Exchange;
use crate::filter::FilterRegistry;
use crate::forward::ForwardHandler;
use crate::handler::{DefaultErrorResponder, ErrorResponder, RequestHandler};
use crate::listener::Listener;
use crate::pipeline::BodyPipeline;
use crate::pool::WorkerPool;
use crate::reactor::{Reactor, ReactorHandle};
use crate::tunnel::TunnelHandler;

pub struct ProxyServerBuilder {
    config: Option<ProxyConfig>,
    filters: FilterRegistry,
    handler: Option<Arc<dyn RequestHandler>>,
    tunnel: Option<Arc<dyn TunnelHandler>>,
    error_responder: Option<Arc<dyn ErrorResponder>>,
}

impl std::fmt::Debug for ProxyServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServerBuilder").field("config", &self.config).field("filters", &self.filters).finish_non_exhaustive()
    }
}

impl ProxyServerBuilder {
    fn new() -> Self {
        Self { config: None, filters: FilterRegistry::new(), handler: None, tunnel: None, error_responder: None }
    }

    pub fn config(mut self, config: ProxyConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Shares `filters` with the server; filters registered later still apply.
    pub fn filters(mut self, filters: FilterRegistry) -> Self {
        self.filters = filters;
        self
    }

    /// Replaces the default [`ForwardHandler`].
    pub fn handler(mut self, handler: impl RequestHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn tunnel(mut self, tunnel: impl TunnelHandler + 'static) -> Self {
        self.tunnel = Some(Arc::new(tunnel));
        self
    }

    pub fn error_responder(mut self, error_responder: impl ErrorResponder + 'static) -> Self {
        self.error_responder = Some(Arc::new(error_responder));
        self
    }

    pub fn build(self) -> Result<ProxyServer, ProxyError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let handler = self.handler.unwrap_or_else(|| Arc::new(ForwardHandler::new(&config)));
        let error_responder = self.error_responder.unwrap_or_else(|| Arc::new(DefaultErrorResponder));
        Ok(ProxyServer { config: Arc::new(config), filters: self.filters, handler, tunnel: self.tunnel, error_responder })
    }
}

/// A configured proxy, not listening yet.
pub struct ProxyServer {
    config: Arc<ProxyConfig>,
    filters: FilterRegistry,
    handler: Arc<dyn RequestHandler>,
    tunnel: Option<Arc<dyn TunnelHandler>>,
    error_responder: Arc<dyn ErrorResponder>,
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("config", &self.config)
            .field("filters", &self.filters)
            .field("tunnel", &self.tunnel.is_some())
            .finish_non_exhaustive()
    }
}

impl ProxyServer {
    pub fn builder() -> ProxyServerBuilder {
        ProxyServerBuilder::new()
    }

    pub fn filters(&self) -> &FilterRegistry {
        &self.filters
    }

    /// Binds the listen address and starts the reactor thread and the minimum workers.
    pub fn start(self) -> Result<ServerHandle, ProxyError> {
        let ProxyServer { config, filters, handler, tunnel, error_responder } = self;

        let socket = TcpListener::bind(config.listen_addr)
            .map_err(|e| ProxyError::config(format!("can't bind {}: {e}", config.listen_addr)))?;
        let reactor = Reactor::new(&config)?;
        let reactor_handle = reactor.handle();

        let pipeline = BodyPipeline::new(filters.clone(), &config)?;
        let mut exchange = Exchange::new(Arc::clone(&config), pipeline, handler).with_error_responder(error_responder);
        if let Some(tunnel) = tunnel {
            exchange = exchange.with_tunnel(tunnel);
        }
        let pool = WorkerPool::start(&config, Arc::new(exchange))?;

        let listener = match Listener::register(socket, &reactor_handle, pool.clone(), Arc::clone(&config)) {
            Ok(listener) => listener,
            Err(e) => {
                pool.shutdown();
                return Err(e.into());
            }
        };
        let local_addr = listener.local_addr();

        let thread = thread::Builder::new().name("intercept-reactor".to_string()).spawn(move || reactor.run());
        let thread = match thread {
            Ok(thread) => thread,
            Err(e) => {
                pool.shutdown();
                return Err(e.into());
            }
        };

        info!(%local_addr, workers = config.worker_min, filters = filters.len(), "proxy started");
        Ok(ServerHandle { local_addr, reactor: reactor_handle, pool, filters, thread: Some(thread) })
    }
}

/// Controls a running proxy.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    reactor: ReactorHandle,
    pool: WorkerPool,
    filters: FilterRegistry,
    thread: Option<JoinHandle<std::io::Result<()>>>,
}

impl ServerHandle {
    /// The bound address, with the actual port when port 0 was configured.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The live filter registry, changes apply to messages offered afterwards.
    pub fn filters(&self) -> &FilterRegistry {
        &self.filters
    }

    /// Stops accepting, aborts queued connections and stops the reactor.
    pub fn shutdown(&self) {
        info!(local_addr = %self.local_addr, "proxy shutting down");
        self.pool.shutdown();
        self.reactor.shutdown();
    }

    /// Waits for the reactor thread to end.
    pub fn join(mut self) -> Result<(), ProxyError> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        match thread.join() {
            Ok(result) => result.map_err(ProxyError::from),
            Err(_) => {
                error!("reactor thread panicked");
                Err(ProxyError::from(std::io::Error::other("reactor thread panicked")))
            }
        }
    }
}

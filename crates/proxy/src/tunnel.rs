//! CONNECT handling.
//!
//! The exchange answers a CONNECT with `200 Connection Established` once a
//! [`TunnelHandler`] accepted it, then hands the raw client socket to the returned
//! [`Tunnel`]. What runs inside the tunnel, a TLS handshake or a blind relay, is up to
//! the tunnel.

use std::io;
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use intercept_http::protocol::RequestHeader;
use tracing::{debug, trace, warn};

use crate::ProxyError;
use crate::config::ProxyConfig;
use crate::error::BoxError;
use crate::forward::connect_upstream;

/// Decides whether a CONNECT request is served.
pub trait TunnelHandler: Send + Sync {
    /// Prepares the tunnel; an error is answered with an error response instead of 200.
    fn open(&self, request: &RequestHeader) -> Result<Box<dyn Tunnel>, BoxError>;
}

/// Owns a client socket after the CONNECT exchange.
pub trait Tunnel: Send {
    /// `unread` holds bytes the client sent after the CONNECT head. Called on a worker
    /// thread, long running work belongs on threads of its own.
    fn run(self: Box<Self>, client: TcpStream, unread: Bytes);
}

/// Relays bytes between the client and the CONNECT target without looking at them.
#[derive(Debug, Clone)]
pub struct SpliceTunnelHandler {
    connect_timeout: Duration,
    idle_timeout: Duration,
}

impl SpliceTunnelHandler {
    pub fn new(config: &ProxyConfig) -> Self {
        Self { connect_timeout: config.upstream_connect_timeout(), idle_timeout: config.io_timeout() }
    }
}

impl TunnelHandler for SpliceTunnelHandler {
    fn open(&self, request: &RequestHeader) -> Result<Box<dyn Tunnel>, BoxError> {
        let authority = request
            .uri()
            .authority()
            .map(|authority| authority.as_str().to_string())
            .ok_or_else(|| ProxyError::upstream(request.uri(), io::Error::new(io::ErrorKind::InvalidInput, "CONNECT target has no authority")))?;
        let upstream = connect_upstream(&authority, self.connect_timeout)?;
        Ok(Box::new(SpliceTunnel { authority, upstream, idle_timeout: self.idle_timeout }))
    }
}

#[derive(Debug)]
pub struct SpliceTunnel {
    authority: String,
    upstream: TcpStream,
    idle_timeout: Duration,
}

impl Tunnel for SpliceTunnel {
    fn run(self: Box<Self>, client: TcpStream, unread: Bytes) {
        let SpliceTunnel { authority, mut upstream, idle_timeout } = *self;
        if let Err(e) = start_splice(&authority, client, &mut upstream, unread, idle_timeout) {
            warn!(authority, cause = %e, "can't start tunnel relay");
        }
    }
}

fn start_splice(authority: &str, client: TcpStream, upstream: &mut TcpStream, unread: Bytes, idle_timeout: Duration) -> io::Result<()> {
    if !unread.is_empty() {
        upstream.write_all(&unread)?;
    }
    for stream in [&client, &*upstream] {
        stream.set_read_timeout(Some(idle_timeout))?;
        stream.set_write_timeout(Some(idle_timeout))?;
    }

    let client_read = client.try_clone()?;
    let upstream_read = upstream.try_clone()?;
    let upstream_write = upstream.try_clone()?;

    let outbound = format!("{authority} outbound");
    thread::Builder::new().name("intercept-tunnel".to_string()).spawn(move || splice(&outbound, client_read, upstream_write))?;
    let inbound = format!("{authority} inbound");
    thread::Builder::new().name("intercept-tunnel".to_string()).spawn(move || splice(&inbound, upstream_read, client))?;
    debug!(authority, "tunnel relay started");
    Ok(())
}

/// Copies until `from` ends, then passes the end on to `to`.
fn splice(name: &str, mut from: TcpStream, mut to: TcpStream) {
    match io::copy(&mut from, &mut to) {
        Ok(copied) => trace!(name, copied, "tunnel direction finished"),
        Err(e) => {
            debug!(name, cause = %e, "tunnel direction failed");
            let _ = from.shutdown(Shutdown::Read);
        }
    }
    let _ = to.shutdown(Shutdown::Write);
}

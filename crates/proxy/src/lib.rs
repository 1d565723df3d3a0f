//! An intercepting HTTP/1.1 proxy with streaming body filters.
//!
//! Client sockets are owned by a single [`reactor`] thread running a `mio` poll loop.
//! Workers of a [`pool`] serve one exchange at a time with plain blocking reads and
//! writes on a [`connection::Connection`], which waits for the reactor to report
//! readiness instead of blocking on the socket.
//!
//! Every message body, in both directions, goes through the [`pipeline`]: it is offered
//! to the registered [`filter`]s, transfer and content decoded when a filter attaches,
//! filtered block by block or line by line while it streams, and framed again with
//! headers that describe the body actually sent.
//!
//! # Example
//!
//! ```no_run
//! use intercept_proxy::filter::{FilterRegistry, FnFilter};
//! use intercept_proxy::{BoxError, ProxyServer};
//!
//! let filters = FilterRegistry::new();
//! filters.register(FnFilter::new("shout", r"^http://example\.com/", "^text/html$", |context| {
//!     context.registration().add_text_filter(|line: String| -> Result<String, BoxError> { Ok(line.to_uppercase()) });
//!     Ok(())
//! })?);
//!
//! let handle = ProxyServer::builder().filters(filters).build()?.start()?;
//! handle.join()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Architecture
//!
//! - [`reactor`]: readiness multiplexer and the [`reactor::EventHandler`] seam
//! - [`connection`]: blocking streams over non-blocking sockets, half close, delegation
//! - [`listener`]: accepts clients on the reactor thread
//! - [`pool`]: worker threads and the connection queue
//! - [`exchange`]: one request/response exchange and the keep-alive decision
//! - [`pipeline`] and [`filter`]: body decoding, filtering and re-framing
//! - [`handler`], [`forward`] and [`tunnel`]: what is done with a request
//! - [`server`]: composes all of the above

pub mod body;
pub mod config;
pub mod connection;
mod error;
pub mod exchange;
pub mod filter;
pub mod forward;
pub mod handler;
pub mod headers;
pub mod listener;
pub mod pipeline;
pub mod pool;
pub mod reactor;
pub mod server;
pub mod tunnel;

pub use error::{BoxError, ProxyError};
pub use server::{ProxyServer, ProxyServerBuilder, ServerHandle};

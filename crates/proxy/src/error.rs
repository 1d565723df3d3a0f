use std::io;

use intercept_http::protocol::{HttpError, ParseError, SendError};
use thiserror::Error;

/// Error type returned by request handlers and filters.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("connection closed")]
    Closed,

    #[error("another thread is already waiting to {0} this connection")]
    ConcurrentWait(&'static str),

    #[error("parse error: {source}")]
    Parse {
        #[from]
        source: ParseError,
    },

    #[error("send error: {source}")]
    Send {
        #[from]
        source: SendError,
    },

    #[error("upstream {authority} failed: {source}")]
    Upstream { authority: String, source: io::Error },

    #[error("handler error: {0}")]
    Handler(BoxError),

    #[error("filter {name} failed: {reason}")]
    Filter { name: String, reason: String },

    #[error("config error: {0}")]
    Config(String),
}

impl ProxyError {
    pub fn config<S: ToString>(str: S) -> Self {
        Self::Config(str.to_string())
    }

    pub fn upstream<S: ToString>(authority: S, source: io::Error) -> Self {
        Self::Upstream { authority: authority.to_string(), source }
    }

    pub fn filter<N: ToString, S: ToString>(name: N, reason: S) -> Self {
        Self::Filter { name: name.to_string(), reason: reason.to_string() }
    }

    /// Returns true for failures of the client connection itself, after which no
    /// response can be written.
    pub fn is_transport(&self) -> bool {
        match self {
            ProxyError::Io { .. } | ProxyError::Timeout(_) | ProxyError::Closed | ProxyError::ConcurrentWait(_) => true,
            ProxyError::Parse { source: ParseError::Io { .. } } | ProxyError::Send { source: SendError::Io { .. } } => true,
            _ => false,
        }
    }
}

impl From<HttpError> for ProxyError {
    fn from(e: HttpError) -> Self {
        match e {
            HttpError::RequestError { source } => source.into(),
            HttpError::ResponseError { source } => source.into(),
        }
    }
}

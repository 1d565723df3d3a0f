//! Proxy configuration.
//!
//! A [`ProxyConfig`] is built once, validated, and handed to every component that needs
//! it. There is no process wide configuration state.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ProxyError;
use crate::pipeline::Charset;

/// Settings of one proxy instance, every field has a default.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address the proxy accepts clients on
    pub listen_addr: SocketAddr,

    /// Workers kept alive even when idle
    pub worker_min: usize,

    /// Idle time after which a worker above the minimum exits
    pub worker_idle_timeout_ms: u64,

    /// Upper bound of one blocking readiness poll
    pub poll_timeout_ms: u64,

    /// Bound of every blocking wait on a client connection
    pub io_timeout_ms: u64,

    /// Size of the read buffer and of the write buffer of each connection
    pub buffer_size: usize,

    /// Block size of byte filters and of emitted chunks
    pub filter_block_size: usize,

    /// Longest line handed to a text filter, longer lines are split
    pub max_line_length: usize,

    /// Charset assumed for text bodies that don't declare one
    pub default_charset: String,

    /// Largest chunk a chunked body may declare, unlimited when absent
    pub max_chunk_size: Option<u64>,

    pub upstream_connect_timeout_ms: u64,

    /// Maximum level of the log output of the binary
    pub log_level: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            worker_min: 4,
            worker_idle_timeout_ms: 60_000,
            poll_timeout_ms: 1_000,
            io_timeout_ms: 30_000,
            buffer_size: 16 * 1024,
            filter_block_size: 8 * 1024,
            max_line_length: 64 * 1024,
            default_charset: "utf-8".to_string(),
            max_chunk_size: None,
            upstream_connect_timeout_ms: 10_000,
            log_level: "info".to_string(),
        }
    }
}

impl ProxyConfig {
    /// Reads a JSON configuration file, missing fields take their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ProxyError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| ProxyError::config(format!("can't read {}: {e}", path.display())))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ProxyError> {
        let config: ProxyConfig = serde_json::from_str(content).map_err(|e| ProxyError::config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values no component can work with.
    pub fn validate(&self) -> Result<(), ProxyError> {
        let sizes = [
            ("buffer_size", self.buffer_size),
            ("filter_block_size", self.filter_block_size),
            ("max_line_length", self.max_line_length),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(ProxyError::config(format!("{name} must be greater than zero")));
            }
        }

        let timeouts = [
            ("worker_idle_timeout_ms", self.worker_idle_timeout_ms),
            ("poll_timeout_ms", self.poll_timeout_ms),
            ("io_timeout_ms", self.io_timeout_ms),
            ("upstream_connect_timeout_ms", self.upstream_connect_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ProxyError::config(format!("{name} must be greater than zero")));
            }
        }

        if self.max_chunk_size == Some(0) {
            return Err(ProxyError::config("max_chunk_size must be greater than zero"));
        }

        if Charset::from_label(&self.default_charset).is_none() {
            return Err(ProxyError::config(format!("unsupported default_charset {}", self.default_charset)));
        }
        Ok(())
    }

    pub fn worker_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_idle_timeout_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_connect_timeout_ms)
    }
}

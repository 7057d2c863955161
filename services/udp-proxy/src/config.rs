//! UDP proxy service configuration.
//!
//! Env-driven, read once at startup.

use std::net::SocketAddr;

use anyhow::{bail, Context, Result};

use crate::proxy::{UdpProxyConfig, MAX_IDLE_TIMEOUT, MAX_UDP_PAYLOAD_SIZE};

/// Service configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the downstream listener binds to.
    pub bind_addr: SocketAddr,

    /// Session engine settings.
    pub proxy: UdpProxyConfig,

    /// Hosts of the target cluster.
    pub upstreams: Vec<SocketAddr>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bind_addr: SocketAddr = var("UDP_PROXY_BIND_ADDR")
            .unwrap_or_else(|| "[::]:8053".to_string())
            .parse()
            .context("UDP_PROXY_BIND_ADDR must be a socket address (example: [::]:8053).")?;

        let cluster = var("UDP_PROXY_CLUSTER")
            .filter(|v| !v.trim().is_empty())
            .context("Missing cluster name. Set UDP_PROXY_CLUSTER.")?;

        let upstreams = var("UDP_PROXY_UPSTREAMS")
            .context("Missing upstream hosts. Set UDP_PROXY_UPSTREAMS (comma separated ip:port).")?
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| {
                v.parse::<SocketAddr>()
                    .with_context(|| format!("Invalid upstream address '{v}'."))
            })
            .collect::<Result<Vec<_>>>()?;
        if upstreams.is_empty() {
            bail!("UDP_PROXY_UPSTREAMS must list at least one upstream.");
        }

        let mut proxy = UdpProxyConfig::new(cluster.trim());

        if let Some(v) = var("UDP_PROXY_IDLE_TIMEOUT_MS") {
            let idle_timeout_ms: u64 = v
                .parse()
                .context("UDP_PROXY_IDLE_TIMEOUT_MS must be an integer (milliseconds).")?;
            let max_ms = MAX_IDLE_TIMEOUT.as_millis() as u64;
            if idle_timeout_ms > max_ms {
                bail!("UDP_PROXY_IDLE_TIMEOUT_MS must be at most {max_ms}.");
            }
            proxy.idle_timeout_ms = idle_timeout_ms.max(1);
        }

        if let Some(v) = var("UDP_PROXY_MAX_DATAGRAM_SIZE") {
            let size: usize = v
                .parse()
                .context("UDP_PROXY_MAX_DATAGRAM_SIZE must be an integer (bytes).")?;
            if size == 0 || size > MAX_UDP_PAYLOAD_SIZE {
                bail!("UDP_PROXY_MAX_DATAGRAM_SIZE must be between 1 and {MAX_UDP_PAYLOAD_SIZE}.");
            }
            proxy.max_datagram_size = size;
        }

        if let Some(v) = var("UDP_PROXY_MAX_SESSIONS") {
            proxy.max_sessions = v
                .parse()
                .context("UDP_PROXY_MAX_SESSIONS must be an integer.")?;
        }

        let log_level = var("UDP_PROXY_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            bind_addr,
            proxy,
            upstreams,
            log_level,
        })
    }
}

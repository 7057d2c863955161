//! Shared, immutable proxy configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;

use super::cluster::{ClusterManager, Host};
use super::timer::MAX_IDLE_TIMEOUT;

/// Default session idle timeout.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default maximum datagram size accepted in either direction.
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 1500;

/// Largest payload a UDP datagram can carry over IPv4.
pub const MAX_UDP_PAYLOAD_SIZE: usize = 65507;

/// Default maximum number of concurrent sessions per filter.
pub const DEFAULT_MAX_SESSIONS: usize = 10000;

/// Proxy configuration as supplied by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UdpProxyConfig {
    /// Cluster new sessions are routed to.
    pub cluster: String,
    /// Session idle timeout in milliseconds.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Maximum datagram size in either direction.
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,
    /// Maximum number of concurrent sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

fn default_idle_timeout_ms() -> u64 {
    DEFAULT_IDLE_TIMEOUT.as_millis() as u64
}

fn default_max_datagram_size() -> usize {
    DEFAULT_MAX_DATAGRAM_SIZE
}

fn default_max_sessions() -> usize {
    DEFAULT_MAX_SESSIONS
}

impl UdpProxyConfig {
    /// Config for `cluster` with every other field defaulted.
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            idle_timeout_ms: default_idle_timeout_ms(),
            max_datagram_size: default_max_datagram_size(),
            max_sessions: default_max_sessions(),
        }
    }

    /// Idle timeout, kept within 1 ms and [`MAX_IDLE_TIMEOUT`].
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.max(1)).min(MAX_IDLE_TIMEOUT)
    }
}

/// Source of monotonic time for session bookkeeping.
pub trait TimeSource: Send + Sync {
    fn monotonic_time(&self) -> Instant;
}

/// Time source backed by the tokio clock (honours paused test clocks).
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioTimeSource;

impl TimeSource for TokioTimeSource {
    fn monotonic_time(&self) -> Instant {
        Instant::now()
    }
}

/// Read-only view shared by every filter serving the same listener config.
pub struct UdpProxyFilterConfig {
    cluster_manager: Arc<dyn ClusterManager>,
    time_source: Arc<dyn TimeSource>,
    config: UdpProxyConfig,
}

impl UdpProxyFilterConfig {
    pub fn new(
        cluster_manager: Arc<dyn ClusterManager>,
        time_source: Arc<dyn TimeSource>,
        config: UdpProxyConfig,
    ) -> Self {
        Self {
            cluster_manager,
            time_source,
            config,
        }
    }

    /// Pick an upstream host from the configured cluster.
    pub fn resolve_host(&self) -> Option<Arc<Host>> {
        self.cluster_manager.resolve(&self.config.cluster)
    }

    pub fn time_source(&self) -> &dyn TimeSource {
        self.time_source.as_ref()
    }

    pub fn cluster(&self) -> &str {
        &self.config.cluster
    }

    pub fn idle_timeout(&self) -> Duration {
        self.config.idle_timeout()
    }

    /// Largest datagram accepted from either side.
    pub fn max_datagram_size(&self) -> usize {
        self.config.max_datagram_size.min(MAX_UDP_PAYLOAD_SIZE)
    }

    pub fn max_sessions(&self) -> usize {
        self.config.max_sessions
    }
}

impl fmt::Debug for UdpProxyFilterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpProxyFilterConfig")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Shared filter configuration reference.
pub type SharedFilterConfig = Arc<UdpProxyFilterConfig>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::cluster::StaticClusterManager;

    #[test]
    fn test_config_defaults() {
        let config: UdpProxyConfig =
            serde_json::from_str(r#"{"cluster": "fake_cluster"}"#).unwrap();

        assert_eq!(config, UdpProxyConfig::new("fake_cluster"));
        assert_eq!(config.idle_timeout(), DEFAULT_IDLE_TIMEOUT);
        assert_eq!(config.max_datagram_size, DEFAULT_MAX_DATAGRAM_SIZE);
    }

    #[test]
    fn test_config_requires_cluster() {
        assert!(serde_json::from_str::<UdpProxyConfig>(r#"{"idle_timeout_ms": 10}"#).is_err());
    }

    #[test]
    fn test_idle_timeout_bounds() {
        let mut config = UdpProxyConfig::new("c");

        config.idle_timeout_ms = 0;
        assert_eq!(config.idle_timeout(), Duration::from_millis(1));

        config.idle_timeout_ms = 110_000_000_000;
        assert_eq!(config.idle_timeout(), MAX_IDLE_TIMEOUT);

        config.idle_timeout_ms = u64::MAX;
        assert_eq!(config.idle_timeout(), MAX_IDLE_TIMEOUT);
    }

    #[test]
    fn test_max_datagram_size_capped() {
        let mut config = UdpProxyConfig::new("c");
        config.max_datagram_size = 1 << 20;
        let filter_config = UdpProxyFilterConfig::new(
            Arc::new(StaticClusterManager::new()),
            Arc::new(TokioTimeSource),
            config,
        );
        assert_eq!(filter_config.max_datagram_size(), MAX_UDP_PAYLOAD_SIZE);
    }
}

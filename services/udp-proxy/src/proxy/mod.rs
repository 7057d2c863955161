//! UDP session proxy implementation.
//!
//! This module provides:
//! - Flow identification from datagram addresses
//! - Per-flow sessions with their own upstream socket
//! - Idle-timer based session eviction
//! - Upstream host selection through a cluster manager
//! - The listener event loop tying it together
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Filter -> Session Table -> Session -> Upstream Host
//!              ^                                     |
//!              +---------- response (send_to) -------+
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{ListenerConfig, StaticClusterManager, UdpListener, UdpProxyConfig};
//!
//! let clusters = Arc::new(StaticClusterManager::new());
//! clusters.update_cluster("dns", vec![Host::new("[fd00::53]:53".parse()?, "dns-1")]);
//!
//! let filter_config = Arc::new(UdpProxyFilterConfig::new(
//!     clusters,
//!     Arc::new(TokioTimeSource),
//!     UdpProxyConfig::new("dns"),
//! ));
//! let listener = UdpListener::bind(ListenerConfig::new("[::]:53".parse()?), filter_config).await?;
//! listener.run().await?;
//! ```

mod cluster;
mod filter;
mod filter_config;
mod flow;
mod listener;
mod session;
mod table;
mod timer;

pub use cluster::{ClusterManager, HealthStatus, Host, StaticClusterManager};
pub use filter::{FilterStats, UdpProxyFilter};
pub use filter_config::{
    SharedFilterConfig, TimeSource, TokioTimeSource, UdpProxyConfig, UdpProxyFilterConfig,
    DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_DATAGRAM_SIZE, DEFAULT_MAX_SESSIONS, MAX_UDP_PAYLOAD_SIZE,
};
pub use flow::{FlowKey, UdpRecvData};
pub use listener::{ListenerConfig, UdpListener};
pub use session::{ActiveSession, SessionError, SessionEvent, SessionId};
pub use table::SessionTable;
pub use timer::{IdleTimerKey, IdleTimers, MAX_IDLE_TIMEOUT};

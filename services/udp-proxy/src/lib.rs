pub mod config;
pub mod proxy;

pub use proxy::{
    ActiveSession, ClusterManager, FilterStats, FlowKey, HealthStatus, Host, ListenerConfig,
    SessionEvent, SessionId, SessionTable, SharedFilterConfig, StaticClusterManager, TimeSource,
    TokioTimeSource, UdpListener, UdpProxyConfig, UdpProxyFilter, UdpProxyFilterConfig,
    UdpRecvData, MAX_IDLE_TIMEOUT,
};

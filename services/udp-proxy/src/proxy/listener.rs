//! UDP listener and event loop.
//!
//! The listener owns the downstream socket and the proxy filter, and drives
//! both from one task:
//! - Datagrams from clients go to [`UdpProxyFilter::on_data`]
//! - Session events (responses, read errors, idle expiry) go to
//!   [`UdpProxyFilter::handle_event`]
//!
//! The local address recorded for each datagram is the address the listener
//! is bound to.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::{info, trace, warn};

use super::filter::{FilterStats, UdpProxyFilter};
use super::filter_config::SharedFilterConfig;
use super::flow::UdpRecvData;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self { bind_addr }
    }
}

/// A UDP listener for the session proxy.
pub struct UdpListener {
    /// The downstream socket, shared with the filter for responses.
    socket: Arc<UdpSocket>,
    /// Address the socket is bound to.
    local_addr: SocketAddr,
    /// The proxy filter handling this listener's traffic.
    filter: UdpProxyFilter,
}

impl UdpListener {
    /// Bind a listener and create its filter.
    pub async fn bind(config: ListenerConfig, filter_config: SharedFilterConfig) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
        let local_addr = socket.local_addr()?;

        info!(
            bind_addr = %local_addr,
            cluster = %filter_config.cluster(),
            idle_timeout_ms = filter_config.idle_timeout().as_millis() as u64,
            max_datagram_size = filter_config.max_datagram_size(),
            "Listener bound"
        );

        let filter = UdpProxyFilter::new(filter_config, Arc::clone(&socket));

        Ok(Self {
            socket,
            local_addr,
            filter,
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get filter statistics.
    pub fn stats(&self) -> Arc<FilterStats> {
        self.filter.shared_stats()
    }

    /// Run the listener until the task is cancelled.
    pub async fn run(self) -> io::Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run the listener until `shutdown` completes.
    ///
    /// All sessions are released when this returns.
    pub async fn run_until<F>(mut self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let max_size = self.filter.config().max_datagram_size();
        // One spare byte so oversized datagrams are seen as such, not truncated.
        let mut buf = vec![0u8; max_size + 1];

        info!(bind_addr = %self.local_addr, "Listener started");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(
                        bind_addr = %self.local_addr,
                        sessions = self.filter.sessions().len(),
                        "Listener shutting down"
                    );
                    break;
                }
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((n, peer_addr)) => {
                        let receive_time = self.filter.config().time_source().monotonic_time();
                        let data = UdpRecvData::new(
                            self.local_addr,
                            peer_addr,
                            Bytes::copy_from_slice(&buf[..n]),
                            receive_time,
                        );
                        self.filter.on_data(data).await;
                    }
                    Err(e) => {
                        // ICMP errors from earlier sends can surface here; the
                        // socket stays usable.
                        warn!(error = %e, "Receive error");
                    }
                },
                event = self.filter.next_event() => {
                    trace!(event = ?event, "Session event");
                    self.filter.handle_event(event).await;
                }
            }
        }

        Ok(())
    }
}

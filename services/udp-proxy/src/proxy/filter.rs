//! Per-listener UDP proxy filter.
//!
//! The filter is driven by a single task. [`UdpProxyFilter::on_data`] handles
//! datagrams from downstream clients; [`UdpProxyFilter::next_event`] and
//! [`UdpProxyFilter::handle_event`] handle everything that happens later for
//! a session (upstream responses, read errors, idle expiry). Because all of
//! these run on the same task, a timer can never fire in the middle of
//! processing a packet for the same session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::filter_config::SharedFilterConfig;
use super::flow::{FlowKey, UdpRecvData};
use super::session::{ActiveSession, SessionEvent, SessionId};
use super::table::SessionTable;
use super::timer::IdleTimers;

/// Session events waiting for the filter task. Readers stop when it is full.
const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Counters for one filter.
#[derive(Debug, Default)]
pub struct FilterStats {
    /// Sessions created.
    pub sessions_total: AtomicU64,
    /// Sessions currently alive.
    pub sessions_active: AtomicU64,
    /// Sessions destroyed (idle timeout or filter teardown).
    pub sessions_destroyed: AtomicU64,
    /// Sessions destroyed by the idle timer.
    pub idle_timeouts: AtomicU64,
    /// New flows rejected because the session limit was reached.
    pub sessions_overflow: AtomicU64,
    /// New flows dropped because no upstream host was available.
    pub no_healthy_host: AtomicU64,
    /// Datagrams received from clients.
    pub downstream_rx_datagrams: AtomicU64,
    /// Bytes received from clients.
    pub downstream_rx_bytes: AtomicU64,
    /// Client datagrams dropped for exceeding the size limit.
    pub downstream_rx_oversize: AtomicU64,
    /// Datagrams sent back to clients.
    pub downstream_tx_datagrams: AtomicU64,
    /// Bytes sent back to clients.
    pub downstream_tx_bytes: AtomicU64,
    /// Failed writes to clients.
    pub downstream_tx_errors: AtomicU64,
    /// Datagrams forwarded upstream.
    pub upstream_tx_datagrams: AtomicU64,
    /// Bytes forwarded upstream.
    pub upstream_tx_bytes: AtomicU64,
    /// Failed writes to upstream hosts.
    pub upstream_tx_errors: AtomicU64,
    /// Datagrams received from upstream hosts.
    pub upstream_rx_datagrams: AtomicU64,
    /// Bytes received from upstream hosts.
    pub upstream_rx_bytes: AtomicU64,
    /// Upstream datagrams dropped for exceeding the size limit.
    pub upstream_rx_oversize: AtomicU64,
    /// Failed reads from upstream sockets.
    pub upstream_rx_errors: AtomicU64,
}

fn incr(counter: &AtomicU64, value: u64) {
    counter.fetch_add(value, Ordering::Relaxed);
}

/// UDP proxy filter owning the sessions created for one listener.
pub struct UdpProxyFilter {
    config: SharedFilterConfig,
    /// Downstream socket responses are written to.
    listener: Arc<UdpSocket>,
    sessions: SessionTable,
    idle_timers: IdleTimers,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: mpsc::Receiver<SessionEvent>,
    stats: Arc<FilterStats>,
}

impl UdpProxyFilter {
    /// Create a filter writing responses through `listener`.
    pub fn new(config: SharedFilterConfig, listener: Arc<UdpSocket>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        Self {
            idle_timers: IdleTimers::new(config.idle_timeout()),
            config,
            listener,
            sessions: SessionTable::new(),
            events_tx,
            events_rx,
            stats: Arc::new(FilterStats::default()),
        }
    }

    pub fn config(&self) -> &SharedFilterConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn stats(&self) -> &FilterStats {
        &self.stats
    }

    /// Shared handle to the counters, for readers outside the filter task.
    pub fn shared_stats(&self) -> Arc<FilterStats> {
        Arc::clone(&self.stats)
    }

    /// Handle one datagram from a downstream client.
    ///
    /// Never fails: every problem is logged, counted and the datagram dropped.
    pub async fn on_data(&mut self, data: UdpRecvData) {
        let UdpRecvData {
            addresses: key,
            buffer,
            receive_time,
        } = data;

        let max_size = self.config.max_datagram_size();
        if buffer.len() > max_size {
            incr(&self.stats.downstream_rx_oversize, 1);
            debug!(
                flow = %key,
                size = buffer.len(),
                max_size = max_size,
                "Dropping oversized datagram"
            );
            return;
        }

        incr(&self.stats.downstream_rx_datagrams, 1);
        incr(&self.stats.downstream_rx_bytes, buffer.len() as u64);

        if let Some(session) = self.sessions.find(&key) {
            Self::forward_upstream(session, &buffer, &mut self.idle_timers, &self.stats).await;
            return;
        }

        let Some(session) = self.create_session(key, receive_time) else {
            return;
        };
        self.sessions.insert(session, &mut self.idle_timers);

        if let Some(session) = self.sessions.find(&key) {
            Self::forward_upstream(session, &buffer, &mut self.idle_timers, &self.stats).await;
        }
    }

    fn create_session(
        &mut self,
        key: FlowKey,
        receive_time: tokio::time::Instant,
    ) -> Option<ActiveSession> {
        if self.sessions.len() >= self.config.max_sessions() {
            incr(&self.stats.sessions_overflow, 1);
            warn!(
                flow = %key,
                max_sessions = self.config.max_sessions(),
                "Session limit reached; dropping datagram"
            );
            return None;
        }

        let Some(host) = self.config.resolve_host() else {
            incr(&self.stats.no_healthy_host, 1);
            debug!(
                flow = %key,
                cluster = %self.config.cluster(),
                "No upstream host available; dropping datagram"
            );
            return None;
        };

        match ActiveSession::create(
            key,
            host,
            &mut self.idle_timers,
            self.events_tx.clone(),
            self.config.max_datagram_size(),
            self.config.time_source().monotonic_time(),
        ) {
            Ok(session) => {
                incr(&self.stats.sessions_total, 1);
                incr(&self.stats.sessions_active, 1);
                info!(
                    session = %session.id(),
                    flow = %key,
                    upstream = %session.host().address,
                    setup_delay_us = session
                        .created_at()
                        .saturating_duration_since(receive_time)
                        .as_micros() as u64,
                    "New session"
                );
                Some(session)
            }
            Err(e) => {
                incr(&self.stats.no_healthy_host, 1);
                warn!(flow = %key, error = %e, "Failed to create session; dropping datagram");
                None
            }
        }
    }

    async fn forward_upstream(
        session: &ActiveSession,
        payload: &[u8],
        timers: &mut IdleTimers,
        stats: &FilterStats,
    ) {
        match session.forward(payload, timers).await {
            Ok(n) => {
                incr(&stats.upstream_tx_datagrams, 1);
                incr(&stats.upstream_tx_bytes, n as u64);
            }
            Err(e) => {
                incr(&stats.upstream_tx_errors, 1);
                warn!(
                    session = %session.id(),
                    upstream = %session.host().address,
                    error = %e,
                    "Upstream write failed; datagram dropped"
                );
            }
        }
    }

    /// Wait for the next session event.
    ///
    /// Cancel safe: dropping the future loses no event.
    pub async fn next_event(&mut self) -> SessionEvent {
        tokio::select! {
            Some((session, key)) = self.idle_timers.expired() => {
                SessionEvent::IdleTimeout { session, key }
            }
            Some(event) = self.events_rx.recv() => event,
        }
    }

    /// Apply a session event produced by [`next_event`](Self::next_event).
    pub async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::IdleTimeout { session, key } => self.on_idle_timeout(session, key),
            SessionEvent::UpstreamData {
                session,
                key,
                payload,
            } => self.on_upstream_data(session, key, payload).await,
            SessionEvent::UpstreamOversize { session, key, size } => {
                if self.live_session(session, &key).is_some() {
                    incr(&self.stats.upstream_rx_oversize, 1);
                    debug!(
                        session = %session,
                        size = size,
                        max_size = self.config.max_datagram_size(),
                        "Dropping oversized upstream datagram"
                    );
                }
            }
            SessionEvent::UpstreamReadError {
                session,
                key,
                error,
            } => {
                if self.live_session(session, &key).is_some() {
                    incr(&self.stats.upstream_rx_errors, 1);
                    debug!(session = %session, flow = %key, error = %error, "Upstream read failed");
                }
            }
        }
    }

    /// The session for `key`, if it is still the one identified by `id`.
    fn live_session(&self, id: SessionId, key: &FlowKey) -> Option<&ActiveSession> {
        self.sessions.find(key).filter(|s| s.id() == id)
    }

    async fn on_upstream_data(&mut self, id: SessionId, key: FlowKey, payload: Bytes) {
        let Some(session) = self.sessions.find(&key).filter(|s| s.id() == id) else {
            debug!(session = %id, flow = %key, "Dropping datagram for destroyed session");
            return;
        };

        session.touch(&mut self.idle_timers);
        incr(&self.stats.upstream_rx_datagrams, 1);
        incr(&self.stats.upstream_rx_bytes, payload.len() as u64);

        match self.listener.send_to(&payload, key.peer).await {
            Ok(n) => {
                incr(&self.stats.downstream_tx_datagrams, 1);
                incr(&self.stats.downstream_tx_bytes, n as u64);
            }
            Err(e) => {
                incr(&self.stats.downstream_tx_errors, 1);
                warn!(session = %id, peer_addr = %key.peer, error = %e, "Downstream write failed");
            }
        }
    }

    fn on_idle_timeout(&mut self, id: SessionId, key: FlowKey) {
        if self.live_session(id, &key).is_none() {
            debug!(session = %id, flow = %key, "Idle timeout for destroyed session");
            return;
        }

        self.sessions.remove_expired(&key);
        incr(&self.stats.idle_timeouts, 1);
        incr(&self.stats.sessions_destroyed, 1);
        self.stats.sessions_active.fetch_sub(1, Ordering::Relaxed);
        debug!(session = %id, flow = %key, "Session idle timeout");
    }
}

impl Drop for UdpProxyFilter {
    fn drop(&mut self) {
        let remaining = self.sessions.len() as u64;
        if remaining > 0 {
            debug!(sessions = remaining, "Releasing sessions on filter teardown");
            self.sessions.clear(&mut self.idle_timers);
            incr(&self.stats.sessions_destroyed, remaining);
            self.stats
                .sessions_active
                .fetch_sub(remaining, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::cluster::{Host, StaticClusterManager};
    use crate::proxy::filter_config::{TokioTimeSource, UdpProxyConfig, UdpProxyFilterConfig};
    use std::time::Duration;
    use tokio::time::{timeout, Instant};

    async fn setup(config: UdpProxyConfig) -> (UdpProxyFilter, UdpSocket) {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let clusters = Arc::new(StaticClusterManager::new());
        clusters.update_cluster(
            "fake_cluster",
            vec![Host::new(upstream.local_addr().unwrap(), "upstream-1")],
        );

        let filter_config = Arc::new(UdpProxyFilterConfig::new(
            clusters,
            Arc::new(TokioTimeSource),
            config,
        ));
        let listener = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        (UdpProxyFilter::new(filter_config, listener), upstream)
    }

    fn datagram(peer: &str, payload: &'static [u8]) -> UdpRecvData {
        UdpRecvData::new(
            "10.0.0.2:80".parse().unwrap(),
            peer.parse().unwrap(),
            Bytes::from_static(payload),
            Instant::now(),
        )
    }

    #[tokio::test]
    async fn test_oversized_datagram_creates_no_session() {
        let mut config = UdpProxyConfig::new("fake_cluster");
        config.max_datagram_size = 4;
        let (mut filter, _upstream) = setup(config).await;

        filter.on_data(datagram("10.0.0.1:1000", b"hello")).await;

        assert!(filter.sessions().is_empty());
        assert_eq!(filter.stats().downstream_rx_oversize.load(Ordering::Relaxed), 1);
        assert_eq!(filter.stats().sessions_total.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_datagram_at_limit_is_forwarded() {
        let mut config = UdpProxyConfig::new("fake_cluster");
        config.max_datagram_size = 5;
        let (mut filter, upstream) = setup(config).await;

        filter.on_data(datagram("10.0.0.1:1000", b"hello")).await;

        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(1), upstream.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_oversized_idle_timeout_still_creates_session() {
        let mut config = UdpProxyConfig::new("fake_cluster");
        config.idle_timeout_ms = 110_000_000_000;
        let (mut filter, upstream) = setup(config).await;

        filter.on_data(datagram("10.0.0.1:1000", b"hello")).await;

        assert_eq!(filter.sessions().len(), 1);
        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(1), upstream.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_session_limit() {
        let mut config = UdpProxyConfig::new("fake_cluster");
        config.max_sessions = 1;
        let (mut filter, _upstream) = setup(config).await;

        filter.on_data(datagram("10.0.0.1:1000", b"a")).await;
        filter.on_data(datagram("10.0.0.1:1001", b"b")).await;
        filter.on_data(datagram("10.0.0.1:1000", b"c")).await;

        assert_eq!(filter.sessions().len(), 1);
        assert_eq!(filter.stats().sessions_overflow.load(Ordering::Relaxed), 1);
        assert_eq!(filter.stats().upstream_tx_datagrams.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_event_from_replaced_session_ignored() {
        let (mut filter, _upstream) = setup(UdpProxyConfig::new("fake_cluster")).await;
        filter.on_data(datagram("10.0.0.1:1000", b"a")).await;
        let key = *filter.sessions().keys().next().unwrap();
        let first = filter.sessions().find(&key).unwrap().id();

        filter
            .handle_event(SessionEvent::IdleTimeout {
                session: first,
                key,
            })
            .await;
        assert!(filter.sessions().is_empty());

        filter.on_data(datagram("10.0.0.1:1000", b"b")).await;
        let second = filter.sessions().find(&key).unwrap().id();
        assert_ne!(first, second);

        filter
            .handle_event(SessionEvent::UpstreamReadError {
                session: first,
                key,
                error: std::io::Error::other("stale"),
            })
            .await;

        assert_eq!(filter.stats().upstream_rx_errors.load(Ordering::Relaxed), 0);
        assert_eq!(filter.sessions().find(&key).unwrap().id(), second);
    }

    #[tokio::test]
    async fn test_drop_releases_sessions() {
        let (mut filter, _upstream) = setup(UdpProxyConfig::new("fake_cluster")).await;
        filter.on_data(datagram("10.0.0.1:1000", b"a")).await;
        filter.on_data(datagram("10.0.0.1:1001", b"b")).await;

        let stats = filter.shared_stats();
        drop(filter);

        assert_eq!(stats.sessions_active.load(Ordering::Relaxed), 0);
        assert_eq!(stats.sessions_destroyed.load(Ordering::Relaxed), 2);
    }
}

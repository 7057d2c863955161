//! Active proxy sessions.
//!
//! A session is the proxy-side state for one flow: the upstream host chosen
//! for it, a UDP socket connected to that host, the idle timer, and the reader
//! task that watches the socket for responses.
//!
//! Resources are acquired in that order (socket, timer, reader). The reader
//! task never touches session state; it reports what it reads to the owning
//! filter as [`SessionEvent`]s over a bounded queue, so every state change
//! happens on the filter's task. A full queue stops the reader, leaving
//! further datagrams in the socket's receive buffer.
//!
//! Dropping a session aborts its reader and closes its socket. The idle timer
//! lives in the filter's [`IdleTimers`] and is disarmed by the
//! [`SessionTable`](super::table::SessionTable) when it destroys the session.

use std::borrow::Borrow;
use std::hash::{Hash, Hasher};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::cluster::Host;
use super::flow::FlowKey;
use super::timer::{IdleTimerKey, IdleTimers};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identifier.
///
/// Distinguishes a session from a later one created for the same flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sess-{}", self.0)
    }
}

/// Asynchronous events delivered to the owning filter.
#[derive(Debug)]
pub enum SessionEvent {
    /// The upstream sent a datagram for the session.
    UpstreamData {
        session: SessionId,
        key: FlowKey,
        payload: Bytes,
    },
    /// The upstream sent a datagram larger than the configured maximum.
    UpstreamOversize {
        session: SessionId,
        key: FlowKey,
        size: usize,
    },
    /// Reading from the upstream socket failed.
    UpstreamReadError {
        session: SessionId,
        key: FlowKey,
        error: io::Error,
    },
    /// The session saw no traffic for the idle timeout.
    IdleTimeout { session: SessionId, key: FlowKey },
}

/// Errors while setting up a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Could not open a local socket for the upstream side.
    #[error("failed to bind upstream socket: {0}")]
    Bind(#[source] io::Error),

    /// Could not associate the socket with the upstream host.
    #[error("failed to connect upstream socket to {host}: {source}")]
    Connect {
        host: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Could not register the socket with the runtime.
    #[error("failed to register upstream socket: {0}")]
    Register(#[source] io::Error),
}

/// Open a non-blocking UDP socket connected to `host`.
///
/// The socket is bound to an ephemeral port on the unspecified address of the
/// host's family.
fn open_upstream_socket(host: SocketAddr) -> Result<UdpSocket, SessionError> {
    let bind_addr: SocketAddr = match host {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };

    let socket = std::net::UdpSocket::bind(bind_addr).map_err(SessionError::Bind)?;
    socket
        .connect(host)
        .map_err(|source| SessionError::Connect { host, source })?;
    socket
        .set_nonblocking(true)
        .map_err(SessionError::Register)?;
    UdpSocket::from_std(socket).map_err(SessionError::Register)
}

/// Proxy-side state for one flow.
///
/// Hashes and compares by its flow key only, and borrows as [`FlowKey`], so a
/// set of sessions can be probed with a bare key.
pub struct ActiveSession {
    id: SessionId,
    key: FlowKey,
    host: Arc<Host>,
    socket: Arc<UdpSocket>,
    idle_timer: IdleTimerKey,
    reader: JoinHandle<()>,
    created_at: Instant,
}

impl ActiveSession {
    /// Create a session for `key` bound to `host`.
    ///
    /// Arms the idle timer in `timers` and starts the upstream reader, which
    /// reports to `events`. Nothing is left behind if socket setup fails.
    pub fn create(
        key: FlowKey,
        host: Arc<Host>,
        timers: &mut IdleTimers,
        events: mpsc::Sender<SessionEvent>,
        max_datagram_size: usize,
        created_at: Instant,
    ) -> Result<Self, SessionError> {
        let id = SessionId::next();
        let socket = Arc::new(open_upstream_socket(host.address)?);
        let idle_timer = timers.arm(id, key);
        let reader = tokio::spawn(read_upstream(
            Arc::clone(&socket),
            id,
            key,
            max_datagram_size,
            events,
        ));

        debug!(
            session = %id,
            flow = %key,
            host = %host.address,
            host_id = %host.id,
            "Session created"
        );

        Ok(Self {
            id,
            key,
            host,
            socket,
            idle_timer,
            reader,
            created_at,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Flow this session serves.
    pub fn addresses(&self) -> &FlowKey {
        &self.key
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    /// Local address of the upstream socket.
    pub fn upstream_local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub(crate) fn idle_timer(&self) -> &IdleTimerKey {
        &self.idle_timer
    }

    /// Record activity, pushing the idle deadline back.
    pub fn touch(&self, timers: &mut IdleTimers) {
        timers.reset(&self.idle_timer);
    }

    /// Write one datagram to the upstream host.
    ///
    /// Counts as activity whether or not the write succeeds.
    pub async fn forward(&self, payload: &[u8], timers: &mut IdleTimers) -> io::Result<usize> {
        self.touch(timers);
        trace!(session = %self.id, len = payload.len(), "Forwarding to upstream");
        self.socket.send(payload).await
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.reader.abort();
        debug!(
            session = %self.id,
            flow = %self.key,
            lifetime_ms = self.created_at.elapsed().as_millis() as u64,
            "Session destroyed"
        );
    }
}

impl std::fmt::Debug for ActiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveSession")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl PartialEq for ActiveSession {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for ActiveSession {}

impl Hash for ActiveSession {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl Borrow<FlowKey> for ActiveSession {
    fn borrow(&self) -> &FlowKey {
        &self.key
    }
}

/// Read datagrams from the upstream socket until the filter goes away.
///
/// At most `max_datagram_size` bytes are accepted per datagram; the buffer
/// holds one extra byte so larger datagrams can be detected and rejected
/// instead of silently truncated.
async fn read_upstream(
    socket: Arc<UdpSocket>,
    session: SessionId,
    key: FlowKey,
    max_datagram_size: usize,
    events: mpsc::Sender<SessionEvent>,
) {
    let mut buf = vec![0u8; max_datagram_size + 1];
    loop {
        let event = match socket.recv(&mut buf).await {
            Ok(n) if n > max_datagram_size => SessionEvent::UpstreamOversize {
                session,
                key,
                size: n,
            },
            Ok(n) => SessionEvent::UpstreamData {
                session,
                key,
                payload: Bytes::copy_from_slice(&buf[..n]),
            },
            Err(error) => SessionEvent::UpstreamReadError {
                session,
                key,
                error,
            },
        };

        if events.send(event).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::RandomState;
    use std::hash::BuildHasher;
    use std::time::Duration;
    use tokio::time::timeout;

    fn flow() -> FlowKey {
        FlowKey::new(
            "10.0.0.2:80".parse().unwrap(),
            "10.0.0.1:1000".parse().unwrap(),
        )
    }

    async fn upstream() -> (UdpSocket, Arc<Host>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let host = Arc::new(Host::new(socket.local_addr().unwrap(), "upstream-1"));
        (socket, host)
    }

    #[tokio::test]
    async fn test_session_hashes_like_its_key() {
        let (_upstream, host) = upstream().await;
        let mut timers = IdleTimers::new(Duration::from_secs(60));
        let (tx, _rx) = mpsc::channel(16);

        let session =
            ActiveSession::create(flow(), host, &mut timers, tx, 1500, Instant::now()).unwrap();

        let state = RandomState::new();
        assert_eq!(state.hash_one(&session), state.hash_one(flow()));
        assert_eq!(Borrow::<FlowKey>::borrow(&session), &flow());
        assert_eq!(timers.len(), 1);
    }

    #[tokio::test]
    async fn test_forward_reaches_upstream() {
        let (upstream, host) = upstream().await;
        let mut timers = IdleTimers::new(Duration::from_secs(60));
        let (tx, _rx) = mpsc::channel(16);

        let session =
            ActiveSession::create(flow(), host, &mut timers, tx, 1500, Instant::now()).unwrap();
        session.forward(b"hello", &mut timers).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = timeout(Duration::from_secs(1), upstream.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from.port(), session.upstream_local_addr().unwrap().port());
    }

    #[tokio::test]
    async fn test_upstream_datagram_reported_as_event() {
        let (upstream, host) = upstream().await;
        let mut timers = IdleTimers::new(Duration::from_secs(60));
        let (tx, mut rx) = mpsc::channel(16);

        let session =
            ActiveSession::create(flow(), host, &mut timers, tx, 8, Instant::now()).unwrap();
        session.forward(b"ping", &mut timers).await.unwrap();

        let mut buf = [0u8; 64];
        let (_, session_addr) = upstream.recv_from(&mut buf).await.unwrap();
        upstream.send_to(b"pong", session_addr).await.unwrap();
        upstream.send_to(b"far-too-long", session_addr).await.unwrap();

        match timeout(Duration::from_secs(1), rx.recv()).await.unwrap() {
            Some(SessionEvent::UpstreamData {
                session: id,
                key,
                payload,
            }) => {
                assert_eq!(id, session.id());
                assert_eq!(key, flow());
                assert_eq!(&payload[..], b"pong");
            }
            other => panic!("Expected UpstreamData, got {:?}", other),
        }

        match timeout(Duration::from_secs(1), rx.recv()).await.unwrap() {
            Some(SessionEvent::UpstreamOversize { size, .. }) => assert!(size > 8),
            other => panic!("Expected UpstreamOversize, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_drop_stops_reader() {
        let (upstream, host) = upstream().await;
        let mut timers = IdleTimers::new(Duration::from_secs(60));
        let (tx, mut rx) = mpsc::channel(16);

        let session =
            ActiveSession::create(flow(), host, &mut timers, tx, 1500, Instant::now()).unwrap();
        session.forward(b"ping", &mut timers).await.unwrap();
        let mut buf = [0u8; 64];
        upstream.recv_from(&mut buf).await.unwrap();

        drop(session);

        // The aborted reader drops its event sender.
        let closed = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn test_reader_waits_for_queue_capacity() {
        let (upstream, host) = upstream().await;
        let mut timers = IdleTimers::new(Duration::from_secs(60));
        let (tx, mut rx) = mpsc::channel(1);

        let session =
            ActiveSession::create(flow(), host, &mut timers, tx, 1500, Instant::now()).unwrap();
        session.forward(b"ping", &mut timers).await.unwrap();

        let mut buf = [0u8; 64];
        let (_, session_addr) = upstream.recv_from(&mut buf).await.unwrap();
        let payloads: [&[u8]; 3] = [b"one", b"two", b"three"];
        for payload in payloads {
            upstream.send_to(payload, session_addr).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        // Only one event is queued; the rest wait in the socket buffer.
        assert_eq!(rx.len(), 1);

        for expected in payloads {
            match timeout(Duration::from_secs(1), rx.recv()).await.unwrap() {
                Some(SessionEvent::UpstreamData { payload, .. }) => {
                    assert_eq!(&payload[..], expected);
                }
                other => panic!("Expected UpstreamData, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_session_id_display() {
        let id = SessionId::from_raw(42);
        assert_eq!(id.to_string(), "sess-42");
        assert_eq!(id.as_u64(), 42);
    }
}

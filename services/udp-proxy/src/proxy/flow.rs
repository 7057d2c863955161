//! Flow identification for inbound datagrams.
//!
//! UDP has no connection setup, so the proxy infers a flow purely from the
//! addresses observed on each packet. Two datagrams with the same local and
//! peer address always belong to the same flow.

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use tokio::time::Instant;

/// Key identifying a flow by its local (listener) and peer (client) address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Address the datagram was received on.
    pub local: SocketAddr,
    /// Address the datagram was sent from.
    pub peer: SocketAddr,
}

impl FlowKey {
    /// Create a new flow key.
    pub fn new(local: SocketAddr, peer: SocketAddr) -> Self {
        Self { local, peer }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.peer, self.local)
    }
}

/// A datagram received on the downstream listener.
#[derive(Debug, Clone)]
pub struct UdpRecvData {
    /// Local and peer addresses of the datagram.
    pub addresses: FlowKey,
    /// Datagram payload.
    pub buffer: Bytes,
    /// When the listener received the datagram.
    pub receive_time: Instant,
}

impl UdpRecvData {
    pub fn new(local: SocketAddr, peer: SocketAddr, buffer: Bytes, receive_time: Instant) -> Self {
        Self {
            addresses: FlowKey::new(local, peer),
            buffer,
            receive_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::RandomState;
    use std::hash::BuildHasher;

    #[test]
    fn test_flow_key_structural_equality() {
        let a = FlowKey::new(
            "10.0.0.2:80".parse().unwrap(),
            "10.0.0.1:1000".parse().unwrap(),
        );
        let b = FlowKey::new(
            "10.0.0.2:80".parse().unwrap(),
            "10.0.0.1:1000".parse().unwrap(),
        );
        let other_peer = FlowKey::new(
            "10.0.0.2:80".parse().unwrap(),
            "10.0.0.1:1001".parse().unwrap(),
        );

        assert_eq!(a, b);
        assert_ne!(a, other_peer);

        let state = RandomState::new();
        assert_eq!(state.hash_one(a), state.hash_one(b));
    }

    #[test]
    fn test_flow_key_direction_matters() {
        let local: SocketAddr = "10.0.0.2:80".parse().unwrap();
        let peer: SocketAddr = "10.0.0.1:1000".parse().unwrap();

        assert_ne!(FlowKey::new(local, peer), FlowKey::new(peer, local));
    }

    #[test]
    fn test_flow_key_display() {
        let key = FlowKey::new("[::1]:53".parse().unwrap(), "[::1]:40000".parse().unwrap());
        assert_eq!(key.to_string(), "[::1]:40000 -> [::1]:53");
    }
}

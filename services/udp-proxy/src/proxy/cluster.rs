//! Upstream clusters and host selection.
//!
//! The session engine only needs "give me a host for this cluster". This
//! module defines that capability as the [`ClusterManager`] trait and ships a
//! static implementation:
//! - Round-robin among eligible hosts
//! - A host is eligible while its health is Healthy or Unknown
//! - Cluster updates are applied atomically (ArcSwap snapshot)

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{debug, info, warn};

/// An upstream endpoint datagrams can be forwarded to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Host {
    /// Upstream socket address.
    pub address: SocketAddr,
    /// Identifier used in logs.
    pub id: String,
}

impl Host {
    pub fn new(address: SocketAddr, id: impl Into<String>) -> Self {
        Self {
            address,
            id: id.into(),
        }
    }
}

/// Health status of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Host is healthy and eligible for new sessions.
    Healthy,
    /// Host is unhealthy and skipped by selection.
    Unhealthy,
    /// Host health is unknown (not yet observed). Treated as eligible.
    Unknown,
}

impl HealthStatus {
    fn as_u8(self) -> u8 {
        match self {
            HealthStatus::Unknown => 0,
            HealthStatus::Healthy => 1,
            HealthStatus::Unhealthy => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => HealthStatus::Healthy,
            2 => HealthStatus::Unhealthy,
            _ => HealthStatus::Unknown,
        }
    }
}

/// Resolves a cluster name to a host for a new session.
///
/// Implementations must be safe to call from many proxy workers at once.
pub trait ClusterManager: Send + Sync {
    /// Pick a host from `cluster`.
    ///
    /// Returns `None` when the cluster is unknown or has no eligible host.
    fn resolve(&self, cluster: &str) -> Option<Arc<Host>>;
}

struct HostState {
    host: Arc<Host>,
    health: AtomicU8,
}

impl HostState {
    fn new(host: Host, health: HealthStatus) -> Self {
        Self {
            host: Arc::new(host),
            health: AtomicU8::new(health.as_u8()),
        }
    }

    fn health(&self) -> HealthStatus {
        HealthStatus::from_u8(self.health.load(Ordering::Relaxed))
    }

    fn is_eligible(&self) -> bool {
        self.health() != HealthStatus::Unhealthy
    }
}

/// The hosts of one cluster.
struct Cluster {
    name: String,
    hosts: Vec<HostState>,
    rr_counter: AtomicUsize,
}

impl Cluster {
    fn new(name: String, hosts: Vec<HostState>) -> Self {
        Self {
            name,
            hosts,
            rr_counter: AtomicUsize::new(0),
        }
    }

    fn choose_host(&self) -> Option<Arc<Host>> {
        let eligible = self.hosts.iter().filter(|h| h.is_eligible()).count();
        if eligible == 0 {
            warn!(cluster = %self.name, "No eligible hosts");
            return None;
        }

        let idx = self.rr_counter.fetch_add(1, Ordering::Relaxed) % eligible;
        self.hosts
            .iter()
            .filter(|h| h.is_eligible())
            .nth(idx)
            .map(|h| Arc::clone(&h.host))
    }

    fn find(&self, address: SocketAddr) -> Option<&HostState> {
        self.hosts.iter().find(|h| h.host.address == address)
    }
}

/// Cluster manager backed by statically configured host lists.
///
/// Readers get consistent snapshots without blocking; writers swap in a new
/// snapshot atomically.
pub struct StaticClusterManager {
    clusters: ArcSwap<HashMap<String, Arc<Cluster>>>,
}

impl StaticClusterManager {
    /// Create a manager with no clusters.
    pub fn new() -> Self {
        Self {
            clusters: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Add a cluster or replace its host set.
    ///
    /// Hosts already present keep their health status. New hosts start as
    /// Unknown.
    pub fn update_cluster(&self, name: &str, hosts: Vec<Host>) {
        let host_count = hosts.len();
        self.clusters.rcu(|current| {
            let previous = current.get(name);
            let states = hosts
                .iter()
                .map(|host| {
                    let health = previous
                        .and_then(|c| c.find(host.address))
                        .map(|s| s.health())
                        .unwrap_or(HealthStatus::Unknown);
                    HostState::new(host.clone(), health)
                })
                .collect();

            let mut next = HashMap::clone(current);
            next.insert(
                name.to_string(),
                Arc::new(Cluster::new(name.to_string(), states)),
            );
            next
        });

        info!(cluster = %name, host_count = host_count, "Cluster updated");
    }

    /// Remove a cluster. Subsequent resolutions for it return `None`.
    pub fn remove_cluster(&self, name: &str) {
        self.clusters.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.remove(name);
            next
        });
        debug!(cluster = %name, "Cluster removed");
    }

    /// Mark a host as healthy.
    pub fn mark_healthy(&self, cluster: &str, address: SocketAddr) -> bool {
        self.set_health(cluster, address, HealthStatus::Healthy)
    }

    /// Mark a host as unhealthy, excluding it from selection.
    pub fn mark_unhealthy(&self, cluster: &str, address: SocketAddr) -> bool {
        self.set_health(cluster, address, HealthStatus::Unhealthy)
    }

    fn set_health(&self, cluster: &str, address: SocketAddr, health: HealthStatus) -> bool {
        let snapshot = self.clusters.load();
        match snapshot.get(cluster).and_then(|c| c.find(address)) {
            Some(state) => {
                state.health.store(health.as_u8(), Ordering::Relaxed);
                debug!(cluster = %cluster, host = %address, health = ?health, "Host health changed");
                true
            }
            None => false,
        }
    }

    /// Health of a host, if the host is known.
    pub fn health(&self, cluster: &str, address: SocketAddr) -> Option<HealthStatus> {
        let snapshot = self.clusters.load();
        snapshot
            .get(cluster)
            .and_then(|c| c.find(address))
            .map(|s| s.health())
    }

    /// Number of hosts in a cluster (0 if unknown).
    pub fn host_count(&self, cluster: &str) -> usize {
        self.clusters
            .load()
            .get(cluster)
            .map(|c| c.hosts.len())
            .unwrap_or(0)
    }

    /// Names of all configured clusters.
    pub fn cluster_names(&self) -> Vec<String> {
        self.clusters.load().keys().cloned().collect()
    }
}

impl Default for StaticClusterManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterManager for StaticClusterManager {
    fn resolve(&self, cluster: &str) -> Option<Arc<Host>> {
        let snapshot = self.clusters.load();
        match snapshot.get(cluster) {
            Some(c) => c.choose_host(),
            None => {
                debug!(cluster = %cluster, "Unknown cluster");
                None
            }
        }
    }
}

//! Session table keyed by flow.

use std::collections::HashSet;

use tracing::error;

use super::flow::FlowKey;
use super::session::ActiveSession;
use super::timer::IdleTimers;

/// Sessions of one filter, at most one per flow.
///
/// The table owns its sessions; removing a session destroys it and disarms
/// its idle timer. Lookups take a bare [`FlowKey`], no session needs to exist
/// to probe the table.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashSet<ActiveSession>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the session serving `key`.
    pub fn find(&self, key: &FlowKey) -> Option<&ActiveSession> {
        self.sessions.get(key)
    }

    pub fn contains(&self, key: &FlowKey) -> bool {
        self.sessions.contains(key)
    }

    /// Insert a new session.
    ///
    /// The caller checks with [`find`](Self::find) first. An existing session
    /// for the same flow is never replaced; a rejected session is destroyed.
    pub fn insert(&mut self, session: ActiveSession, timers: &mut IdleTimers) {
        let key = *session.addresses();
        debug_assert!(
            !self.sessions.contains(&key),
            "session for {key} already present"
        );
        if self.sessions.contains(&key) {
            error!(flow = %key, "Duplicate session insert ignored");
            timers.cancel(session.idle_timer());
            return;
        }
        self.sessions.insert(session);
    }

    /// Remove and destroy the session serving `key`, disarming its timer.
    ///
    /// Removing a flow with no session is a logic error: it panics in debug
    /// builds and is ignored otherwise.
    pub fn remove(&mut self, key: &FlowKey, timers: &mut IdleTimers) -> bool {
        let removed = self.take(key);
        if let Some(session) = &removed {
            timers.cancel(session.idle_timer());
        }
        removed.is_some()
    }

    /// Remove and destroy the session serving `key` after its idle timer
    /// fired. The fired timer is already gone from the queue.
    pub fn remove_expired(&mut self, key: &FlowKey) -> bool {
        self.take(key).is_some()
    }

    fn take(&mut self, key: &FlowKey) -> Option<ActiveSession> {
        let removed = self.sessions.take(key);
        debug_assert!(removed.is_some(), "no session for {key}");
        removed
    }

    /// Destroy every session, disarming their timers.
    pub fn clear(&mut self, timers: &mut IdleTimers) {
        for session in self.sessions.drain() {
            timers.cancel(session.idle_timer());
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Flows with a live session.
    pub fn keys(&self) -> impl Iterator<Item = &FlowKey> {
        self.sessions.iter().map(|s| s.addresses())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActiveSession> {
        self.sessions.iter()
    }
}

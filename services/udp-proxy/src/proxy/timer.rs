//! Per-session idle timers.
//!
//! All sessions of one filter share a single [`DelayQueue`]. A session holds
//! the queue key of its timer; activity in either direction resets it and an
//! expired entry names the session to destroy.

use std::future::poll_fn;
use std::time::Duration;

use tokio_util::time::{delay_queue, DelayQueue};

use super::flow::FlowKey;
use super::session::SessionId;

/// Handle to an armed idle timer.
pub type IdleTimerKey = delay_queue::Key;

/// Longest supported idle timeout. Longer timeouts are clamped to it.
pub const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Idle timers for the sessions of one filter.
pub struct IdleTimers {
    queue: DelayQueue<(SessionId, FlowKey)>,
    timeout: Duration,
}

impl IdleTimers {
    pub fn new(timeout: Duration) -> Self {
        Self {
            queue: DelayQueue::new(),
            timeout: timeout.min(MAX_IDLE_TIMEOUT),
        }
    }

    /// Arm a timer for a session, firing after the idle timeout.
    pub fn arm(&mut self, session: SessionId, key: FlowKey) -> IdleTimerKey {
        self.queue.insert((session, key), self.timeout)
    }

    /// Push an armed timer back to a full idle timeout from now.
    ///
    /// The timer must not have fired yet.
    pub fn reset(&mut self, timer: &IdleTimerKey) {
        self.queue.reset(timer, self.timeout);
    }

    /// Disarm a timer that has not fired yet.
    ///
    /// Keys of fired timers may be handed out again by [`arm`](Self::arm),
    /// so this must never be called with the key of a timer returned by
    /// [`expired`](Self::expired).
    pub fn cancel(&mut self, timer: &IdleTimerKey) {
        self.queue.try_remove(timer);
    }

    /// Wait for the next timer to fire.
    ///
    /// Returns `None` immediately when no timer is armed.
    pub async fn expired(&mut self) -> Option<(SessionId, FlowKey)> {
        poll_fn(|cx| self.queue.poll_expired(cx))
            .await
            .map(|expired| expired.into_inner())
    }

    /// Number of armed timers.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

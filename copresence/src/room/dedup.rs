//! Recent-action ledger for idempotency keys `(actor, topic, time window)`.

use std::collections::HashMap;
use std::time::Duration;

use copresence_proto::ids::{TopicId, UserId};

/// Remembers recent `(actor, topic)` actions with their timestamps.
#[derive(Debug, Clone)]
pub struct RecentActions {
    window_ms: u64,
    retention_ms: u64,
    seen: HashMap<(UserId, TopicId), Vec<u64>>,
}

impl RecentActions {
    /// Actions closer than `window` are the same logical action; anything
    /// older than `retention` is forgotten.
    #[must_use]
    pub fn new(window: Duration, retention: Duration) -> Self {
        Self {
            window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
            retention_ms: u64::try_from(retention.as_millis()).unwrap_or(u64::MAX),
            seen: HashMap::new(),
        }
    }

    /// Record an action. Returns `false` if it duplicates one already seen.
    pub fn observe(&mut self, actor: &UserId, topic: &TopicId, at: u64) -> bool {
        self.prune(at);
        let times = self.seen.entry((actor.clone(), topic.clone())).or_default();
        if times.iter().any(|&t| t.abs_diff(at) < self.window_ms) {
            tracing::debug!(actor = %actor, topic = %topic, at, "duplicate action");
            return false;
        }
        times.push(at);
        true
    }

    /// Forget one recorded action, e.g. a local action that never happened.
    pub fn forget(&mut self, actor: &UserId, topic: &TopicId, at: u64) {
        let key = (actor.clone(), topic.clone());
        if let Some(times) = self.seen.get_mut(&key) {
            times.retain(|&t| t != at);
            if times.is_empty() {
                self.seen.remove(&key);
            }
        }
    }

    /// Forget actions older than the retention period relative to `now`.
    pub fn prune(&mut self, now: u64) {
        let horizon = now.saturating_sub(self.retention_ms);
        self.seen.retain(|_, times| {
            times.retain(|&t| t >= horizon);
            !times.is_empty()
        });
    }

    /// Number of remembered actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.values().map(Vec::len).sum()
    }

    /// Whether nothing is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

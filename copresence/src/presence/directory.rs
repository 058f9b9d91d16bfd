//! Client-side cache of other users' presence.
//!
//! Three write paths:
//! - snapshots replace the whole map,
//! - push incrementals upsert one entry (last arrival wins),
//! - polled reports upsert only when strictly newer than the cached entry.
//!
//! Entries about the local user are never stored. While a pairing handshake
//! awaits its acknowledgment every write path is gated shut, polls included:
//! a poll started before a reconnect may land after the handshake was resent.

use std::collections::{BTreeMap, HashMap};

use copresence_proto::ids::UserId;
use copresence_proto::presence::{PresenceEntry, PresenceUpdate};

/// Result of offering an update to the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The directory changed.
    Applied,
    /// The update described the local user and was discarded.
    SelfEcho,
    /// Rejected until the pending handshake is acknowledged.
    AwaitingHandshake,
    /// Polled result not newer than the cached entry.
    Stale,
}

/// Presence cache keyed by user.
#[derive(Debug, Clone)]
pub struct PresenceDirectory {
    self_id: UserId,
    entries: HashMap<UserId, PresenceEntry>,
    gated: bool,
}

impl PresenceDirectory {
    /// Creates an empty, open directory for `self_id`.
    #[must_use]
    pub fn new(self_id: UserId) -> Self {
        Self {
            self_id,
            entries: HashMap::new(),
            gated: false,
        }
    }

    /// Replace every entry with `map`, dropping the local user's entry.
    pub fn apply_snapshot(&mut self, map: BTreeMap<UserId, PresenceEntry>) -> ApplyOutcome {
        if self.gated {
            return ApplyOutcome::AwaitingHandshake;
        }
        self.entries = map
            .into_iter()
            .filter(|(user, _)| *user != self.self_id)
            .collect();
        tracing::debug!(entries = self.entries.len(), "directory replaced from snapshot");
        ApplyOutcome::Applied
    }

    /// Upsert a push-delivered update.
    ///
    /// `received_at` stands in for the timestamp when the update carries none.
    pub fn apply_incremental(&mut self, update: &PresenceUpdate, received_at: u64) -> ApplyOutcome {
        if update.user_id == self.self_id {
            return ApplyOutcome::SelfEcho;
        }
        if self.gated {
            return ApplyOutcome::AwaitingHandshake;
        }
        let mut entry = update.to_entry();
        if entry.observed_at == 0 {
            entry.observed_at = received_at;
        }
        self.entries.insert(update.user_id.clone(), entry);
        ApplyOutcome::Applied
    }

    /// Upsert a polled report if it is strictly newer than what is cached.
    pub fn apply_polled(&mut self, update: &PresenceUpdate) -> ApplyOutcome {
        if update.user_id == self.self_id {
            return ApplyOutcome::SelfEcho;
        }
        if self.gated {
            return ApplyOutcome::AwaitingHandshake;
        }
        let newer = self
            .entries
            .get(&update.user_id)
            .is_none_or(|existing| update.at > existing.observed_at);
        if !newer {
            return ApplyOutcome::Stale;
        }
        self.entries.insert(update.user_id.clone(), update.to_entry());
        ApplyOutcome::Applied
    }

    /// Cached presence of `user`.
    #[must_use]
    pub fn get(&self, user: &UserId) -> Option<&PresenceEntry> {
        self.entries.get(user)
    }

    /// Reject updates until [`open_gate`](Self::open_gate).
    pub const fn close_gate(&mut self) {
        self.gated = true;
    }

    /// Accept updates again.
    pub const fn open_gate(&mut self) {
        self.gated = false;
    }

    /// Whether updates are currently rejected.
    #[must_use]
    pub const fn is_gated(&self) -> bool {
        self.gated
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

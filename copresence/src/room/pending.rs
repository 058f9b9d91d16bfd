//! Ledger of optimistic mutations awaiting the authority's answer.

use std::collections::BTreeSet;

use copresence_proto::ids::{MutationId, TopicId, UserId};
use copresence_proto::room::{RoomProgress, RoomSnapshot};

/// User-initiated room changes that are applied optimistically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    /// Mark a topic complete for the local user.
    CompleteTopic,
    /// Undo the local user's completion of a topic.
    ReopenTopic,
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CompleteTopic => write!(f, "complete"),
            Self::ReopenTopic => write!(f, "reopen"),
        }
    }
}

/// Lifecycle of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    /// Applied locally, request in flight.
    Pending,
    /// The authority accepted it; its fields replaced the local guess.
    Confirmed,
    /// The request failed; the pre-image was restored.
    RolledBack,
    /// The authority's state moved; the guess was dropped for a refetch.
    Superseded,
}

/// Everything an optimistic patch touches, captured before applying it.
#[derive(Debug, Clone, PartialEq)]
pub struct PreImage {
    /// Completion set of the topic.
    pub completed_by: BTreeSet<UserId>,
    /// The acting member's progress, if the member is known.
    pub member_percent: Option<f64>,
    /// Room-wide progress.
    pub progress: RoomProgress,
}

impl PreImage {
    /// Capture the pre-image of `topic` for `actor` from `snapshot`.
    #[must_use]
    pub fn capture(snapshot: &RoomSnapshot, topic: &TopicId, actor: &UserId) -> Option<Self> {
        let entry = snapshot.topic(topic)?;
        Some(Self {
            completed_by: entry.completed_by.clone(),
            member_percent: snapshot.member(actor).map(|m| m.progress_percent),
            progress: snapshot.progress.clone(),
        })
    }

    /// Write the captured fields back into `snapshot`.
    pub fn restore(&self, snapshot: &mut RoomSnapshot, topic: &TopicId, actor: &UserId) {
        if let Some(entry) = snapshot.topic_mut(topic) {
            entry.completed_by.clone_from(&self.completed_by);
        }
        if let (Some(percent), Some(member)) = (self.member_percent, snapshot.member_mut(actor)) {
            member.progress_percent = percent;
        }
        snapshot.progress = self.progress.clone();
    }
}

/// One optimistic mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
    /// Stable identity of the mutation.
    pub id: MutationId,
    /// What the mutation does.
    pub kind: MutationKind,
    /// Target topic.
    pub topic_id: TopicId,
    /// State before the optimistic patch.
    pub pre_image: PreImage,
    /// Lifecycle status.
    pub status: MutationStatus,
    /// Milliseconds since epoch when the mutation was started.
    pub started_at: u64,
    /// The authority broadcast the same action while the request was in
    /// flight, so a failed response no longer proves it was not applied.
    pub confirmed_by_push: bool,
}

impl PendingMutation {
    /// Apply the optimistic patch for this mutation to `snapshot`.
    pub fn apply(&self, snapshot: &mut RoomSnapshot, actor: &UserId) {
        if let Some(entry) = snapshot.topic_mut(&self.topic_id) {
            match self.kind {
                MutationKind::CompleteTopic => {
                    entry.completed_by.insert(actor.clone());
                }
                MutationKind::ReopenTopic => {
                    entry.completed_by.remove(actor);
                }
            }
        }
    }
}

/// Mutations that are still pending, in start order.
#[derive(Debug, Clone, Default)]
pub struct PendingLedger {
    entries: Vec<PendingMutation>,
}

impl PendingLedger {
    /// Record a new pending mutation.
    pub fn insert(&mut self, mutation: PendingMutation) {
        self.entries.push(mutation);
    }

    /// Remove a mutation and stamp it with its final `status`.
    pub fn finish(&mut self, id: MutationId, status: MutationStatus) -> Option<PendingMutation> {
        let index = self.entries.iter().position(|m| m.id == id)?;
        let mut mutation = self.entries.remove(index);
        mutation.status = status;
        Some(mutation)
    }

    /// Look up a pending mutation.
    #[must_use]
    pub fn get(&self, id: MutationId) -> Option<&PendingMutation> {
        self.entries.iter().find(|m| m.id == id)
    }

    /// Whether a mutation on `topic` is in flight.
    #[must_use]
    pub fn has_topic(&self, topic: &TopicId) -> bool {
        self.entries.iter().any(|m| m.topic_id == *topic)
    }

    /// Pending mutations in start order.
    pub fn iter(&self) -> impl Iterator<Item = &PendingMutation> {
        self.entries.iter()
    }

    /// The pending completion of `topic`, if one is in flight.
    pub fn completion_of(&mut self, topic: &TopicId) -> Option<&mut PendingMutation> {
        self.entries
            .iter_mut()
            .find(|m| m.kind == MutationKind::CompleteTopic && m.topic_id == *topic)
    }

    /// Mutable access for rebasing onto a fresh snapshot.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PendingMutation> {
        self.entries.iter_mut()
    }

    /// Number of pending mutations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

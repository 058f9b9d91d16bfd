//! Room synchronization: cached snapshot, push reconciliation and the
//! optimistic mutation protocol.
//!
//! `RoomSync` is a plain state holder. The client actor feeds it events and
//! pull responses and performs the I/O it asks for.
//!
//! # Reconciliation
//!
//! | Event                 | Strategy                                  |
//! |-----------------------|-------------------------------------------|
//! | `room.messageCreated` | patch (append)                            |
//! | `room.progressUpdated`| patch if the member is known, else refetch |
//! | `room.topicCompleted` | refetch, unless it duplicates a recent action |
//! | `room.memberChanged`  | refetch                                   |
//! | `room.contentReady`   | refetch                                   |
//! | `room.boardChanged`   | refetch                                   |
//!
//! Refetches coalesce: while one is in flight further requests are folded
//! into a single follow-up fetch.

use copresence_proto::event::ChannelEvent;
use copresence_proto::ids::{MutationId, RoomId, TopicId, UserId};
use copresence_proto::room::{CompletionResult, RoomSnapshot};

use crate::config::SyncConfig;
use crate::error::SyncError;

use super::dedup::RecentActions;
use super::pending::{MutationKind, MutationStatus, PendingLedger, PendingMutation, PreImage};

/// What the layer decided to do with an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Applied in place.
    Patched,
    /// The caller must fetch an authoritative snapshot.
    Refetch,
    /// Same logical action as one already applied.
    Deduplicated,
    /// Not for this room, not a room event, or reconciliation is suspended.
    Ignored,
}

#[derive(Debug, Clone, Copy, Default)]
struct RefetchState {
    in_flight: bool,
    queued: bool,
}

/// Client-side view of one room.
#[derive(Debug, Clone)]
pub struct RoomSync {
    room_id: RoomId,
    self_id: UserId,
    snapshot: Option<RoomSnapshot>,
    pending: PendingLedger,
    recent: RecentActions,
    stale: bool,
    suspended: bool,
    refetch: RefetchState,
}

impl RoomSync {
    /// Creates an empty view of `room_id` for the local user `self_id`.
    #[must_use]
    pub fn new(room_id: RoomId, self_id: UserId, config: &SyncConfig) -> Self {
        Self {
            room_id,
            self_id,
            snapshot: None,
            pending: PendingLedger::default(),
            recent: RecentActions::new(config.dedup_window, config.dedup_retention),
            stale: true,
            suspended: false,
            refetch: RefetchState::default(),
        }
    }

    /// The room this view tracks.
    #[must_use]
    pub const fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Current snapshot, including optimistic patches.
    #[must_use]
    pub const fn snapshot(&self) -> Option<&RoomSnapshot> {
        self.snapshot.as_ref()
    }

    /// Whether the snapshot must be refetched before it can be trusted.
    #[must_use]
    pub const fn is_stale(&self) -> bool {
        self.stale
    }

    /// Whether push reconciliation is suspended.
    #[must_use]
    pub const fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Mutations awaiting the authority.
    #[must_use]
    pub const fn pending(&self) -> &PendingLedger {
        &self.pending
    }

    /// Reconcile a push event against the cached snapshot.
    pub fn on_event(&mut self, event: &ChannelEvent) -> Reconciliation {
        if event.room_id() != Some(&self.room_id) || self.suspended {
            return Reconciliation::Ignored;
        }

        match event {
            ChannelEvent::MessageCreated { message, .. } => {
                let Some(snapshot) = self.snapshot.as_mut() else {
                    return Reconciliation::Refetch;
                };
                if snapshot.messages.iter().any(|m| m.id == message.id) {
                    return Reconciliation::Deduplicated;
                }
                snapshot.messages.push(message.clone());
                Reconciliation::Patched
            }
            ChannelEvent::ProgressUpdated {
                user_id, percent, ..
            } => match self.snapshot.as_mut().and_then(|s| s.member_mut(user_id)) {
                Some(member) => {
                    member.progress_percent = *percent;
                    Reconciliation::Patched
                }
                None => Reconciliation::Refetch,
            },
            ChannelEvent::TopicCompleted {
                user_id,
                topic_id,
                at,
                ..
            } => {
                if *user_id == self.self_id
                    && let Some(mutation) = self.pending.completion_of(topic_id)
                {
                    mutation.confirmed_by_push = true;
                    tracing::debug!(room = %self.room_id, topic = %topic_id, mutation = %mutation.id, "own completion announced by authority");
                    return Reconciliation::Deduplicated;
                }
                if self.recent.observe(user_id, topic_id, *at) {
                    Reconciliation::Refetch
                } else {
                    Reconciliation::Deduplicated
                }
            }
            ChannelEvent::MemberChanged { .. }
            | ChannelEvent::ContentReady { .. }
            | ChannelEvent::BoardChanged { .. } => Reconciliation::Refetch,
            _ => Reconciliation::Ignored,
        }
    }

    /// Ask for a refetch. Returns `true` if the caller should start one now;
    /// `false` if one is already running and this request was folded into it.
    pub const fn request_refetch(&mut self) -> bool {
        if self.refetch.in_flight {
            self.refetch.queued = true;
            false
        } else {
            self.refetch.in_flight = true;
            true
        }
    }

    /// Replace the snapshot with an authoritative one.
    ///
    /// Pending mutations are rebased: their pre-images are recaptured from
    /// the fresh snapshot and their patches reapplied. A mutation whose topic
    /// is gone from the snapshot is superseded. Returns `true` if a follow-up
    /// refetch was requested meanwhile and should start now.
    pub fn accept_snapshot(&mut self, mut snapshot: RoomSnapshot) -> bool {
        let mut vanished = Vec::new();
        for mutation in self.pending.iter_mut() {
            match PreImage::capture(&snapshot, &mutation.topic_id, &self.self_id) {
                Some(pre_image) => {
                    mutation.pre_image = pre_image;
                    mutation.apply(&mut snapshot, &self.self_id);
                }
                None => vanished.push(mutation.id),
            }
        }
        for id in vanished {
            if let Some(mutation) = self.pending.finish(id, MutationStatus::Superseded) {
                tracing::debug!(room = %self.room_id, mutation = %id, topic = %mutation.topic_id, "topic gone, mutation superseded");
            }
        }
        tracing::debug!(
            room = %self.room_id,
            members = snapshot.members.len(),
            pending = self.pending.len(),
            "room snapshot accepted"
        );
        self.snapshot = Some(snapshot);
        self.stale = false;
        self.finish_refetch()
    }

    /// Record that a refetch failed. The snapshot stays stale. Returns `true`
    /// if a follow-up refetch should start now.
    pub const fn refetch_failed(&mut self) -> bool {
        self.finish_refetch()
    }

    const fn finish_refetch(&mut self) -> bool {
        if self.refetch.queued {
            self.refetch.queued = false;
            true
        } else {
            self.refetch.in_flight = false;
            false
        }
    }

    /// Apply a user-initiated change optimistically and record it.
    ///
    /// # Errors
    ///
    /// - [`SyncError::StaleState`] if there is no trusted snapshot.
    /// - [`SyncError::Validation`] if the topic is unknown, a mutation on it
    ///   is already in flight, or the change would be a no-op.
    pub fn begin_mutation(
        &mut self,
        kind: MutationKind,
        topic: &TopicId,
        now_ms: u64,
    ) -> Result<MutationId, SyncError> {
        if self.stale {
            return Err(SyncError::StaleState);
        }
        let snapshot = self.snapshot.as_mut().ok_or(SyncError::StaleState)?;
        let pre_image = PreImage::capture(snapshot, topic, &self.self_id)
            .ok_or_else(|| SyncError::Validation(format!("unknown topic {topic}")))?;
        if self.pending.has_topic(topic) {
            return Err(SyncError::Validation(format!(
                "a change to {topic} is already in flight"
            )));
        }
        let completed = pre_image.completed_by.contains(&self.self_id);
        match (kind, completed) {
            (MutationKind::CompleteTopic, true) => {
                return Err(SyncError::Validation(format!("{topic} is already complete")));
            }
            (MutationKind::ReopenTopic, false) => {
                return Err(SyncError::Validation(format!("{topic} is not complete")));
            }
            _ => {}
        }

        let mutation = PendingMutation {
            id: MutationId::new(),
            kind,
            topic_id: topic.clone(),
            pre_image,
            status: MutationStatus::Pending,
            started_at: now_ms,
            confirmed_by_push: false,
        };
        mutation.apply(snapshot, &self.self_id);
        if kind == MutationKind::CompleteTopic {
            self.recent.observe(&self.self_id, topic, now_ms);
        }
        let id = mutation.id;
        tracing::debug!(room = %self.room_id, topic = %topic, %kind, mutation = %id, "optimistic mutation applied");
        self.pending.insert(mutation);
        Ok(id)
    }

    /// Accept the authority's fields verbatim in place of the local guess.
    pub fn confirm(&mut self, id: MutationId, result: &CompletionResult) -> Option<PendingMutation> {
        let mutation = self.pending.finish(id, MutationStatus::Confirmed)?;
        if let Some(snapshot) = self.snapshot.as_mut() {
            if let Some(topic) = snapshot.topic_mut(&result.topic_id) {
                topic.completed_by.clone_from(&result.completed_by);
            }
            if let Some(member) = snapshot.member_mut(&result.member.user_id) {
                member.progress_percent = result.member.percent;
            }
            snapshot.progress = result.progress.clone();
        }
        tracing::debug!(room = %self.room_id, mutation = %id, "mutation confirmed");
        Some(mutation)
    }

    /// Resolve a failed mutation.
    ///
    /// Restores the exact pre-image and forgets the action's idempotency key,
    /// so a later broadcast of the same action is reconciled. If the authority
    /// already announced the action, the failure does not prove it was not
    /// applied: the mutation is superseded instead and the snapshot marked
    /// stale until refetched.
    pub fn rollback(&mut self, id: MutationId) -> Option<PendingMutation> {
        if self.pending.get(id)?.confirmed_by_push {
            let mutation = self.pending.finish(id, MutationStatus::Superseded)?;
            self.stale = true;
            tracing::debug!(room = %self.room_id, mutation = %id, "failed mutation was announced by authority");
            return Some(mutation);
        }
        let mutation = self.pending.finish(id, MutationStatus::RolledBack)?;
        if let Some(snapshot) = self.snapshot.as_mut() {
            mutation
                .pre_image
                .restore(snapshot, &mutation.topic_id, &self.self_id);
        }
        if mutation.kind == MutationKind::CompleteTopic {
            self.recent
                .forget(&self.self_id, &mutation.topic_id, mutation.started_at);
        }
        tracing::debug!(room = %self.room_id, mutation = %id, "mutation rolled back");
        Some(mutation)
    }

    /// Drop a mutation the authority rejected as conflicting, without
    /// restoring. The snapshot is marked stale until refetched.
    pub fn abandon_for_conflict(&mut self, id: MutationId) -> Option<PendingMutation> {
        let mutation = self.pending.finish(id, MutationStatus::Superseded)?;
        self.stale = true;
        tracing::debug!(room = %self.room_id, mutation = %id, "mutation superseded by authority");
        Some(mutation)
    }

    /// Channel dropped: stop reconciling push events and distrust the cache.
    pub const fn suspend(&mut self) {
        self.suspended = true;
        self.stale = true;
    }

    /// Channel restored: accept push events again. The caller refetches.
    pub const fn resume(&mut self) {
        self.suspended = false;
    }
}

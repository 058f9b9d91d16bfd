//! Room state wire types: authoritative snapshots and mutation results.
//!
//! A [`RoomSnapshot`] is what the authority returns from a room fetch. The
//! client replaces its cached snapshot with a fresh one as a whole unit and
//! applies field-level patches in between.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ids::{RoomId, TopicId, UserId};

/// A room member and their server-derived progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    /// Member identity.
    pub user_id: UserId,
    /// Name shown to other members.
    pub display_name: String,
    /// Completion percentage computed by the authority (0.0..=100.0).
    #[serde(default)]
    pub progress_percent: f64,
}

/// Room-wide progress as computed by the authority.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomProgress {
    /// Overall completion percentage across members.
    pub overall_percent: f64,
    /// Number of topics completed by at least one member.
    pub completed_topics: u32,
    /// Number of topics in the roadmap.
    pub total_topics: u32,
}

/// A node of the room's roadmap/topic tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topic {
    /// Topic identity.
    pub id: TopicId,
    /// Topic title.
    pub title: String,
    /// Members who have completed this topic.
    #[serde(default)]
    pub completed_by: BTreeSet<UserId>,
    /// Child topics.
    #[serde(default)]
    pub subtopics: Vec<Topic>,
}

impl Topic {
    /// Finds a topic by id in this subtree.
    #[must_use]
    pub fn find(&self, id: &TopicId) -> Option<&Self> {
        if self.id == *id {
            return Some(self);
        }
        self.subtopics.iter().find_map(|t| t.find(id))
    }

    /// Finds a topic by id in this subtree, mutably.
    pub fn find_mut(&mut self, id: &TopicId) -> Option<&mut Self> {
        if self.id == *id {
            return Some(self);
        }
        self.subtopics.iter_mut().find_map(|t| t.find_mut(id))
    }
}

/// A chat message posted in a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMessage {
    /// Message identity assigned by the authority.
    pub id: String,
    /// Author of the message.
    pub author: UserId,
    /// Message body.
    pub body: String,
    /// Milliseconds since epoch when the authority accepted the message.
    pub at: u64,
}

/// Authoritative state of a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    /// Room identity.
    pub room_id: RoomId,
    /// Current members.
    pub members: Vec<Member>,
    /// Derived progress.
    #[serde(default)]
    pub progress: RoomProgress,
    /// Roadmap topic tree.
    #[serde(default)]
    pub roadmap: Vec<Topic>,
    /// Most recent messages, oldest first.
    #[serde(default)]
    pub messages: Vec<RoomMessage>,
}

impl RoomSnapshot {
    /// Creates an empty snapshot for a room.
    #[must_use]
    pub fn empty(room_id: RoomId) -> Self {
        Self {
            room_id,
            members: Vec::new(),
            progress: RoomProgress::default(),
            roadmap: Vec::new(),
            messages: Vec::new(),
        }
    }

    /// Finds a topic anywhere in the roadmap.
    #[must_use]
    pub fn topic(&self, id: &TopicId) -> Option<&Topic> {
        self.roadmap.iter().find_map(|t| t.find(id))
    }

    /// Finds a topic anywhere in the roadmap, mutably.
    pub fn topic_mut(&mut self, id: &TopicId) -> Option<&mut Topic> {
        self.roadmap.iter_mut().find_map(|t| t.find_mut(id))
    }

    /// Finds a member by id.
    #[must_use]
    pub fn member(&self, user_id: &UserId) -> Option<&Member> {
        self.members.iter().find(|m| m.user_id == *user_id)
    }

    /// Finds a member by id, mutably.
    pub fn member_mut(&mut self, user_id: &UserId) -> Option<&mut Member> {
        self.members.iter_mut().find(|m| m.user_id == *user_id)
    }
}

/// A single member's recalculated progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberProgress {
    /// Whose progress this is.
    pub user_id: UserId,
    /// Recalculated completion percentage.
    pub percent: f64,
}

/// Fields returned by the authority after a topic completion mutation.
///
/// The client accepts these verbatim in place of its optimistic guess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResult {
    /// The topic that was mutated.
    pub topic_id: TopicId,
    /// Authoritative completion set for the topic.
    pub completed_by: BTreeSet<UserId>,
    /// Recalculated progress of the acting member.
    pub member: MemberProgress,
    /// Recalculated room-wide progress.
    pub progress: RoomProgress,
}

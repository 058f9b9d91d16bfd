//! Push-channel event taxonomy.
//!
//! Every frame on the channel is one [`ChannelEvent`], serialized as
//! `{"event": "<name>", "data": {...}}`. The set is closed: consumers match
//! exhaustively instead of probing payload shapes at runtime.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::{RoomId, TopicId, UserId};
use crate::legacy::LegacyActivity;
use crate::presence::{PresenceEntry, PresenceUpdate};
use crate::room::RoomMessage;

/// A single frame on the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum ChannelEvent {
    /// Client authenticates the freshly opened channel.
    ///
    /// Must be the first frame sent. The server answers with
    /// [`ChannelEvent::SessionReady`] or [`ChannelEvent::SessionRejected`].
    #[serde(rename = "session:auth")]
    SessionAuth {
        /// Bearer token of the session.
        token: String,
    },

    /// Server accepted the token.
    #[serde(rename = "session:ready")]
    SessionReady {
        /// Identity bound to the token.
        user_id: UserId,
    },

    /// Server rejected the token. Fatal for the session.
    #[serde(rename = "session:rejected")]
    SessionRejected {
        /// Human-readable rejection reason.
        reason: String,
    },

    /// Pairing handshake. Idempotent; resent after every reconnect.
    #[serde(rename = "presence:init")]
    PresenceInit {
        /// The local user.
        self_id: UserId,
        /// The counterpart, if one is known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partner_id: Option<UserId>,
    },

    /// Server acknowledged a handshake.
    #[serde(rename = "presence:ack")]
    PresenceAck {
        /// The acknowledged local user.
        self_id: UserId,
        /// The acknowledged counterpart.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partner_id: Option<UserId>,
    },

    /// Incremental directory upsert.
    #[serde(rename = "presence:update")]
    PresenceUpdate(PresenceUpdate),

    /// Full directory replacement.
    #[serde(rename = "presence:snapshot")]
    PresenceSnapshot {
        /// Complete presence map.
        map: BTreeMap<UserId, PresenceEntry>,
    },

    /// Liveness ping, fire-and-forget.
    #[serde(rename = "presence:heartbeat")]
    Heartbeat {},

    /// Subscribe to a room-scoped event stream.
    #[serde(rename = "room:join")]
    RoomJoin {
        /// Room to subscribe to.
        room_id: RoomId,
    },

    /// Unsubscribe from a room-scoped event stream.
    #[serde(rename = "room:leave")]
    RoomLeave {
        /// Room to unsubscribe from.
        room_id: RoomId,
    },

    /// Membership changed; triggers a refetch.
    #[serde(rename = "room.memberChanged")]
    MemberChanged {
        /// Affected room.
        room_id: RoomId,
        /// New member list.
        members: Vec<UserId>,
    },

    /// A member completed a topic; triggers a refetch.
    #[serde(rename = "room.topicCompleted")]
    TopicCompleted {
        /// Affected room.
        room_id: RoomId,
        /// Member who completed the topic.
        user_id: UserId,
        /// Completed topic.
        topic_id: TopicId,
        /// Milliseconds since epoch when the completion happened.
        at: u64,
    },

    /// A member's progress changed; patchable when the member is known.
    #[serde(rename = "room.progressUpdated")]
    ProgressUpdated {
        /// Affected room.
        room_id: RoomId,
        /// Member whose progress changed.
        user_id: UserId,
        /// New completion percentage.
        percent: f64,
    },

    /// A message was posted; patchable append.
    #[serde(rename = "room.messageCreated")]
    MessageCreated {
        /// Affected room.
        room_id: RoomId,
        /// The new message.
        message: RoomMessage,
    },

    /// Derived content (quizzes, summaries) became available; triggers a refetch.
    #[serde(rename = "room.contentReady")]
    ContentReady {
        /// Affected room.
        room_id: RoomId,
    },

    /// The shared board changed; triggers a refetch.
    #[serde(rename = "room.boardChanged")]
    BoardChanged {
        /// Affected room.
        room_id: RoomId,
    },

    /// Legacy activity-tracker frame, accepted only via the translation adapter.
    #[serde(rename = "activity:update")]
    LegacyActivity(LegacyActivity),
}

impl ChannelEvent {
    /// Wire name of the event, for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SessionAuth { .. } => "session:auth",
            Self::SessionReady { .. } => "session:ready",
            Self::SessionRejected { .. } => "session:rejected",
            Self::PresenceInit { .. } => "presence:init",
            Self::PresenceAck { .. } => "presence:ack",
            Self::PresenceUpdate(_) => "presence:update",
            Self::PresenceSnapshot { .. } => "presence:snapshot",
            Self::Heartbeat {} => "presence:heartbeat",
            Self::RoomJoin { .. } => "room:join",
            Self::RoomLeave { .. } => "room:leave",
            Self::MemberChanged { .. } => "room.memberChanged",
            Self::TopicCompleted { .. } => "room.topicCompleted",
            Self::ProgressUpdated { .. } => "room.progressUpdated",
            Self::MessageCreated { .. } => "room.messageCreated",
            Self::ContentReady { .. } => "room.contentReady",
            Self::BoardChanged { .. } => "room.boardChanged",
            Self::LegacyActivity(_) => "activity:update",
        }
    }

    /// The room a room-scoped stream event belongs to.
    ///
    /// Returns `None` for session, presence and subscription frames.
    #[must_use]
    pub const fn room_id(&self) -> Option<&RoomId> {
        match self {
            Self::MemberChanged { room_id, .. }
            | Self::TopicCompleted { room_id, .. }
            | Self::ProgressUpdated { room_id, .. }
            | Self::MessageCreated { room_id, .. }
            | Self::ContentReady { room_id }
            | Self::BoardChanged { room_id } => Some(room_id),
            _ => None,
        }
    }
}

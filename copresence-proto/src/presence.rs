//! Presence status types for online/idle/do-not-disturb/offline tracking.

use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// Live status of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PresenceStatus {
    /// User is actively using the client.
    Online,
    /// No input observed for at least the inactivity threshold.
    Idle,
    /// User explicitly asked not to be disturbed.
    DoNotDisturb,
    /// Session closed, or the authority stopped receiving heartbeats.
    Offline,
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Idle => write!(f, "idle"),
            Self::DoNotDisturb => write!(f, "do-not-disturb"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// What a user is currently doing, e.g. `studying` a topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Activity {
    /// Free-form activity kind (`studying`, `reviewing`, ...).
    pub kind: String,
    /// Optional subject of the activity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

impl Activity {
    /// Creates an activity with a topic.
    pub fn new(kind: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            topic: Some(topic.into()),
        }
    }

    /// Creates an activity without a topic.
    pub fn kind_only(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            topic: None,
        }
    }
}

/// Last-known presence of one user, as held in a snapshot or directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    /// Current status.
    pub status: PresenceStatus,
    /// Current activity, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<Activity>,
    /// Milliseconds since epoch when the authority observed this state.
    #[serde(default)]
    pub observed_at: u64,
}

/// Incremental presence upsert for a single user (`presence:update`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    /// Subject of the update.
    pub user_id: UserId,
    /// New status.
    pub status: PresenceStatus,
    /// New activity, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<Activity>,
    /// Milliseconds since epoch when the change happened. Zero when unknown.
    #[serde(default)]
    pub at: u64,
}

impl PresenceUpdate {
    /// Converts the update into the directory entry it describes.
    #[must_use]
    pub fn to_entry(&self) -> PresenceEntry {
        PresenceEntry {
            status: self.status,
            activity: self.activity.clone(),
            observed_at: self.at,
        }
    }
}

/// Activity report exchanged with the pull surface (polling fallback).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityReport {
    /// Whose activity this is.
    pub user_id: UserId,
    /// Status at the time of the report.
    pub status: PresenceStatus,
    /// Activity at the time of the report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<Activity>,
    /// Milliseconds since epoch when the report was recorded.
    pub at: u64,
}

impl From<ActivityReport> for PresenceUpdate {
    fn from(report: ActivityReport) -> Self {
        Self {
            user_id: report.user_id,
            status: report.status,
            activity: report.activity,
            at: report.at,
        }
    }
}

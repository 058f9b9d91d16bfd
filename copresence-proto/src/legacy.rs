//! Wire shape of the legacy activity tracker.
//!
//! Older clients report a free-form activity kind instead of a status. The
//! client translates these frames into presence updates; they are never
//! stored as a separate source of truth.

use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// Legacy `activity:update` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyActivity {
    /// Subject of the report.
    pub user_id: UserId,
    /// Activity kind, e.g. `studying`, `idle`, `away`, `busy`, `offline`.
    pub kind: String,
    /// Optional topic the user is working on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Milliseconds since epoch when the activity was recorded.
    #[serde(default)]
    pub at: u64,
}

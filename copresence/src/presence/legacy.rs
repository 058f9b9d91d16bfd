//! Translation of legacy `activity:update` frames.
//!
//! The legacy tracker is not a source of truth of its own: its frames are
//! converted into ordinary presence updates and flow through the same
//! directory path as `presence:update`.

use copresence_proto::legacy::LegacyActivity;
use copresence_proto::presence::{Activity, PresenceStatus, PresenceUpdate};

/// Convert a legacy activity frame into a presence update.
#[must_use]
pub fn translate(legacy: LegacyActivity) -> PresenceUpdate {
    let status = match legacy.kind.to_ascii_lowercase().as_str() {
        "idle" | "away" => PresenceStatus::Idle,
        "busy" | "dnd" | "do-not-disturb" => PresenceStatus::DoNotDisturb,
        "offline" => PresenceStatus::Offline,
        _ => PresenceStatus::Online,
    };
    let activity = (status == PresenceStatus::Online).then(|| Activity {
        kind: legacy.kind,
        topic: legacy.topic,
    });
    PresenceUpdate {
        user_id: legacy.user_id,
        status,
        activity,
        at: legacy.at,
    }
}

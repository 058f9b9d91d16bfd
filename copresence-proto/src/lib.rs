//! Shared wire contract for the copresence push channel and pull surface.

pub mod codec;
pub mod event;
pub mod ids;
pub mod legacy;
pub mod presence;
pub mod room;

/// Returns the current wall-clock time in milliseconds since the UNIX epoch.
#[must_use]
pub fn now_ms() -> u64 {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    u64::try_from(millis).unwrap_or(u64::MAX)
}

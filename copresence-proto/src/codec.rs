//! Serialization for push-channel frames.
//!
//! Frames are JSON text: one [`ChannelEvent`] per WebSocket text message.

use crate::event::ChannelEvent;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Frame exceeds the configured size limit.
    #[error("frame too large: {size} bytes (max {max} bytes)")]
    Oversized {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },
}

/// Maximum accepted frame size (256 KB). Room snapshots travel over the pull
/// surface, so push frames stay small.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Encodes a [`ChannelEvent`] into a JSON text frame.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the event cannot be serialized.
pub fn encode(event: &ChannelEvent) -> Result<String, CodecError> {
    serde_json::to_string(event).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a [`ChannelEvent`] from a JSON text frame.
///
/// # Errors
///
/// Returns `CodecError::Oversized` if the frame exceeds [`MAX_FRAME_SIZE`],
/// or `CodecError::Serialization` if it is not a known event.
pub fn decode(frame: &str) -> Result<ChannelEvent, CodecError> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(CodecError::Oversized {
            size: frame.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    serde_json::from_str(frame).map_err(|e| CodecError::Serialization(e.to_string()))
}

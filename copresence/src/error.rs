//! Error taxonomy shared by every synchronization layer.
//!
//! Transport and pull-surface failures are converted into a [`SyncError`]
//! at the component boundary so the client actor can apply one propagation
//! policy: retry transport failures, surface and roll back mutation
//! failures, refetch on conflicts, and tear the session down on auth errors.

use crate::room::api::ApiError;
use crate::transport::TransportError;

/// Errors surfaced by the presence and room synchronization layers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// Token absent or rejected. Fatal: the user must re-authenticate.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Transport-level failure. Retryable.
    #[error("network error: {0}")]
    Network(String),

    /// An operation exceeded its deadline. Retryable.
    #[error("operation timed out")]
    Timeout,

    /// The authority refused the request as invalid. Not retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The authority's state moved under us. Resolved by refetching.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The cached room state cannot be trusted until refetched.
    #[error("room state is stale")]
    StaleState,

    /// The push channel is down. Reconciliation is suspended until reconnect.
    #[error("channel closed")]
    ChannelClosed,
}

impl SyncError {
    /// Whether retrying the same operation later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout | Self::ChannelClosed)
    }

    /// Whether the error ends the session.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Whether the error is resolved by refetching rather than rolling back.
    #[must_use]
    pub const fn needs_refetch(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::StaleState)
    }
}

impl From<TransportError> for SyncError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ConnectionClosed => Self::ChannelClosed,
            TransportError::Timeout => Self::Timeout,
            TransportError::Rejected(reason) => Self::Auth(reason),
            other => Self::Network(other.to_string()),
        }
    }
}

impl From<ApiError> for SyncError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Unauthorized(msg) => Self::Auth(msg),
            ApiError::Validation(msg) => Self::Validation(msg),
            ApiError::Conflict(msg) => Self::Conflict(msg),
            ApiError::Timeout => Self::Timeout,
            other => Self::Network(other.to_string()),
        }
    }
}

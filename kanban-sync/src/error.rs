//! Error types for the sync layer.

use kanban_sync_types::EntityId;
use std::time::Duration;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Stream connect, send or receive failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Stream message that does not follow the snapshot/patch protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A patch operation could not be applied to the reconstructed document.
    #[error("patch error at {path}: {reason}")]
    Patch { path: String, reason: String },

    /// Non-2xx response or `success: false` envelope.
    #[error("fetch failed with status {status}: {message}")]
    Fetch { status: u16, message: String },

    /// HTTP 429 from the backend, with the `Retry-After` delay if given.
    #[error("rate limited (retry after {}s)", .retry_after_secs.map_or_else(|| "?".to_string(), |s| s.to_string()))]
    RateLimited { retry_after_secs: Option<u64> },

    /// Missing token, signed out, or 401/403.
    #[error("authentication error: {0}")]
    Auth(String),

    /// A create/update/delete failed after the optimistic write was applied.
    #[error("mutation of {id} failed: {source}")]
    Mutation {
        id: EntityId,
        #[source]
        source: Box<SyncError>,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Entity or key validation error.
    #[error("invalid data: {0}")]
    Types(#[from] kanban_sync_types::Error),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Channel closed.
    #[error("channel closed")]
    ChannelClosed,
}

impl SyncError {
    /// Returns true if this error represents a 429 rate-limit response.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            SyncError::RateLimited { .. } => true,
            SyncError::Fetch { status, .. } => *status == 429,
            SyncError::Http(e) => e.status().is_some_and(|s| s.as_u16() == 429),
            SyncError::Mutation { source, .. } => source.is_rate_limited(),
            _ => false,
        }
    }

    /// Returns the retry-after duration if this is a rate-limit error.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::RateLimited { retry_after_secs } => {
                retry_after_secs.map(Duration::from_secs)
            }
            SyncError::Mutation { source, .. } => source.retry_after(),
            _ => None,
        }
    }

    /// Whether a fetch failing with this error may be retried.
    ///
    /// Rate limits and client errors are final; transport failures,
    /// timeouts and server errors are retried per policy.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::RateLimited { .. } => false,
            SyncError::Fetch { status, .. } => *status >= 500 || *status == 408,
            SyncError::Http(e) => {
                if e.status().is_some_and(|s| s.as_u16() == 429) {
                    false
                } else {
                    e.is_timeout() || e.is_connect() || e.is_request()
                        || e.status().is_some_and(|s| s.is_server_error())
                }
            }
            SyncError::Transport(_) | SyncError::Timeout => true,
            _ => false,
        }
    }
}

//! Error types for the sync engine.

use thiserror::Error;

/// Postgres unique-violation code, surfaced by the backend on duplicate inserts.
pub const UNIQUE_VIOLATION: &str = "23505";

/// Code the backend uses when a one-shot action was already recorded.
pub const ALREADY_RECORDED: &str = "already_recorded";

/// Errors that can occur when talking to the backend.
///
/// Only the gateway boundary produces these; the store and mapper never fail.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport failure or server-side outage. Transient.
    #[error("network error: {0}")]
    Network(String),

    /// The backend rejected the write because of existing state.
    #[error("conflict ({code}): {message}")]
    Conflict { code: String, message: String },

    /// The backend rejected the request parameters.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Rate limited.
    #[error("rate limited{}", match retry_after_secs {
        Some(secs) => format!(" (retry after {}s)", secs),
        None => String::new(),
    })]
    RateLimited {
        /// Seconds to wait before retrying (from Retry-After header, optional).
        retry_after_secs: Option<u64>,
    },

    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Response did not match any known shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(String),
}

impl SyncError {
    /// Whether the backend reported a conflict of any kind.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::Conflict { .. })
    }

    /// Whether the conflict means the target state already exists.
    ///
    /// For toggles this is "already in the desired state"; for one-shot
    /// actions it is "already recorded".
    pub fn is_duplicate(&self) -> bool {
        matches!(
            self,
            SyncError::Conflict { code, .. } if code == UNIQUE_VIOLATION || code == ALREADY_RECORDED
        )
    }

    /// Whether retrying later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::RateLimited { .. })
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            SyncError::InvalidResponse(e.to_string())
        } else {
            SyncError::Network(e.to_string())
        }
    }
}

//! Error taxonomy for the sync engine
//!
//! Store and engine APIs return `anyhow::Result`. Conditions that callers
//! branch on (retry or not, prompt re-authorization, skip one item) are
//! raised as [`SyncError`] and recovered with `downcast_ref`.

use std::time::Duration;

/// Typed sync failures
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The requested sync is not allowed for the user's current state
    #[error("precondition failed for user {user_id}: {reason}")]
    Precondition { user_id: String, reason: String },

    /// Credentials are missing or could not be refreshed
    #[error("authorization failed: {0}")]
    Auth(String),

    /// The remote asked us to slow down
    #[error("rate limited by remote (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Network failure or 5xx from the remote
    #[error("transient remote error: {0}")]
    Transient(String),

    /// The requested remote resource does not exist
    #[error("remote resource not found: {0}")]
    NotFound(String),

    /// The stored history cursor is too old for the remote to replay
    #[error("history cursor expired or invalid")]
    HistoryExpired,

    /// The remote returned a payload we cannot use
    #[error("malformed remote data: {0}")]
    Data(String),
}

impl SyncError {
    pub fn precondition(user_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Precondition {
            user_id: user_id.into(),
            reason: reason.into(),
        }
    }

    /// Whether the job runner should schedule another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transient(_))
    }

    /// Whether this failure concerns a single item and should not abort a batch
    pub fn is_data_error(&self) -> bool {
        matches!(self, Self::Data(_) | Self::NotFound(_))
    }
}

/// Classify an arbitrary error for the retry policy
///
/// Anything that is not a [`SyncError`] (SQLite busy, I/O, serde of our own
/// rows) is treated as transient.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<SyncError>() {
        Some(sync_err) => sync_err.is_retryable(),
        None => true,
    }
}

/// True when the error is a per-item data problem
pub fn is_data_error(err: &anyhow::Error) -> bool {
    err.downcast_ref::<SyncError>()
        .is_some_and(SyncError::is_data_error)
}

/// True when the user needs to re-authorize
pub fn is_auth_error(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<SyncError>(), Some(SyncError::Auth(_)))
}

//! Per-user sync state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of the user who owns a mirrored mailbox
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tracks what kinds of sync have completed for a user
///
/// One row per user. Engines mutate it only after the remote work they
/// represent has been durably applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSyncState {
    pub user_id: UserId,
    /// Position in the remote change log, replayed by incremental sync
    pub history_cursor: Option<String>,
    pub initial_sync_completed: bool,
    pub label_sync_completed: bool,
    pub last_full_sync_at: Option<DateTime<Utc>>,
    pub last_incremental_sync_at: Option<DateTime<Utc>>,
}

impl UserSyncState {
    /// State for a user that has never synced
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            history_cursor: None,
            initial_sync_completed: false,
            label_sync_completed: false,
            last_full_sync_at: None,
            last_incremental_sync_at: None,
        }
    }

    /// Incremental sync needs both completions and a cursor to replay from
    pub fn can_incremental_sync(&self) -> bool {
        self.initial_sync_completed && self.label_sync_completed && self.history_cursor.is_some()
    }

    /// Move the history cursor forward
    ///
    /// Returns false (and leaves the state untouched) when `cursor` would
    /// move it backwards.
    pub fn advance_cursor(&mut self, cursor: &str) -> bool {
        match &self.history_cursor {
            Some(current) if !cursor_advances(current, cursor) => false,
            _ => {
                self.history_cursor = Some(cursor.to_string());
                true
            }
        }
    }

    /// Forget the cursor and require a fresh initial sync
    pub fn reset_for_full_sync(&mut self) {
        self.history_cursor = None;
        self.initial_sync_completed = false;
    }
}

/// Whether moving from `current` to `next` keeps the cursor monotonic
///
/// Remote history ids are decimal integers; opaque cursors that do not parse
/// are accepted whenever they differ.
pub fn cursor_advances(current: &str, next: &str) -> bool {
    match (current.parse::<u128>(), next.parse::<u128>()) {
        (Ok(current), Ok(next)) => next >= current,
        _ => next != current,
    }
}

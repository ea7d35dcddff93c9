//! Storage trait definitions

use std::collections::BTreeSet;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::models::{
    Label, LabelId, Message, MessageDetail, MessageId, MessageStub, SyncKind, SyncProgress,
    SyncStatus, UserId, UserSyncState,
};

/// Which end of the stub backlog a detail batch drains first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailOrder {
    /// First inserted first
    OldestFirst,
    /// Most recently inserted first
    NewestFirst,
}

impl DetailOrder {
    pub fn for_kind(kind: SyncKind) -> Self {
        match kind {
            SyncKind::Incremental => Self::NewestFirst,
            SyncKind::Initial | SyncKind::Labels => Self::OldestFirst,
        }
    }
}

/// Persistence for the mirror and its sync checkpoints
///
/// Every method is scoped to a single user and is atomic on its own, so
/// concurrent workers for the same user never interleave a partial write.
/// Writes are idempotent upserts or set operations; replaying a job is safe.
pub trait MirrorStore: Send + Sync {
    // === User sync state ===

    fn get_user_state(&self, user_id: &UserId) -> Result<Option<UserSyncState>>;

    /// Insert or replace the user's state
    ///
    /// Engines never call this; concurrent runs of different kinds go through
    /// the single-field updates below, which read and write in one step.
    fn save_user_state(&self, state: &UserSyncState) -> Result<()>;

    /// Set `label_sync_completed`, creating the row if needed
    fn mark_label_sync_completed(&self, user_id: &UserId) -> Result<UserSyncState>;

    /// Set `initial_sync_completed` and `last_full_sync_at`
    ///
    /// `cursor` is applied with the same never-backwards rule as
    /// [`MirrorStore::advance_history_cursor`].
    fn complete_initial_sync(
        &self,
        user_id: &UserId,
        cursor: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<UserSyncState>;

    /// Move the history cursor forward and stamp `last_incremental_sync_at`
    ///
    /// A cursor older than the stored one is ignored. Returns the state as
    /// written.
    fn advance_history_cursor(
        &self,
        user_id: &UserId,
        cursor: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<UserSyncState>;

    /// Drop the cursor and the initial completion flag
    fn reset_for_full_sync(&self, user_id: &UserId) -> Result<UserSyncState>;

    // === Sync progress ===

    /// Retire any non-terminal row for (user, kind) and insert `progress`
    ///
    /// Returns the stored row with its assigned id.
    fn begin_progress(&self, progress: SyncProgress) -> Result<SyncProgress>;

    fn get_progress(&self, id: i64) -> Result<Option<SyncProgress>>;

    /// The non-terminal row for (user, kind), if any
    fn active_progress(&self, user_id: &UserId, kind: SyncKind) -> Result<Option<SyncProgress>>;

    /// Most recent row for (user, kind), terminal or not
    fn latest_progress(&self, user_id: &UserId, kind: SyncKind) -> Result<Option<SyncProgress>>;

    /// Persist cursor and counters of a non-terminal row
    ///
    /// Status is not touched; use [`MirrorStore::transition_progress`].
    /// Returns false if the row is already terminal.
    fn save_progress_checkpoint(&self, progress: &SyncProgress) -> Result<bool>;

    /// Atomically add to `num_processed` and `batches_completed`
    fn record_progress_batch(&self, id: i64, processed: u64) -> Result<()>;

    /// Move a row to `to` if it is still non-terminal
    ///
    /// Terminal targets set `completed_at`. Returns false when the row was
    /// already terminal (or missing), leaving it unchanged.
    fn transition_progress(
        &self,
        id: i64,
        to: SyncStatus,
        error_message: Option<&str>,
    ) -> Result<bool>;

    // === Messages ===

    /// Insert stubs that do not exist yet; existing rows keep their detail
    ///
    /// Returns the number of newly inserted rows. All-or-nothing.
    fn upsert_stubs(&self, user_id: &UserId, stubs: &[MessageStub]) -> Result<usize>;

    fn get_message(&self, user_id: &UserId, id: &MessageId) -> Result<Option<Message>>;

    /// Hard-delete messages and their label associations
    fn delete_messages(&self, user_id: &UserId, ids: &[MessageId]) -> Result<usize>;

    /// Add and remove labels on one message's association set
    ///
    /// Returns false when the message is not mirrored.
    fn apply_label_delta(
        &self,
        user_id: &UserId,
        id: &MessageId,
        added: &BTreeSet<LabelId>,
        removed: &BTreeSet<LabelId>,
    ) -> Result<bool>;

    /// Stubs still needing detail, below the failure threshold
    fn list_needing_detail(
        &self,
        user_id: &UserId,
        order: DetailOrder,
        limit: usize,
        max_failures: u32,
    ) -> Result<Vec<MessageStub>>;

    fn count_needing_detail(&self, user_id: &UserId, max_failures: u32) -> Result<usize>;

    /// Write enrichment and replace the label set in one step
    ///
    /// Returns false when the message was deleted in the meantime.
    fn write_detail(&self, user_id: &UserId, id: &MessageId, detail: &MessageDetail)
    -> Result<bool>;

    /// Count a failed enrichment attempt
    fn record_detail_failure(&self, user_id: &UserId, id: &MessageId) -> Result<()>;

    fn count_messages(&self, user_id: &UserId) -> Result<usize>;

    // === Labels ===

    fn upsert_labels(&self, user_id: &UserId, labels: &[Label]) -> Result<()>;

    fn list_labels(&self, user_id: &UserId) -> Result<Vec<Label>>;

    /// Delete labels and any message associations to them
    fn delete_labels(&self, user_id: &UserId, ids: &[LabelId]) -> Result<usize>;
}

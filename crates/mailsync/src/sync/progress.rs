//! Progress tracker: the durable checkpoint of one sync run

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::error::SyncError;
use crate::models::{CURSOR_FINISHED, SyncKind, SyncProgress, SyncStatus, UserId};
use crate::storage::MirrorStore;

/// Owns one progress row on behalf of an engine
///
/// Every mutation is written through to the store before the in-memory copy
/// changes, so the row is the single source of truth after a crash.
pub struct ProgressTracker {
    store: Arc<dyn MirrorStore>,
    progress: SyncProgress,
}

impl ProgressTracker {
    /// Start a new run, retiring any non-terminal row of the same kind
    pub fn begin(store: Arc<dyn MirrorStore>, user_id: &UserId, kind: SyncKind) -> Result<Self> {
        Self::begin_with(store, SyncProgress::new(user_id.clone(), kind))
    }

    /// Start a new run from a prepared row
    pub fn begin_with(store: Arc<dyn MirrorStore>, progress: SyncProgress) -> Result<Self> {
        let progress = store
            .begin_progress(progress)
            .context("Failed to create progress row")?;
        log::info!(
            "[SYNC] {} run {} started for {}",
            progress.kind,
            progress.id,
            progress.user_id
        );
        Ok(Self { store, progress })
    }

    /// Pick up the non-terminal row for (user, kind), if one exists
    pub fn resume(
        store: Arc<dyn MirrorStore>,
        user_id: &UserId,
        kind: SyncKind,
    ) -> Result<Option<Self>> {
        let progress = store.active_progress(user_id, kind)?;
        Ok(progress.map(|progress| Self { store, progress }))
    }

    /// Load a row by id, whatever its status
    pub fn load(store: Arc<dyn MirrorStore>, id: i64) -> Result<Option<Self>> {
        let progress = store.get_progress(id)?;
        Ok(progress.map(|progress| Self { store, progress }))
    }

    pub fn id(&self) -> i64 {
        self.progress.id
    }

    pub fn progress(&self) -> &SyncProgress {
        &self.progress
    }

    /// Persist the next page cursor together with the running total
    ///
    /// Fails with a precondition error when a newer run has retired this one.
    pub fn checkpoint(&mut self, next_page: Option<&str>, num_total: u64) -> Result<()> {
        let mut next = self.progress.clone();
        next.cursor = Some(next_page.unwrap_or(CURSOR_FINISHED).to_string());
        next.num_total = num_total;
        self.save(next)
    }

    /// Record totals once they are known, leaving the cursor alone
    pub fn set_totals(&mut self, num_total: u64, batches_total: u64) -> Result<()> {
        let mut next = self.progress.clone();
        next.num_total = num_total;
        next.batches_total = batches_total;
        self.save(next)
    }

    /// Raise `num_processed` to at least `num_processed`
    pub fn mark_processed(&mut self, num_processed: u64) -> Result<()> {
        let mut next = self.progress.clone();
        next.num_processed = next.num_processed.max(num_processed);
        self.save(next)
    }

    /// Move to `in_progress`
    pub fn start(&mut self) -> Result<()> {
        if self.transition(SyncStatus::InProgress, None)? {
            self.progress.status = SyncStatus::InProgress;
            Ok(())
        } else {
            Err(self.superseded())
        }
    }

    /// Move to `in_progress` after work on the row was handed to another job
    ///
    /// That job may already have completed the row, which counts as started.
    /// Any other terminal status means a newer run took over.
    pub fn start_after_handoff(&mut self) -> Result<()> {
        if self.transition(SyncStatus::InProgress, None)? {
            self.progress.status = SyncStatus::InProgress;
            return Ok(());
        }
        self.refresh()?;
        if self.progress.status == SyncStatus::Completed {
            Ok(())
        } else {
            Err(self.superseded())
        }
    }

    /// Terminal success; false when the row was already terminal
    pub fn complete(&mut self) -> Result<bool> {
        let moved = self.transition(SyncStatus::Completed, None)?;
        if moved {
            log::info!(
                "[SYNC] {} run {} completed for {} ({} processed)",
                self.progress.kind,
                self.progress.id,
                self.progress.user_id,
                self.progress.num_processed
            );
        }
        self.refresh()?;
        Ok(moved)
    }

    /// Terminal failure; false when the row was already terminal
    pub fn fail(&mut self, message: &str) -> Result<bool> {
        let moved = self.transition(SyncStatus::Failed, Some(message))?;
        if moved {
            log::warn!(
                "[SYNC] {} run {} failed for {}: {}",
                self.progress.kind,
                self.progress.id,
                self.progress.user_id,
                message
            );
        }
        self.refresh()?;
        Ok(moved)
    }

    /// Count one finished detail batch
    pub fn record_batch(&mut self, processed: u64) -> Result<()> {
        self.store.record_progress_batch(self.progress.id, processed)?;
        self.refresh()
    }

    /// Re-read the row from the store
    pub fn refresh(&mut self) -> Result<()> {
        if let Some(progress) = self.store.get_progress(self.progress.id)? {
            self.progress = progress;
        }
        Ok(())
    }

    fn save(&mut self, next: SyncProgress) -> Result<()> {
        if !self.store.save_progress_checkpoint(&next)? {
            return Err(self.superseded());
        }
        self.progress = next;
        Ok(())
    }

    fn transition(&self, to: SyncStatus, message: Option<&str>) -> Result<bool> {
        self.store
            .transition_progress(self.progress.id, to, message)
            .with_context(|| format!("Failed to move progress row {} to {}", self.progress.id, to.as_str()))
    }

    fn superseded(&self) -> anyhow::Error {
        SyncError::precondition(
            self.progress.user_id.as_str(),
            format!(
                "{} run {} is no longer active",
                self.progress.kind, self.progress.id
            ),
        )
        .into()
    }
}

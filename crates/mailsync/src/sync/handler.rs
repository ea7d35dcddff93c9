//! Routes queued jobs onto the sync engines

use std::sync::Arc;

use anyhow::Result;

use super::{
    ProgressTracker, SyncContext, run_detail_batch, run_incremental_sync, run_initial_sync,
    run_label_sync,
};
use crate::error::{SyncError, is_auth_error};
use crate::models::SyncKind;
use crate::queue::{Job, JobHandler};

/// [`JobHandler`] backed by a shared [`SyncContext`]
pub struct SyncJobHandler {
    ctx: Arc<SyncContext>,
}

impl SyncJobHandler {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }
}

impl JobHandler for SyncJobHandler {
    fn handle(&self, job: &Job) -> Result<()> {
        let ctx = self.ctx.as_ref();
        match job {
            Job::SyncLabels { user_id } => run_label_sync(ctx, user_id).map(|_| ()),
            Job::SyncInitial { user_id } => run_initial_sync(ctx, user_id).map(|_| ()),
            Job::SyncIncremental { user_id } => run_incremental_sync(ctx, user_id).map(|_| ()),
            Job::DetailBatch(batch) => run_detail_batch(ctx, batch).map(|_| ()),
        }
    }

    /// Fail the run the job belonged to so the coordinator can start over
    ///
    /// A precondition failure means the job never owned a live run (it was
    /// ineligible or superseded), so whatever run is active now is left alone.
    fn on_exhausted(&self, job: &Job, error: &anyhow::Error) -> Result<()> {
        let user_id = job.user_id();
        if is_auth_error(error) {
            log::error!("[SYNC] {} needs to re-authorize: {:#}", user_id, error);
        }
        if matches!(
            error.downcast_ref::<SyncError>(),
            Some(SyncError::Precondition { .. })
        ) {
            log::debug!("[SYNC] Stale {} job for {} dropped: {:#}", job.kind(), user_id, error);
            return Ok(());
        }

        let store = self.ctx.store.clone();
        let tracker = match job {
            Job::DetailBatch(batch) => ProgressTracker::load(store, batch.progress_id)?,
            Job::SyncLabels { .. } => ProgressTracker::resume(store, user_id, SyncKind::Labels)?,
            Job::SyncInitial { .. } => ProgressTracker::resume(store, user_id, SyncKind::Initial)?,
            Job::SyncIncremental { .. } => {
                ProgressTracker::resume(store, user_id, SyncKind::Incremental)?
            }
        };

        match tracker {
            Some(mut tracker) => {
                tracker.fail(&format!("{:#}", error))?;
            }
            None => log::debug!("[SYNC] No open run to fail for {} job", job.kind()),
        }
        Ok(())
    }
}

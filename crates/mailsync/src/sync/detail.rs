//! Message detail engine: enrich stubs in bounded, self-resubmitting batches

use anyhow::Result;
use chrono::Utc;
use rayon::prelude::*;

use super::{ProgressTracker, SyncContext};
use crate::error::is_data_error;
use crate::gmail::normalize_detail;
use crate::models::{MessageDetail, MessageStub, SyncKind, UserId};
use crate::queue::{DetailBatch, Job, JobId};
use crate::storage::DetailOrder;

/// Result of one detail batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailBatchOutcome {
    /// Stubs enriched and written back
    pub processed: usize,
    /// Stubs skipped with a data error (counted against their failure budget)
    pub failed: usize,
    /// Stubs still needing detail after this batch
    pub remaining: usize,
    /// The follow-up batch, when anything remains
    pub resubmitted: Option<JobId>,
}

impl DetailBatchOutcome {
    fn skipped() -> Self {
        Self {
            processed: 0,
            failed: 0,
            remaining: 0,
            resubmitted: None,
        }
    }
}

/// Enrich up to `batch.batch_size` stubs and hand off the rest
///
/// Transient and auth failures on any message abort the batch after the
/// successful fetches are written, so the retry only redoes what is left.
pub fn run_detail_batch(ctx: &SyncContext, batch: &DetailBatch) -> Result<DetailBatchOutcome> {
    let user_id = &batch.user_id;

    let Some(mut tracker) = ProgressTracker::load(ctx.store.clone(), batch.progress_id)? else {
        log::warn!(
            "[SYNC] Detail batch for {} references missing run {}",
            user_id,
            batch.progress_id
        );
        return Ok(DetailBatchOutcome::skipped());
    };
    if !tracker.progress().is_active() {
        log::info!(
            "[SYNC] Dropping detail batch for {}: run {} is {}",
            user_id,
            tracker.id(),
            tracker.progress().status.as_str()
        );
        return Ok(DetailBatchOutcome::skipped());
    }

    let mailbox = ctx.mailboxes.mailbox(user_id)?;
    let max_failures = ctx.config.max_detail_failures;
    let stubs = ctx.store.list_needing_detail(
        user_id,
        DetailOrder::for_kind(batch.sync_kind),
        batch.batch_size.max(1),
        max_failures,
    )?;

    let fetched: Vec<(MessageStub, Result<MessageDetail>)> = stubs
        .into_par_iter()
        .map(|stub| {
            let detail = mailbox
                .get_message(&stub.id)
                .and_then(|remote| Ok(normalize_detail(remote, &stub.thread_id)?));
            (stub, detail)
        })
        .collect();

    let mut processed = 0;
    let mut failed = 0;
    let mut first_error = None;
    for (stub, detail) in fetched {
        match detail {
            Ok(detail) => {
                if ctx.store.write_detail(user_id, &stub.id, &detail)? {
                    processed += 1;
                }
            }
            Err(e) if is_data_error(&e) => {
                log::warn!(
                    "[SYNC] Skipping message {} for {}: {:#}",
                    stub.id.as_str(),
                    user_id,
                    e
                );
                ctx.store.record_detail_failure(user_id, &stub.id)?;
                failed += 1;
            }
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    if let Some(e) = first_error {
        log::error!(
            "[SYNC] Detail batch for {} aborted after {} writes: {:#}",
            user_id,
            processed,
            e
        );
        return Err(e);
    }

    tracker.record_batch(processed as u64)?;

    let remaining = ctx.store.count_needing_detail(user_id, max_failures)?;
    let resubmitted = if remaining > 0 {
        Some(ctx.dispatcher.dispatch(Job::DetailBatch(batch.clone()))?)
    } else {
        if tracker.complete()? && batch.sync_kind == SyncKind::Initial {
            finish_initial_sync(ctx, user_id, tracker.progress().history_cursor.as_deref())?;
        }
        None
    };

    log::info!(
        "[SYNC] Detail batch for {}: {} enriched, {} failed, {} remaining",
        user_id,
        processed,
        failed,
        remaining
    );

    Ok(DetailBatchOutcome {
        processed,
        failed,
        remaining,
        resubmitted,
    })
}

/// Mark the initial sync done and adopt the cursor captured when it began
fn finish_initial_sync(ctx: &SyncContext, user_id: &UserId, cursor: Option<&str>) -> Result<()> {
    if cursor.is_none() {
        log::warn!("[SYNC] Initial run for {} captured no history cursor", user_id);
    }

    let state = ctx.store.complete_initial_sync(user_id, cursor, Utc::now())?;
    log::info!(
        "[SYNC] Initial sync complete for {} at cursor {:?}",
        user_id,
        state.history_cursor
    );
    Ok(())
}

//! Initial sync: page through the whole mailbox recording message stubs
//!
//! Runs `start → paging → batching → done`. The page cursor is checkpointed
//! after each page's stubs are written, so a redelivered job resumes from the
//! last durable page. Enrichment and completion belong to the detail engine.

use anyhow::Result;

use super::{ProgressTracker, SyncContext, batches_for};
use crate::models::{MessageStub, SyncKind, SyncProgress, SyncStatus, UserId};
use crate::queue::{DetailBatch, Job, JobId};

/// Result of one initial sync job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialSyncOutcome {
    pub progress_id: i64,
    /// Pages fetched by this job (0 when resuming after paging ended)
    pub pages: usize,
    /// Message identities recorded across the run
    pub num_total: u64,
    /// Detail batch enqueued by this job, if any
    pub detail_job: Option<JobId>,
}

/// Run (or resume) the initial sync for `user_id`
pub fn run_initial_sync(ctx: &SyncContext, user_id: &UserId) -> Result<InitialSyncOutcome> {
    let result = run(ctx, user_id);
    if let Err(e) = &result {
        log::error!("[SYNC] Initial sync for {} failed: {:#}", user_id, e);
    }
    result
}

fn run(ctx: &SyncContext, user_id: &UserId) -> Result<InitialSyncOutcome> {
    let mailbox = ctx.mailboxes.mailbox(user_id)?;

    // 1. Start: resume a pending run or begin a new one
    let existing = ProgressTracker::resume(ctx.store.clone(), user_id, SyncKind::Initial)?;
    let mut tracker = match existing {
        Some(tracker) if tracker.progress().status == SyncStatus::InProgress => {
            // Paging already handed off to the detail engine
            log::info!(
                "[SYNC] Initial run {} for {} is already batching",
                tracker.id(),
                user_id
            );
            return Ok(InitialSyncOutcome {
                progress_id: tracker.id(),
                pages: 0,
                num_total: tracker.progress().num_total,
                detail_job: None,
            });
        }
        Some(tracker) => {
            log::info!(
                "[SYNC] Resuming initial run {} for {} at cursor {:?}",
                tracker.id(),
                user_id,
                tracker.progress().cursor
            );
            tracker
        }
        None => {
            // The cursor to replay from once this snapshot is complete
            let profile = mailbox.get_profile()?;
            let mut progress = SyncProgress::new(user_id.clone(), SyncKind::Initial);
            progress.history_cursor = Some(profile.history_id).filter(|id| !id.is_empty());
            ProgressTracker::begin_with(ctx.store.clone(), progress)?
        }
    };

    // 2. Paging
    let mut pages = 0;
    let mut num_total = tracker.progress().num_total;
    while !tracker.progress().paging_finished() {
        let page_token = tracker.progress().cursor.clone();
        let page = mailbox.list_messages(page_token.as_deref(), ctx.config.page_size)?;
        pages += 1;

        let mut stubs = Vec::new();
        for message in page.messages.unwrap_or_default() {
            if message.id.is_empty() {
                log::warn!("[SYNC] Skipping message without id on initial page for {}", user_id);
                continue;
            }
            stubs.push(MessageStub::new(message.id, message.thread_id));
        }

        let inserted = ctx.store.upsert_stubs(user_id, &stubs)?;
        num_total += stubs.len() as u64;
        tracker.checkpoint(page.next_page_token.as_deref(), num_total)?;

        log::debug!(
            "[SYNC] Initial page {} for {}: {} stubs ({} new)",
            pages,
            user_id,
            stubs.len(),
            inserted
        );
    }

    // 3. Batching: hand the stubs to the detail engine. Totals go first;
    //    once dispatched, the batch may finish the row before we return.
    let batch_size = ctx.config.detail_batch_size;
    tracker.set_totals(num_total, batches_for(num_total, batch_size))?;

    let detail_job = ctx.dispatcher.dispatch(Job::DetailBatch(DetailBatch {
        user_id: user_id.clone(),
        batch_size,
        sync_kind: SyncKind::Initial,
        progress_id: tracker.id(),
    }))?;
    tracker.start_after_handoff()?;

    log::info!(
        "[SYNC] Initial paging for {} done: {} messages in {} pages, detail job {}",
        user_id,
        num_total,
        pages,
        detail_job
    );

    Ok(InitialSyncOutcome {
        progress_id: tracker.id(),
        pages,
        num_total,
        detail_job: Some(detail_job),
    })
}

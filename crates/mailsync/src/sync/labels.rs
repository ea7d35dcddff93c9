//! Label sync: replace the local label set with the remote one

use std::collections::HashSet;

use anyhow::Result;

use super::{ProgressTracker, SyncContext};
use crate::gmail::normalize_label;
use crate::models::{Label, LabelId, SyncKind, UserId};

/// Result of one label sync job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSyncOutcome {
    pub progress_id: i64,
    /// Labels received and upserted
    pub fetched: usize,
    /// Local labels deleted because the remote no longer has them
    pub removed: usize,
}

/// Fetch the full label set and reconcile the mirror with it
///
/// `label_sync_completed` is only set after both the upsert and the
/// removal of stale labels succeeded.
pub fn run_label_sync(ctx: &SyncContext, user_id: &UserId) -> Result<LabelSyncOutcome> {
    let mailbox = ctx.mailboxes.mailbox(user_id)?;
    let mut tracker = ProgressTracker::begin(ctx.store.clone(), user_id, SyncKind::Labels)?;
    tracker.start()?;

    let remote = match mailbox.list_labels() {
        Ok(remote) => remote,
        Err(e) => {
            log::error!("[SYNC] Listing labels for {} failed: {:#}", user_id, e);
            return Err(e);
        }
    };

    let labels: Vec<Label> = remote.into_iter().filter_map(normalize_label).collect();
    let fetched = labels.len();
    ctx.store.upsert_labels(user_id, &labels)?;

    let remote_ids: HashSet<&LabelId> = labels.iter().map(|l| &l.id).collect();
    let stale: Vec<LabelId> = ctx
        .store
        .list_labels(user_id)?
        .into_iter()
        .map(|l| l.id)
        .filter(|id| !remote_ids.contains(id))
        .collect();
    let removed = if stale.is_empty() {
        0
    } else {
        ctx.store.delete_labels(user_id, &stale)?
    };

    ctx.store.mark_label_sync_completed(user_id)?;

    tracker.set_totals(fetched as u64, 1)?;
    tracker.record_batch(fetched as u64)?;
    tracker.complete()?;

    log::info!(
        "[SYNC] Labels for {}: {} synced, {} removed",
        user_id,
        fetched,
        removed
    );

    Ok(LabelSyncOutcome {
        progress_id: tracker.id(),
        fetched,
        removed,
    })
}

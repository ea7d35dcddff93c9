//! Incremental sync: replay the remote change log since the stored cursor
//!
//! History records are classified into four buckets (added, deleted, labels
//! added, labels removed) and applied in that order. Every step is idempotent
//! and the cursor moves last, so a crash anywhere before that point is
//! repaired by replaying the same window. Long backlogs are split into
//! windows of `max_history_pages` pages, one job each.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use anyhow::Result;
use chrono::Utc;

use super::{ProgressTracker, SyncContext, batches_for};
use crate::error::SyncError;
use crate::gmail::RemoteMailbox;
use crate::gmail::api::{HistoryLabelChange, HistoryRecord};
use crate::models::{LabelId, MessageId, MessageStub, SyncKind, UserId};
use crate::queue::{DetailBatch, Job, JobId};

/// Net label change for one message within a history window
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelDelta {
    pub added: BTreeSet<LabelId>,
    pub removed: BTreeSet<LabelId>,
}

impl LabelDelta {
    /// A later add cancels an earlier remove of the same label
    pub fn add(&mut self, label: LabelId) {
        self.removed.remove(&label);
        self.added.insert(label);
    }

    /// A later remove cancels an earlier add of the same label
    pub fn remove(&mut self, label: LabelId) {
        self.added.remove(&label);
        self.removed.insert(label);
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// History records sorted into the four change kinds
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryBuckets {
    /// Added messages, first occurrence order, deduplicated
    pub added: Vec<MessageStub>,
    pub deleted: Vec<MessageId>,
    /// Label changes merged per message
    pub label_deltas: BTreeMap<MessageId, LabelDelta>,
}

impl HistoryBuckets {
    /// Classify every record; a record may carry any mix of change kinds
    pub fn classify(records: &[HistoryRecord]) -> Self {
        let mut buckets = Self::default();
        let mut seen_added = HashSet::new();
        let mut seen_deleted = HashSet::new();

        for record in records {
            if let Some(added) = &record.messages_added {
                for entry in added {
                    let message = &entry.message;
                    if message.id.is_empty() {
                        log::warn!("[SYNC] History record {} adds a message without id", record.id);
                        continue;
                    }
                    if seen_added.insert(message.id.clone()) {
                        buckets
                            .added
                            .push(MessageStub::new(message.id.as_str(), message.thread_id.as_str()));
                    }
                }
            }

            if let Some(deleted) = &record.messages_deleted {
                for entry in deleted {
                    let id = &entry.message.id;
                    if !id.is_empty() && seen_deleted.insert(id.clone()) {
                        buckets.deleted.push(MessageId::new(id.as_str()));
                    }
                }
            }

            if let Some(changes) = &record.labels_added {
                buckets.merge_labels(changes, LabelDelta::add);
            }

            if let Some(changes) = &record.labels_removed {
                buckets.merge_labels(changes, LabelDelta::remove);
            }
        }

        buckets.label_deltas.retain(|_, delta| !delta.is_empty());
        buckets
    }

    fn merge_labels(&mut self, changes: &[HistoryLabelChange], apply: fn(&mut LabelDelta, LabelId)) {
        for change in changes {
            if change.message.id.is_empty() {
                continue;
            }
            let delta = self
                .label_deltas
                .entry(MessageId::new(change.message.id.as_str()))
                .or_default();
            for label in &change.label_ids {
                apply(delta, LabelId::new(label.as_str()));
            }
        }
    }

    /// Added + deleted + distinct messages with label deltas
    pub fn total_changes(&self) -> u64 {
        (self.added.len() + self.deleted.len() + self.label_deltas.len()) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.total_changes() == 0
    }
}

/// Up to `max_history_pages` pages of history since a cursor
#[derive(Debug, Clone, Default)]
pub struct HistoryWindow {
    pub records: Vec<HistoryRecord>,
    /// Latest history id reported by the remote
    pub history_id: Option<String>,
    /// The remote had more pages past this window
    pub truncated: bool,
}

impl HistoryWindow {
    /// Page through history from `cursor`, stopping after `max_pages`
    pub fn fetch(mailbox: &dyn RemoteMailbox, cursor: &str, max_pages: usize) -> Result<Self> {
        let mut window = Self::default();
        let mut page_token: Option<String> = None;
        let mut pages = 0;

        loop {
            let page = mailbox.list_history(cursor, page_token.as_deref())?;
            pages += 1;

            if let Some(records) = page.history {
                window.records.extend(records);
            }
            if page.history_id.is_some() {
                window.history_id = page.history_id;
            }

            match page.next_page_token {
                Some(_) if pages >= max_pages => {
                    window.truncated = true;
                    return Ok(window);
                }
                Some(token) => page_token = Some(token),
                None => return Ok(window),
            }
        }
    }

    /// Cursor to store once the window is applied
    ///
    /// A truncated window resumes after its last record; a complete one
    /// jumps to the remote's current history id.
    pub fn next_cursor(&self) -> Option<&str> {
        if self.truncated {
            self.records
                .last()
                .map(|r| r.id.as_str())
                .filter(|id| !id.is_empty())
        } else {
            self.history_id.as_deref()
        }
    }
}

/// Result of one incremental sync job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementalSyncOutcome {
    pub progress_id: i64,
    pub added: usize,
    pub deleted: usize,
    /// Messages whose label deltas were applied (missing ones are skipped)
    pub relabeled: usize,
    pub total_changes: u64,
    /// Cursor stored after this run
    pub history_cursor: Option<String>,
    pub detail_job: Option<JobId>,
    /// Follow-up incremental job for history past this window
    pub continuation: Option<JobId>,
}

/// Apply remote changes since the stored history cursor
///
/// At most `max_history_pages` pages are applied per job. When the remote
/// has more, the cursor moves to the last applied record and another
/// incremental job picks up from there; detail work waits for the last
/// window.
///
/// Fails with [`SyncError::Precondition`] unless the user is eligible, and
/// with [`SyncError::HistoryExpired`] after resetting the user to a full
/// sync when the remote can no longer replay from the cursor.
pub fn run_incremental_sync(ctx: &SyncContext, user_id: &UserId) -> Result<IncrementalSyncOutcome> {
    let state = ctx.store.get_user_state(user_id)?;
    let cursor = match &state {
        Some(state) if state.can_incremental_sync() => state.history_cursor.clone(),
        _ => None,
    };
    let Some(cursor) = cursor else {
        return Err(SyncError::precondition(
            user_id.as_str(),
            "incremental sync requires completed initial and label syncs and a history cursor",
        )
        .into());
    };

    let mailbox = ctx.mailboxes.mailbox(user_id)?;
    let mut tracker = ProgressTracker::begin(ctx.store.clone(), user_id, SyncKind::Incremental)?;
    tracker.start()?;

    // 1. Fetch a bounded window of history
    let window = match HistoryWindow::fetch(mailbox.as_ref(), &cursor, ctx.config.max_history_pages)
    {
        Ok(window) => window,
        Err(e) => {
            if matches!(e.downcast_ref::<SyncError>(), Some(SyncError::HistoryExpired)) {
                log::warn!(
                    "[SYNC] History cursor {} for {} expired, falling back to full sync",
                    cursor,
                    user_id
                );
                ctx.store.reset_for_full_sync(user_id)?;
                tracker.fail(&format!("{:#}", e))?;
            } else {
                log::error!("[SYNC] Listing history for {} failed: {:#}", user_id, e);
            }
            return Err(e);
        }
    };

    // 2. Classify
    let buckets = HistoryBuckets::classify(&window.records);
    let total_changes = buckets.total_changes();
    log::info!(
        "[SYNC] History for {} since {}: {} added, {} deleted, {} relabeled{}",
        user_id,
        cursor,
        buckets.added.len(),
        buckets.deleted.len(),
        buckets.label_deltas.len(),
        if window.truncated { " (more pending)" } else { "" }
    );

    // 3. Apply: (a) stubs, (b) deletions, (c) label deltas
    ctx.store.upsert_stubs(user_id, &buckets.added)?;
    ctx.store.delete_messages(user_id, &buckets.deleted)?;

    let mut relabeled = 0;
    for (id, delta) in &buckets.label_deltas {
        if ctx
            .store
            .apply_label_delta(user_id, id, &delta.added, &delta.removed)?
        {
            relabeled += 1;
        } else {
            log::debug!(
                "[SYNC] Skipping label delta for unmirrored message {}",
                id.as_str()
            );
        }
    }

    // 4. Enrich whatever still lacks detail, or finish now. Stubs left by
    //    earlier windows or superseded runs are picked up here as well.
    let batch_size = ctx.config.detail_batch_size;
    let added = buckets.added.len() as u64;
    let needing_detail = if window.truncated {
        0
    } else {
        ctx.store
            .count_needing_detail(user_id, ctx.config.max_detail_failures)? as u64
    };
    tracker.set_totals(total_changes, batches_for(needing_detail, batch_size))?;

    let detail_job = if needing_detail > 0 {
        // Added messages count once their detail batch lands
        tracker.mark_processed(total_changes.saturating_sub(added))?;
        Some(ctx.dispatcher.dispatch(Job::DetailBatch(DetailBatch {
            user_id: user_id.clone(),
            batch_size,
            sync_kind: SyncKind::Incremental,
            progress_id: tracker.id(),
        }))?)
    } else {
        tracker.mark_processed(total_changes)?;
        tracker.complete()?;
        None
    };

    // 5. Advance the cursor last
    let next_cursor = window.next_cursor();
    if next_cursor.is_none() {
        log::debug!("[SYNC] History window for {} had no cursor", user_id);
    }
    let stored = ctx
        .store
        .advance_history_cursor(user_id, next_cursor, Utc::now())?;
    if let Some(next) = next_cursor
        && stored.history_cursor.as_deref() != Some(next)
    {
        log::warn!(
            "[SYNC] Ignored history cursor {} for {}: behind stored {:?}",
            next,
            user_id,
            stored.history_cursor
        );
    }

    // 6. Hand the rest of the log to a fresh job
    let continuation = if window.truncated && next_cursor.is_some() {
        Some(ctx.dispatcher.dispatch(Job::sync(SyncKind::Incremental, user_id.clone()))?)
    } else {
        None
    };

    Ok(IncrementalSyncOutcome {
        progress_id: tracker.id(),
        added: buckets.added.len(),
        deleted: buckets.deleted.len(),
        relabeled,
        total_changes,
        history_cursor: stored.history_cursor,
        detail_job,
        continuation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gmail::api::{HistoryMessage, MessageRef};

    fn label_change(id: &str, labels: &[&str]) -> HistoryLabelChange {
        HistoryLabelChange {
            message: MessageRef::new(id, "t1"),
            label_ids: labels.iter().map(|l| l.to_string()).collect(),
        }
    }

    fn added(ids: &[&str]) -> Option<Vec<HistoryMessage>> {
        Some(
            ids.iter()
                .map(|id| HistoryMessage {
                    message: MessageRef::new(*id, "t1"),
                })
                .collect(),
        )
    }

    fn labels(ids: &[&str]) -> BTreeSet<LabelId> {
        ids.iter().map(|id| LabelId::new(*id)).collect()
    }

    #[test]
    fn test_classify_mixed_record() {
        // One record carrying every change kind must fill every bucket
        let records = vec![HistoryRecord {
            id: "1".to_string(),
            messages_added: added(&["m1"]),
            messages_deleted: added(&["m2"]),
            labels_added: Some(vec![label_change("m3", &["STARRED"])]),
            labels_removed: Some(vec![label_change("m4", &["UNREAD"])]),
        }];

        let buckets = HistoryBuckets::classify(&records);
        assert_eq!(buckets.added.len(), 1);
        assert_eq!(buckets.deleted, vec![MessageId::new("m2")]);
        assert_eq!(buckets.label_deltas.len(), 2);
        assert_eq!(buckets.total_changes(), 4);
    }

    #[test]
    fn test_label_changes_merge_per_message() {
        let records = vec![
            HistoryRecord {
                id: "1".to_string(),
                labels_added: Some(vec![label_change("m1", &["C"])]),
                ..HistoryRecord::default()
            },
            HistoryRecord {
                id: "2".to_string(),
                labels_removed: Some(vec![label_change("m1", &["B"])]),
                ..HistoryRecord::default()
            },
        ];

        let buckets = HistoryBuckets::classify(&records);
        let delta = &buckets.label_deltas[&MessageId::new("m1")];
        assert_eq!(delta.added, labels(&["C"]));
        assert_eq!(delta.removed, labels(&["B"]));
        assert_eq!(buckets.total_changes(), 1);
    }

    #[test]
    fn test_later_change_wins_for_same_label() {
        let records = vec![
            HistoryRecord {
                id: "1".to_string(),
                labels_added: Some(vec![label_change("m1", &["UNREAD"])]),
                ..HistoryRecord::default()
            },
            HistoryRecord {
                id: "2".to_string(),
                labels_removed: Some(vec![label_change("m1", &["UNREAD"])]),
                ..HistoryRecord::default()
            },
        ];

        let delta = &HistoryBuckets::classify(&records).label_deltas[&MessageId::new("m1")];
        assert!(delta.added.is_empty());
        assert_eq!(delta.removed, labels(&["UNREAD"]));
    }

    #[test]
    fn test_duplicates_and_empty_ids_are_dropped() {
        let records = vec![
            HistoryRecord {
                id: "1".to_string(),
                messages_added: added(&["m1", "", "m1"]),
                ..HistoryRecord::default()
            },
            HistoryRecord {
                id: "2".to_string(),
                messages_added: added(&["m1"]),
                labels_added: Some(vec![label_change("", &["A"]), label_change("m2", &[])]),
                ..HistoryRecord::default()
            },
        ];

        let buckets = HistoryBuckets::classify(&records);
        assert_eq!(buckets.added.len(), 1);
        // A change with no labels leaves no delta behind
        assert!(buckets.label_deltas.is_empty());
    }

    #[test]
    fn test_window_cursor() {
        let records = vec![
            HistoryRecord {
                id: "210".to_string(),
                ..HistoryRecord::default()
            },
            HistoryRecord {
                id: "230".to_string(),
                ..HistoryRecord::default()
            },
        ];
        let mut window = HistoryWindow {
            records,
            history_id: Some("900".to_string()),
            truncated: false,
        };
        assert_eq!(window.next_cursor(), Some("900"));

        // A cut-off window must not skip the pages it never saw
        window.truncated = true;
        assert_eq!(window.next_cursor(), Some("230"));

        window.records.clear();
        assert_eq!(window.next_cursor(), None);
    }

    #[test]
    fn test_empty_history() {
        let buckets = HistoryBuckets::classify(&[]);
        assert!(buckets.is_empty());
    }
}

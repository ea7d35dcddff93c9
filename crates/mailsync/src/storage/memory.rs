//! In-memory storage implementation
//!
//! Used by tests and by embedders that do not need durability. Each table
//! sits behind its own RwLock; every trait method takes the locks it needs
//! for its whole duration, which keeps the per-call atomicity contract.

use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use super::{DetailOrder, MirrorStore};
use crate::models::{
    Label, LabelId, Message, MessageDetail, MessageId, MessageStub, SyncKind, SyncProgress,
    SyncStatus, UserId, UserSyncState,
};

/// Message plus its insertion sequence, which orders detail batches
struct StoredMessage {
    seq: u64,
    message: Message,
}

#[derive(Default)]
struct MessageTable {
    rows: HashMap<UserId, HashMap<MessageId, StoredMessage>>,
    next_seq: u64,
}

#[derive(Default)]
struct ProgressTable {
    rows: BTreeMap<i64, SyncProgress>,
    next_id: i64,
}

/// In-memory implementation of MirrorStore
pub struct InMemoryMirrorStore {
    user_states: RwLock<HashMap<UserId, UserSyncState>>,
    progress: RwLock<ProgressTable>,
    messages: RwLock<MessageTable>,
    labels: RwLock<HashMap<UserId, BTreeMap<LabelId, Label>>>,
}

impl InMemoryMirrorStore {
    pub fn new() -> Self {
        Self {
            user_states: RwLock::new(HashMap::new()),
            progress: RwLock::new(ProgressTable::default()),
            messages: RwLock::new(MessageTable::default()),
            labels: RwLock::new(HashMap::new()),
        }
    }

    /// All progress rows for a user and kind, oldest first
    pub fn progress_rows(&self, user_id: &UserId, kind: SyncKind) -> Vec<SyncProgress> {
        let table = self.progress.read().unwrap();
        table
            .rows
            .values()
            .filter(|p| &p.user_id == user_id && p.kind == kind)
            .cloned()
            .collect()
    }

    /// Apply `update` to the user's state under one write lock
    fn update_user_state(
        &self,
        user_id: &UserId,
        update: impl FnOnce(&mut UserSyncState),
    ) -> UserSyncState {
        let mut states = self.user_states.write().unwrap();
        let state = states
            .entry(user_id.clone())
            .or_insert_with(|| UserSyncState::new(user_id.clone()));
        update(state);
        state.clone()
    }
}

impl Default for InMemoryMirrorStore {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted_labels(labels: impl IntoIterator<Item = LabelId>) -> Vec<LabelId> {
    labels
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

impl MirrorStore for InMemoryMirrorStore {
    fn get_user_state(&self, user_id: &UserId) -> Result<Option<UserSyncState>> {
        let states = self.user_states.read().unwrap();
        Ok(states.get(user_id).cloned())
    }

    fn save_user_state(&self, state: &UserSyncState) -> Result<()> {
        let mut states = self.user_states.write().unwrap();
        states.insert(state.user_id.clone(), state.clone());
        Ok(())
    }

    fn mark_label_sync_completed(&self, user_id: &UserId) -> Result<UserSyncState> {
        Ok(self.update_user_state(user_id, |state| state.label_sync_completed = true))
    }

    fn complete_initial_sync(
        &self,
        user_id: &UserId,
        cursor: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<UserSyncState> {
        Ok(self.update_user_state(user_id, |state| {
            state.initial_sync_completed = true;
            state.last_full_sync_at = Some(at);
            if let Some(cursor) = cursor {
                state.advance_cursor(cursor);
            }
        }))
    }

    fn advance_history_cursor(
        &self,
        user_id: &UserId,
        cursor: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<UserSyncState> {
        Ok(self.update_user_state(user_id, |state| {
            if let Some(cursor) = cursor {
                state.advance_cursor(cursor);
            }
            state.last_incremental_sync_at = Some(at);
        }))
    }

    fn reset_for_full_sync(&self, user_id: &UserId) -> Result<UserSyncState> {
        Ok(self.update_user_state(user_id, UserSyncState::reset_for_full_sync))
    }

    fn begin_progress(&self, mut progress: SyncProgress) -> Result<SyncProgress> {
        let mut table = self.progress.write().unwrap();
        let now = Utc::now();

        for row in table.rows.values_mut() {
            if row.user_id == progress.user_id && row.kind == progress.kind && row.is_active() {
                row.status = SyncStatus::Failed;
                row.error_message = Some(super::SUPERSEDED_MESSAGE.to_string());
                row.completed_at = Some(now);
            }
        }

        table.next_id += 1;
        progress.id = table.next_id;
        table.rows.insert(progress.id, progress.clone());
        Ok(progress)
    }

    fn get_progress(&self, id: i64) -> Result<Option<SyncProgress>> {
        let table = self.progress.read().unwrap();
        Ok(table.rows.get(&id).cloned())
    }

    fn active_progress(&self, user_id: &UserId, kind: SyncKind) -> Result<Option<SyncProgress>> {
        let table = self.progress.read().unwrap();
        Ok(table
            .rows
            .values()
            .rev()
            .find(|p| &p.user_id == user_id && p.kind == kind && p.is_active())
            .cloned())
    }

    fn latest_progress(&self, user_id: &UserId, kind: SyncKind) -> Result<Option<SyncProgress>> {
        let table = self.progress.read().unwrap();
        Ok(table
            .rows
            .values()
            .rev()
            .find(|p| &p.user_id == user_id && p.kind == kind)
            .cloned())
    }

    fn save_progress_checkpoint(&self, progress: &SyncProgress) -> Result<bool> {
        let mut table = self.progress.write().unwrap();
        let Some(row) = table.rows.get_mut(&progress.id) else {
            return Ok(false);
        };
        if !row.is_active() {
            return Ok(false);
        }

        row.cursor = progress.cursor.clone();
        row.history_cursor = progress.history_cursor.clone();
        row.num_processed = row.num_processed.max(progress.num_processed);
        row.num_total = progress.num_total;
        row.batches_total = progress.batches_total;
        row.batches_completed = row.batches_completed.max(progress.batches_completed);
        Ok(true)
    }

    fn record_progress_batch(&self, id: i64, processed: u64) -> Result<()> {
        let mut table = self.progress.write().unwrap();
        if let Some(row) = table.rows.get_mut(&id) {
            row.record_processed(processed);
            row.batches_completed += 1;
        }
        Ok(())
    }

    fn transition_progress(
        &self,
        id: i64,
        to: SyncStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let mut table = self.progress.write().unwrap();
        let Some(row) = table.rows.get_mut(&id) else {
            return Ok(false);
        };

        let moved = match to {
            SyncStatus::Pending => false,
            SyncStatus::InProgress => row.start().is_ok(),
            SyncStatus::Completed => row.complete().is_ok(),
            SyncStatus::Failed => row.fail(error_message.unwrap_or_default()).is_ok(),
        };
        Ok(moved)
    }

    fn upsert_stubs(&self, user_id: &UserId, stubs: &[MessageStub]) -> Result<usize> {
        let mut table = self.messages.write().unwrap();
        let MessageTable { rows, next_seq } = &mut *table;
        let user_rows = rows.entry(user_id.clone()).or_default();

        let mut inserted = 0;
        for stub in stubs {
            if user_rows.contains_key(&stub.id) {
                continue;
            }
            *next_seq += 1;
            user_rows.insert(
                stub.id.clone(),
                StoredMessage {
                    seq: *next_seq,
                    message: Message::stub(user_id.clone(), stub.clone()),
                },
            );
            inserted += 1;
        }
        Ok(inserted)
    }

    fn get_message(&self, user_id: &UserId, id: &MessageId) -> Result<Option<Message>> {
        let table = self.messages.read().unwrap();
        Ok(table
            .rows
            .get(user_id)
            .and_then(|rows| rows.get(id))
            .map(|stored| stored.message.clone()))
    }

    fn delete_messages(&self, user_id: &UserId, ids: &[MessageId]) -> Result<usize> {
        let mut table = self.messages.write().unwrap();
        let Some(user_rows) = table.rows.get_mut(user_id) else {
            return Ok(0);
        };
        Ok(ids.iter().filter(|id| user_rows.remove(*id).is_some()).count())
    }

    fn apply_label_delta(
        &self,
        user_id: &UserId,
        id: &MessageId,
        added: &BTreeSet<LabelId>,
        removed: &BTreeSet<LabelId>,
    ) -> Result<bool> {
        let mut table = self.messages.write().unwrap();
        let Some(stored) = table.rows.get_mut(user_id).and_then(|rows| rows.get_mut(id)) else {
            return Ok(false);
        };

        let mut labels: BTreeSet<LabelId> = stored.message.label_ids.drain(..).collect();
        labels.extend(added.iter().cloned());
        labels.retain(|l| !removed.contains(l));
        stored.message.label_ids = labels.into_iter().collect();
        Ok(true)
    }

    fn list_needing_detail(
        &self,
        user_id: &UserId,
        order: DetailOrder,
        limit: usize,
        max_failures: u32,
    ) -> Result<Vec<MessageStub>> {
        let table = self.messages.read().unwrap();
        let Some(user_rows) = table.rows.get(user_id) else {
            return Ok(Vec::new());
        };

        let mut candidates: Vec<&StoredMessage> = user_rows
            .values()
            .filter(|s| s.message.needs_detail() && s.message.detail_failures < max_failures)
            .collect();

        match order {
            DetailOrder::OldestFirst => candidates.sort_by_key(|s| s.seq),
            DetailOrder::NewestFirst => candidates.sort_by_key(|s| std::cmp::Reverse(s.seq)),
        }

        Ok(candidates
            .into_iter()
            .take(limit)
            .map(|s| MessageStub {
                id: s.message.id.clone(),
                thread_id: s.message.thread_id.clone(),
            })
            .collect())
    }

    fn count_needing_detail(&self, user_id: &UserId, max_failures: u32) -> Result<usize> {
        let table = self.messages.read().unwrap();
        Ok(table
            .rows
            .get(user_id)
            .map(|rows| {
                rows.values()
                    .filter(|s| {
                        s.message.needs_detail() && s.message.detail_failures < max_failures
                    })
                    .count()
            })
            .unwrap_or(0))
    }

    fn write_detail(
        &self,
        user_id: &UserId,
        id: &MessageId,
        detail: &MessageDetail,
    ) -> Result<bool> {
        let mut table = self.messages.write().unwrap();
        let Some(stored) = table.rows.get_mut(user_id).and_then(|rows| rows.get_mut(id)) else {
            return Ok(false);
        };

        let mut detail = detail.clone();
        detail.label_ids = sorted_labels(detail.label_ids);
        stored.message.apply_detail(detail);
        Ok(true)
    }

    fn record_detail_failure(&self, user_id: &UserId, id: &MessageId) -> Result<()> {
        let mut table = self.messages.write().unwrap();
        if let Some(stored) = table.rows.get_mut(user_id).and_then(|rows| rows.get_mut(id)) {
            stored.message.detail_failures += 1;
        }
        Ok(())
    }

    fn count_messages(&self, user_id: &UserId) -> Result<usize> {
        let table = self.messages.read().unwrap();
        Ok(table.rows.get(user_id).map(|rows| rows.len()).unwrap_or(0))
    }

    fn upsert_labels(&self, user_id: &UserId, labels: &[Label]) -> Result<()> {
        let mut all = self.labels.write().unwrap();
        let user_labels = all.entry(user_id.clone()).or_default();
        for label in labels {
            user_labels.insert(label.id.clone(), label.clone());
        }
        Ok(())
    }

    fn list_labels(&self, user_id: &UserId) -> Result<Vec<Label>> {
        let all = self.labels.read().unwrap();
        Ok(all
            .get(user_id)
            .map(|labels| labels.values().cloned().collect())
            .unwrap_or_default())
    }

    fn delete_labels(&self, user_id: &UserId, ids: &[LabelId]) -> Result<usize> {
        let mut all = self.labels.write().unwrap();
        let mut messages = self.messages.write().unwrap();

        let removed = match all.get_mut(user_id) {
            Some(user_labels) => ids.iter().filter(|id| user_labels.remove(*id).is_some()).count(),
            None => 0,
        };

        if let Some(rows) = messages.rows.get_mut(user_id) {
            for stored in rows.values_mut() {
                stored.message.label_ids.retain(|l| !ids.contains(l));
            }
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserId {
        UserId::new("u1")
    }

    fn labels(ids: &[&str]) -> BTreeSet<LabelId> {
        ids.iter().map(|id| LabelId::new(*id)).collect()
    }

    #[test]
    fn test_upsert_stubs_is_idempotent() {
        let store = InMemoryMirrorStore::new();
        let page = vec![MessageStub::new("m1", "t1"), MessageStub::new("m2", "t1")];

        assert_eq!(store.upsert_stubs(&user(), &page).unwrap(), 2);
        assert_eq!(store.upsert_stubs(&user(), &page).unwrap(), 0);
        assert_eq!(store.count_messages(&user()).unwrap(), 2);
    }

    #[test]
    fn test_users_are_isolated() {
        let store = InMemoryMirrorStore::new();
        store
            .upsert_stubs(&user(), &[MessageStub::new("m1", "t1")])
            .unwrap();
        assert_eq!(store.count_messages(&UserId::new("u2")).unwrap(), 0);
        assert!(
            store
                .get_message(&UserId::new("u2"), &MessageId::new("m1"))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_detail_order() {
        let store = InMemoryMirrorStore::new();
        for id in ["m1", "m2", "m3"] {
            store.upsert_stubs(&user(), &[MessageStub::new(id, "t")]).unwrap();
        }

        let oldest = store
            .list_needing_detail(&user(), DetailOrder::OldestFirst, 2, 3)
            .unwrap();
        assert_eq!(oldest[0].id.as_str(), "m1");
        assert_eq!(oldest[1].id.as_str(), "m2");

        let newest = store
            .list_needing_detail(&user(), DetailOrder::NewestFirst, 2, 3)
            .unwrap();
        assert_eq!(newest[0].id.as_str(), "m3");
    }

    #[test]
    fn test_failed_stubs_leave_the_backlog() {
        let store = InMemoryMirrorStore::new();
        store
            .upsert_stubs(&user(), &[MessageStub::new("m1", "t1")])
            .unwrap();

        for _ in 0..3 {
            store.record_detail_failure(&user(), &MessageId::new("m1")).unwrap();
        }
        assert_eq!(store.count_needing_detail(&user(), 3).unwrap(), 0);
        assert_eq!(store.count_needing_detail(&user(), 4).unwrap(), 1);
    }

    #[test]
    fn test_label_delta() {
        let store = InMemoryMirrorStore::new();
        let id = MessageId::new("m1");
        store
            .upsert_stubs(&user(), &[MessageStub::new("m1", "t1")])
            .unwrap();
        store
            .apply_label_delta(&user(), &id, &labels(&["A", "B"]), &labels(&[]))
            .unwrap();
        store
            .apply_label_delta(&user(), &id, &labels(&["C"]), &labels(&["B"]))
            .unwrap();

        let msg = store.get_message(&user(), &id).unwrap().unwrap();
        assert_eq!(msg.label_ids, vec![LabelId::new("A"), LabelId::new("C")]);

        let missing = store
            .apply_label_delta(&user(), &MessageId::new("nope"), &labels(&["A"]), &labels(&[]))
            .unwrap();
        assert!(!missing);
    }

    #[test]
    fn test_begin_progress_retires_active_row() {
        let store = InMemoryMirrorStore::new();
        let first = store
            .begin_progress(SyncProgress::new(user(), SyncKind::Initial))
            .unwrap();
        let second = store
            .begin_progress(SyncProgress::new(user(), SyncKind::Initial))
            .unwrap();

        assert_ne!(first.id, second.id);
        let first = store.get_progress(first.id).unwrap().unwrap();
        assert_eq!(first.status, SyncStatus::Failed);
        assert!(first.completed_at.is_some());
        assert_eq!(
            store.active_progress(&user(), SyncKind::Initial).unwrap().unwrap().id,
            second.id
        );
    }

    #[test]
    fn test_transition_only_from_active() {
        let store = InMemoryMirrorStore::new();
        let row = store
            .begin_progress(SyncProgress::new(user(), SyncKind::Labels))
            .unwrap();

        assert!(store.transition_progress(row.id, SyncStatus::Completed, None).unwrap());
        assert!(!store.transition_progress(row.id, SyncStatus::Failed, Some("late")).unwrap());
        let row = store.get_progress(row.id).unwrap().unwrap();
        assert_eq!(row.status, SyncStatus::Completed);
        assert!(row.error_message.is_none());
    }

    #[test]
    fn test_state_updates_touch_one_concern() {
        let store = InMemoryMirrorStore::new();
        store.complete_initial_sync(&user(), Some("500"), Utc::now()).unwrap();
        let state = store.mark_label_sync_completed(&user()).unwrap();

        assert!(state.initial_sync_completed);
        assert!(state.label_sync_completed);
        assert_eq!(state.history_cursor.as_deref(), Some("500"));
        assert!(state.can_incremental_sync());
    }

    #[test]
    fn test_cursor_update_never_regresses() {
        let store = InMemoryMirrorStore::new();
        store.advance_history_cursor(&user(), Some("300"), Utc::now()).unwrap();
        let state = store.advance_history_cursor(&user(), Some("250"), Utc::now()).unwrap();
        assert_eq!(state.history_cursor.as_deref(), Some("300"));
        assert!(state.last_incremental_sync_at.is_some());

        let state = store.complete_initial_sync(&user(), Some("200"), Utc::now()).unwrap();
        assert_eq!(state.history_cursor.as_deref(), Some("300"));

        let state = store.reset_for_full_sync(&user()).unwrap();
        assert!(state.history_cursor.is_none());
        assert!(!state.initial_sync_completed);
    }

    #[test]
    fn test_delete_labels_drops_associations() {
        let store = InMemoryMirrorStore::new();
        let id = MessageId::new("m1");
        store
            .upsert_stubs(&user(), &[MessageStub::new("m1", "t1")])
            .unwrap();
        store.upsert_labels(&user(), &[Label::new("A", "a"), Label::new("B", "b")]).unwrap();
        store
            .apply_label_delta(&user(), &id, &labels(&["A", "B"]), &labels(&[]))
            .unwrap();

        assert_eq!(store.delete_labels(&user(), &[LabelId::new("A")]).unwrap(), 1);
        let msg = store.get_message(&user(), &id).unwrap().unwrap();
        assert_eq!(msg.label_ids, vec![LabelId::new("B")]);
        assert_eq!(store.list_labels(&user()).unwrap().len(), 1);
    }
}

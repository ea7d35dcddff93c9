//! SQLite-backed mirror storage

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params};
use rusqlite_migration::{M, Migrations};

use super::{DetailOrder, MirrorStore, SUPERSEDED_MESSAGE};
use crate::models::{
    EmailAddress, Label, LabelId, Message, MessageDetail, MessageId, MessagePayload, MessageStub,
    SyncKind, SyncProgress, SyncStatus, ThreadId, UserId, UserSyncState,
};

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            CREATE TABLE user_sync_state (
                user_id TEXT PRIMARY KEY,
                history_cursor TEXT,
                initial_sync_completed INTEGER NOT NULL DEFAULT 0,
                label_sync_completed INTEGER NOT NULL DEFAULT 0,
                last_full_sync_at TEXT,
                last_incremental_sync_at TEXT
            );

            CREATE TABLE sync_progress (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                cursor TEXT,
                history_cursor TEXT,
                num_processed INTEGER NOT NULL DEFAULT 0,
                num_total INTEGER NOT NULL DEFAULT 0,
                batches_completed INTEGER NOT NULL DEFAULT 0,
                batches_total INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                error_message TEXT,
                started_at TEXT NOT NULL,
                completed_at TEXT
            );

            -- At most one non-terminal run per (user, kind)
            CREATE UNIQUE INDEX idx_sync_progress_active
                ON sync_progress(user_id, kind)
                WHERE status IN ('pending', 'in_progress');

            CREATE INDEX idx_sync_progress_user_kind
                ON sync_progress(user_id, kind, id DESC);

            -- seq is the insertion order used to drain detail batches
            CREATE TABLE messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                remote_id TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                internal_date INTEGER,
                history_id TEXT,
                snippet TEXT,
                subject TEXT,
                from_name TEXT,
                from_email TEXT,
                size_estimate INTEGER,
                payload TEXT,  -- JSON
                detail_failures INTEGER NOT NULL DEFAULT 0,
                UNIQUE (user_id, remote_id)
            );

            CREATE INDEX idx_messages_needing_detail
                ON messages(user_id, seq)
                WHERE internal_date IS NULL OR payload IS NULL;

            CREATE TABLE message_labels (
                message_seq INTEGER NOT NULL,
                label_id TEXT NOT NULL,
                PRIMARY KEY (message_seq, label_id),
                FOREIGN KEY (message_seq) REFERENCES messages(seq) ON DELETE CASCADE
            );

            CREATE INDEX idx_message_labels_label ON message_labels(label_id);

            CREATE TABLE labels (
                user_id TEXT NOT NULL,
                remote_id TEXT NOT NULL,
                name TEXT NOT NULL,
                is_system INTEGER NOT NULL DEFAULT 0,
                message_list_visibility TEXT,
                label_list_visibility TEXT,
                messages_total INTEGER NOT NULL DEFAULT 0,
                messages_unread INTEGER NOT NULL DEFAULT 0,
                threads_total INTEGER NOT NULL DEFAULT 0,
                threads_unread INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, remote_id)
            );
            "#,
        ),
    ])
}

const ACTIVE_STATUSES: &str = "('pending', 'in_progress')";

const PROGRESS_COLUMNS: &str = "id, user_id, kind, cursor, history_cursor, num_processed,
     num_total, batches_completed, batches_total, status, error_message, started_at,
     completed_at";

const MESSAGE_COLUMNS: &str = "seq, remote_id, thread_id, internal_date, history_id, snippet,
     subject, from_name, from_email, size_estimate, payload, detail_failures";

/// SQLite-based mirror store
pub struct SqliteMirrorStore {
    conn: Mutex<Connection>,
}

impl SqliteMirrorStore {
    /// Open (or create) the database at `db_path` and migrate it
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        // WAL lets readers proceed while a worker writes; foreign_keys is
        // required for the message_labels cascade.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn load_user_state(conn: &Connection, user_id: &UserId) -> Result<Option<UserSyncState>> {
        let row: Option<(Option<String>, bool, bool, Option<String>, Option<String>)> = conn
            .query_row(
                "SELECT history_cursor, initial_sync_completed, label_sync_completed,
                        last_full_sync_at, last_incremental_sync_at
                 FROM user_sync_state WHERE user_id = ?",
                [user_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .optional()?;

        let Some((history_cursor, initial, labels, full_at, incremental_at)) = row else {
            return Ok(None);
        };

        Ok(Some(UserSyncState {
            user_id: user_id.clone(),
            history_cursor,
            initial_sync_completed: initial,
            label_sync_completed: labels,
            last_full_sync_at: full_at.as_deref().map(parse_time).transpose()?,
            last_incremental_sync_at: incremental_at.as_deref().map(parse_time).transpose()?,
        }))
    }

    fn write_user_state(conn: &Connection, state: &UserSyncState) -> Result<()> {
        conn.execute(
            "INSERT INTO user_sync_state
             (user_id, history_cursor, initial_sync_completed, label_sync_completed,
              last_full_sync_at, last_incremental_sync_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                history_cursor = excluded.history_cursor,
                initial_sync_completed = excluded.initial_sync_completed,
                label_sync_completed = excluded.label_sync_completed,
                last_full_sync_at = excluded.last_full_sync_at,
                last_incremental_sync_at = excluded.last_incremental_sync_at",
            params![
                state.user_id.as_str(),
                state.history_cursor,
                state.initial_sync_completed,
                state.label_sync_completed,
                format_time(state.last_full_sync_at),
                format_time(state.last_incremental_sync_at),
            ],
        )?;
        Ok(())
    }

    /// Read, modify and write the user's state in one immediate transaction
    ///
    /// The write lock is taken up front so another process cannot slip a
    /// write between the read and the update.
    fn update_user_state(
        &self,
        user_id: &UserId,
        update: impl FnOnce(&mut UserSyncState),
    ) -> Result<UserSyncState> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut state = Self::load_user_state(&tx, user_id)?
            .unwrap_or_else(|| UserSyncState::new(user_id.clone()));
        update(&mut state);
        Self::write_user_state(&tx, &state)?;
        tx.commit()?;
        Ok(state)
    }

    /// Sequence number of a mirrored message
    fn message_seq(conn: &Connection, user_id: &UserId, id: &MessageId) -> Result<Option<i64>> {
        Ok(conn
            .query_row(
                "SELECT seq FROM messages WHERE user_id = ? AND remote_id = ?",
                params![user_id.as_str(), id.as_str()],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn load_message_labels(conn: &Connection, seq: i64) -> Result<Vec<LabelId>> {
        let mut stmt = conn.prepare(
            "SELECT label_id FROM message_labels WHERE message_seq = ? ORDER BY label_id",
        )?;
        let labels = stmt
            .query_map([seq], |row| row.get::<_, String>(0))?
            .map(|r| r.map(LabelId::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(labels)
    }

    fn replace_message_labels(tx: &Transaction, seq: i64, labels: &[LabelId]) -> Result<()> {
        tx.execute("DELETE FROM message_labels WHERE message_seq = ?", [seq])?;
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO message_labels (message_seq, label_id) VALUES (?, ?)",
        )?;
        for label in labels {
            stmt.execute(params![seq, label.as_str()])?;
        }
        Ok(())
    }

    fn query_progress(
        &self,
        sql_filter: &str,
        args: impl rusqlite::Params,
    ) -> Result<Option<SyncProgress>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {} FROM sync_progress {}", PROGRESS_COLUMNS, sql_filter);
        let raw = conn
            .query_row(&sql, args, ProgressRow::from_row)
            .optional()?;
        raw.map(ProgressRow::into_progress).transpose()
    }
}

/// Raw sync_progress columns before enum and time parsing
struct ProgressRow {
    id: i64,
    user_id: String,
    kind: String,
    cursor: Option<String>,
    history_cursor: Option<String>,
    num_processed: i64,
    num_total: i64,
    batches_completed: i64,
    batches_total: i64,
    status: String,
    error_message: Option<String>,
    started_at: String,
    completed_at: Option<String>,
}

impl ProgressRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            kind: row.get(2)?,
            cursor: row.get(3)?,
            history_cursor: row.get(4)?,
            num_processed: row.get(5)?,
            num_total: row.get(6)?,
            batches_completed: row.get(7)?,
            batches_total: row.get(8)?,
            status: row.get(9)?,
            error_message: row.get(10)?,
            started_at: row.get(11)?,
            completed_at: row.get(12)?,
        })
    }

    fn into_progress(self) -> Result<SyncProgress> {
        let kind = SyncKind::parse(&self.kind)
            .with_context(|| format!("Unknown sync kind in progress row {}: {}", self.id, self.kind))?;
        let status = SyncStatus::parse(&self.status).with_context(|| {
            format!("Unknown status in progress row {}: {}", self.id, self.status)
        })?;

        Ok(SyncProgress {
            id: self.id,
            user_id: UserId::new(self.user_id),
            kind,
            cursor: self.cursor,
            history_cursor: self.history_cursor,
            num_processed: self.num_processed.max(0) as u64,
            num_total: self.num_total.max(0) as u64,
            batches_completed: self.batches_completed.max(0) as u64,
            batches_total: self.batches_total.max(0) as u64,
            status,
            error_message: self.error_message,
            started_at: parse_time(&self.started_at)?,
            completed_at: self.completed_at.as_deref().map(parse_time).transpose()?,
        })
    }
}

/// Raw messages columns
struct MessageRow {
    seq: i64,
    remote_id: String,
    thread_id: String,
    internal_date: Option<i64>,
    history_id: Option<String>,
    snippet: Option<String>,
    subject: Option<String>,
    from_name: Option<String>,
    from_email: Option<String>,
    size_estimate: Option<i64>,
    payload: Option<String>,
    detail_failures: i64,
}

impl MessageRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            remote_id: row.get(1)?,
            thread_id: row.get(2)?,
            internal_date: row.get(3)?,
            history_id: row.get(4)?,
            snippet: row.get(5)?,
            subject: row.get(6)?,
            from_name: row.get(7)?,
            from_email: row.get(8)?,
            size_estimate: row.get(9)?,
            payload: row.get(10)?,
            detail_failures: row.get(11)?,
        })
    }

    fn into_message(self, user_id: &UserId, label_ids: Vec<LabelId>) -> Result<Message> {
        let payload: Option<MessagePayload> = self
            .payload
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .with_context(|| format!("Corrupt payload for message {}", self.remote_id))?;

        Ok(Message {
            user_id: user_id.clone(),
            id: MessageId::new(self.remote_id),
            thread_id: ThreadId::new(self.thread_id),
            internal_date: self.internal_date,
            payload,
            history_id: self.history_id,
            snippet: self.snippet,
            subject: self.subject,
            from: self.from_email.map(|email| EmailAddress {
                name: self.from_name,
                email,
            }),
            size_estimate: self.size_estimate.map(|s| s.max(0) as u64),
            label_ids,
            detail_failures: self.detail_failures.max(0) as u32,
        })
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp: {}", s))?
        .with_timezone(&Utc))
}

fn format_time(t: Option<DateTime<Utc>>) -> Option<String> {
    t.map(|t| t.to_rfc3339())
}

impl MirrorStore for SqliteMirrorStore {
    fn get_user_state(&self, user_id: &UserId) -> Result<Option<UserSyncState>> {
        let conn = self.conn.lock().unwrap();
        Self::load_user_state(&conn, user_id)
    }

    fn save_user_state(&self, state: &UserSyncState) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        Self::write_user_state(&conn, state)
    }

    fn mark_label_sync_completed(&self, user_id: &UserId) -> Result<UserSyncState> {
        self.update_user_state(user_id, |state| state.label_sync_completed = true)
    }

    fn complete_initial_sync(
        &self,
        user_id: &UserId,
        cursor: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<UserSyncState> {
        self.update_user_state(user_id, |state| {
            state.initial_sync_completed = true;
            state.last_full_sync_at = Some(at);
            if let Some(cursor) = cursor {
                state.advance_cursor(cursor);
            }
        })
    }

    fn advance_history_cursor(
        &self,
        user_id: &UserId,
        cursor: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<UserSyncState> {
        self.update_user_state(user_id, |state| {
            if let Some(cursor) = cursor {
                state.advance_cursor(cursor);
            }
            state.last_incremental_sync_at = Some(at);
        })
    }

    fn reset_for_full_sync(&self, user_id: &UserId) -> Result<UserSyncState> {
        self.update_user_state(user_id, UserSyncState::reset_for_full_sync)
    }

    fn begin_progress(&self, mut progress: SyncProgress) -> Result<SyncProgress> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        tx.execute(
            &format!(
                "UPDATE sync_progress
                 SET status = 'failed', error_message = ?, completed_at = ?
                 WHERE user_id = ? AND kind = ? AND status IN {}",
                ACTIVE_STATUSES
            ),
            params![
                SUPERSEDED_MESSAGE,
                now,
                progress.user_id.as_str(),
                progress.kind.as_str()
            ],
        )?;

        tx.execute(
            "INSERT INTO sync_progress
             (user_id, kind, cursor, history_cursor, num_processed, num_total,
              batches_completed, batches_total, status, error_message, started_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                progress.user_id.as_str(),
                progress.kind.as_str(),
                progress.cursor,
                progress.history_cursor,
                progress.num_processed as i64,
                progress.num_total as i64,
                progress.batches_completed as i64,
                progress.batches_total as i64,
                progress.status.as_str(),
                progress.error_message,
                progress.started_at.to_rfc3339(),
                format_time(progress.completed_at),
            ],
        )?;
        progress.id = tx.last_insert_rowid();
        tx.commit()?;

        log::debug!(
            "[STORE] Began {} progress row {} for {}",
            progress.kind,
            progress.id,
            progress.user_id
        );
        Ok(progress)
    }

    fn get_progress(&self, id: i64) -> Result<Option<SyncProgress>> {
        self.query_progress("WHERE id = ?", [id])
    }

    fn active_progress(&self, user_id: &UserId, kind: SyncKind) -> Result<Option<SyncProgress>> {
        self.query_progress(
            &format!(
                "WHERE user_id = ? AND kind = ? AND status IN {} ORDER BY id DESC LIMIT 1",
                ACTIVE_STATUSES
            ),
            params![user_id.as_str(), kind.as_str()],
        )
    }

    fn latest_progress(&self, user_id: &UserId, kind: SyncKind) -> Result<Option<SyncProgress>> {
        self.query_progress(
            "WHERE user_id = ? AND kind = ? ORDER BY id DESC LIMIT 1",
            params![user_id.as_str(), kind.as_str()],
        )
    }

    fn save_progress_checkpoint(&self, progress: &SyncProgress) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            &format!(
                "UPDATE sync_progress SET
                    cursor = ?,
                    history_cursor = ?,
                    num_processed = MAX(num_processed, ?),
                    num_total = ?,
                    batches_completed = MAX(batches_completed, ?),
                    batches_total = ?
                 WHERE id = ? AND status IN {}",
                ACTIVE_STATUSES
            ),
            params![
                progress.cursor,
                progress.history_cursor,
                progress.num_processed as i64,
                progress.num_total as i64,
                progress.batches_completed as i64,
                progress.batches_total as i64,
                progress.id,
            ],
        )?;
        Ok(changed > 0)
    }

    fn record_progress_batch(&self, id: i64, processed: u64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sync_progress SET
                num_processed = num_processed + ?,
                batches_completed = batches_completed + 1
             WHERE id = ?",
            params![processed as i64, id],
        )?;
        Ok(())
    }

    fn transition_progress(
        &self,
        id: i64,
        to: SyncStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = match to {
            SyncStatus::Pending => 0,
            SyncStatus::InProgress => conn.execute(
                &format!(
                    "UPDATE sync_progress SET status = 'in_progress'
                     WHERE id = ? AND status IN {}",
                    ACTIVE_STATUSES
                ),
                [id],
            )?,
            SyncStatus::Completed | SyncStatus::Failed => conn.execute(
                &format!(
                    "UPDATE sync_progress SET status = ?, error_message = ?, completed_at = ?
                     WHERE id = ? AND status IN {}",
                    ACTIVE_STATUSES
                ),
                params![
                    to.as_str(),
                    if to == SyncStatus::Failed {
                        Some(error_message.unwrap_or_default())
                    } else {
                        None
                    },
                    Utc::now().to_rfc3339(),
                    id
                ],
            )?,
        };
        Ok(changed > 0)
    }

    fn upsert_stubs(&self, user_id: &UserId, stubs: &[MessageStub]) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            // Existing rows keep their enrichment
            let mut stmt = tx.prepare(
                "INSERT INTO messages (user_id, remote_id, thread_id) VALUES (?, ?, ?)
                 ON CONFLICT(user_id, remote_id) DO NOTHING",
            )?;
            for stub in stubs {
                inserted +=
                    stmt.execute(params![user_id.as_str(), stub.id.as_str(), stub.thread_id.as_str()])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn get_message(&self, user_id: &UserId, id: &MessageId) -> Result<Option<Message>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM messages WHERE user_id = ? AND remote_id = ?",
                    MESSAGE_COLUMNS
                ),
                params![user_id.as_str(), id.as_str()],
                MessageRow::from_row,
            )
            .optional()?;

        let Some(row) = row else {
            return Ok(None);
        };
        let labels = Self::load_message_labels(&conn, row.seq)?;
        row.into_message(user_id, labels).map(Some)
    }

    fn delete_messages(&self, user_id: &UserId, ids: &[MessageId]) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut deleted = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM messages WHERE user_id = ? AND remote_id = ?")?;
            for id in ids {
                deleted += stmt.execute(params![user_id.as_str(), id.as_str()])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    fn apply_label_delta(
        &self,
        user_id: &UserId,
        id: &MessageId,
        added: &BTreeSet<LabelId>,
        removed: &BTreeSet<LabelId>,
    ) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let Some(seq) = Self::message_seq(&tx, user_id, id)? else {
            return Ok(false);
        };

        {
            let mut insert = tx.prepare(
                "INSERT OR IGNORE INTO message_labels (message_seq, label_id) VALUES (?, ?)",
            )?;
            for label in added {
                insert.execute(params![seq, label.as_str()])?;
            }
            let mut delete =
                tx.prepare("DELETE FROM message_labels WHERE message_seq = ? AND label_id = ?")?;
            for label in removed {
                delete.execute(params![seq, label.as_str()])?;
            }
        }

        tx.commit()?;
        Ok(true)
    }

    fn list_needing_detail(
        &self,
        user_id: &UserId,
        order: DetailOrder,
        limit: usize,
        max_failures: u32,
    ) -> Result<Vec<MessageStub>> {
        let direction = match order {
            DetailOrder::OldestFirst => "ASC",
            DetailOrder::NewestFirst => "DESC",
        };
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT remote_id, thread_id FROM messages
             WHERE user_id = ? AND (internal_date IS NULL OR payload IS NULL)
               AND detail_failures < ?
             ORDER BY seq {}
             LIMIT ?",
            direction
        ))?;

        let stubs = stmt
            .query_map(
                params![user_id.as_str(), max_failures as i64, limit as i64],
                |row| {
                    Ok(MessageStub {
                        id: MessageId::new(row.get::<_, String>(0)?),
                        thread_id: ThreadId::new(row.get::<_, String>(1)?),
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(stubs)
    }

    fn count_needing_detail(&self, user_id: &UserId, max_failures: u32) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE user_id = ? AND (internal_date IS NULL OR payload IS NULL)
               AND detail_failures < ?",
            params![user_id.as_str(), max_failures as i64],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn write_detail(
        &self,
        user_id: &UserId,
        id: &MessageId,
        detail: &MessageDetail,
    ) -> Result<bool> {
        let payload = serde_json::to_string(&detail.payload)?;
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let Some(seq) = Self::message_seq(&tx, user_id, id)? else {
            return Ok(false);
        };

        tx.execute(
            "UPDATE messages SET
                thread_id = ?,
                internal_date = ?,
                history_id = ?,
                snippet = ?,
                subject = ?,
                from_name = ?,
                from_email = ?,
                size_estimate = ?,
                payload = ?
             WHERE seq = ?",
            params![
                detail.thread_id.as_str(),
                detail.internal_date,
                detail.history_id,
                detail.snippet,
                detail.subject,
                detail.from.as_ref().and_then(|f| f.name.clone()),
                detail.from.as_ref().map(|f| f.email.clone()),
                detail.size_estimate as i64,
                payload,
                seq,
            ],
        )?;
        Self::replace_message_labels(&tx, seq, &detail.label_ids)?;

        tx.commit()?;
        Ok(true)
    }

    fn record_detail_failure(&self, user_id: &UserId, id: &MessageId) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE messages SET detail_failures = detail_failures + 1
             WHERE user_id = ? AND remote_id = ?",
            params![user_id.as_str(), id.as_str()],
        )?;
        Ok(())
    }

    fn count_messages(&self, user_id: &UserId) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE user_id = ?",
            [user_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn upsert_labels(&self, user_id: &UserId, labels: &[Label]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO labels
                 (user_id, remote_id, name, is_system, message_list_visibility,
                  label_list_visibility, messages_total, messages_unread,
                  threads_total, threads_unread)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(user_id, remote_id) DO UPDATE SET
                    name = excluded.name,
                    is_system = excluded.is_system,
                    message_list_visibility = excluded.message_list_visibility,
                    label_list_visibility = excluded.label_list_visibility,
                    messages_total = excluded.messages_total,
                    messages_unread = excluded.messages_unread,
                    threads_total = excluded.threads_total,
                    threads_unread = excluded.threads_unread",
            )?;
            for label in labels {
                stmt.execute(params![
                    user_id.as_str(),
                    label.id.as_str(),
                    label.name,
                    label.is_system,
                    label.message_list_visibility,
                    label.label_list_visibility,
                    label.messages_total,
                    label.messages_unread,
                    label.threads_total,
                    label.threads_unread,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn list_labels(&self, user_id: &UserId) -> Result<Vec<Label>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT remote_id, name, is_system, message_list_visibility, label_list_visibility,
                    messages_total, messages_unread, threads_total, threads_unread
             FROM labels WHERE user_id = ? ORDER BY remote_id",
        )?;

        let labels = stmt
            .query_map([user_id.as_str()], |row| {
                Ok(Label {
                    id: LabelId::new(row.get::<_, String>(0)?),
                    name: row.get(1)?,
                    is_system: row.get(2)?,
                    message_list_visibility: row.get(3)?,
                    label_list_visibility: row.get(4)?,
                    messages_total: row.get(5)?,
                    messages_unread: row.get(6)?,
                    threads_total: row.get(7)?,
                    threads_unread: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(labels)
    }

    fn delete_labels(&self, user_id: &UserId, ids: &[LabelId]) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut deleted = 0;
        {
            let mut delete_label =
                tx.prepare("DELETE FROM labels WHERE user_id = ? AND remote_id = ?")?;
            let mut delete_links = tx.prepare(
                "DELETE FROM message_labels
                 WHERE label_id = ?
                   AND message_seq IN (SELECT seq FROM messages WHERE user_id = ?)",
            )?;
            for id in ids {
                deleted += delete_label.execute(params![user_id.as_str(), id.as_str()])?;
                delete_links.execute(params![id.as_str(), user_id.as_str()])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }
}

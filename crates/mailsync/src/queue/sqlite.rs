//! Durable job queue in its own SQLite database

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use rusqlite_migration::{M, Migrations};

use super::{ClaimedJob, Job, JobId, JobKind, JobQueue, QueueStats, epoch_millis, lease_until};

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            r#"
            CREATE TABLE jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                run_at INTEGER NOT NULL,       -- epoch millis
                lease_until INTEGER,           -- epoch millis
                last_error TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX idx_jobs_due ON jobs(kind, state, run_at);
            "#,
        ),
        // Migration 2: owner column for open-job lookups
        M::up(
            r#"
            ALTER TABLE jobs ADD COLUMN user_id TEXT;
            UPDATE jobs SET user_id = json_extract(payload, '$.user_id');
            CREATE INDEX idx_jobs_open ON jobs(kind, user_id, state);
            "#,
        ),
    ])
}

fn insert_job(conn: &Connection, job: &Job) -> Result<JobId> {
    let payload = serde_json::to_string(job).context("Failed to serialize job")?;
    let now = Utc::now();
    conn.execute(
        "INSERT INTO jobs (kind, user_id, payload, run_at, created_at) VALUES (?, ?, ?, ?, ?)",
        params![
            job.kind().queue_name(),
            job.user_id().as_str(),
            payload,
            epoch_millis(now),
            now.to_rfc3339()
        ],
    )?;
    Ok(JobId(conn.last_insert_rowid()))
}

/// SQLite-backed [`JobQueue`]
///
/// Claims run in an immediate transaction so two processes sharing the file
/// never lease the same job.
pub struct SqliteJobQueue {
    conn: Mutex<Connection>,
}

impl SqliteJobQueue {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open job queue at {:?}", db_path.as_ref()))?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run job queue migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn update_job(&self, id: JobId, sql: &str, args: impl rusqlite::Params) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(sql, args)?;
        if changed == 0 {
            bail!("Job {} not found", id);
        }
        Ok(())
    }
}

impl JobQueue for SqliteJobQueue {
    fn enqueue(&self, job: &Job) -> Result<JobId> {
        let conn = self.conn.lock().unwrap();
        insert_job(&conn, job)
    }

    fn enqueue_unique(&self, job: &Job) -> Result<Option<JobId>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let open: bool = tx.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM jobs
                WHERE kind = ? AND user_id = ? AND state IN ('pending', 'leased'))",
            params![job.kind().queue_name(), job.user_id().as_str()],
            |row| row.get(0),
        )?;
        if open {
            return Ok(None);
        }

        let id = insert_job(&tx, job)?;
        tx.commit()?;
        Ok(Some(id))
    }

    fn claim(&self, kind: JobKind, lease: Duration) -> Result<Option<ClaimedJob>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();
        let now_ms = epoch_millis(now);

        let row: Option<(i64, String, u32)> = tx
            .query_row(
                "SELECT id, payload, attempts FROM jobs
                 WHERE kind = ?
                   AND ((state = 'pending' AND run_at <= ?)
                        OR (state = 'leased' AND lease_until <= ?))
                 ORDER BY run_at, id
                 LIMIT 1",
                params![kind.queue_name(), now_ms, now_ms],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((id, payload, attempts)) = row else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE jobs SET state = 'leased', attempts = attempts + 1, lease_until = ?
             WHERE id = ?",
            params![epoch_millis(lease_until(now, lease)), id],
        )?;
        tx.commit()?;

        let job: Job = serde_json::from_str(&payload)
            .with_context(|| format!("Corrupt payload for job {}", id))?;

        Ok(Some(ClaimedJob {
            id: JobId(id),
            job,
            attempt: attempts + 1,
        }))
    }

    fn ack(&self, id: JobId) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM jobs WHERE id = ?", [id.0])?;
        Ok(())
    }

    fn retry(&self, id: JobId, run_at: DateTime<Utc>, error: &str) -> Result<()> {
        self.update_job(
            id,
            "UPDATE jobs SET state = 'pending', run_at = ?, lease_until = NULL, last_error = ?
             WHERE id = ?",
            params![epoch_millis(run_at), error, id.0],
        )
    }

    fn release(&self, id: JobId, run_at: DateTime<Utc>) -> Result<()> {
        self.update_job(
            id,
            "UPDATE jobs SET state = 'pending', run_at = ?, lease_until = NULL,
                attempts = MAX(attempts - 1, 0)
             WHERE id = ?",
            params![epoch_millis(run_at), id.0],
        )
    }

    fn bury(&self, id: JobId, error: &str) -> Result<()> {
        self.update_job(
            id,
            "UPDATE jobs SET state = 'buried', lease_until = NULL, last_error = ? WHERE id = ?",
            params![error, id.0],
        )
    }

    fn stats(&self, kind: JobKind) -> Result<QueueStats> {
        let conn = self.conn.lock().unwrap();
        let (pending, leased, buried): (i64, i64, i64) = conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN state = 'pending' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN state = 'leased' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN state = 'buried' THEN 1 ELSE 0 END), 0)
             FROM jobs WHERE kind = ?",
            [kind.queue_name()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        Ok(QueueStats {
            pending: pending as usize,
            leased: leased as usize,
            buried: buried as usize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SyncKind, UserId};
    use crate::queue::DetailBatch;
    use tempfile::tempdir;

    const LEASE: Duration = Duration::from_secs(60);

    fn detail_job() -> Job {
        Job::DetailBatch(DetailBatch {
            user_id: UserId::new("u1"),
            batch_size: 25,
            sync_kind: SyncKind::Incremental,
            progress_id: 3,
        })
    }

    #[test]
    fn test_enqueue_claim_ack() {
        let dir = tempdir().unwrap();
        let queue = SqliteJobQueue::new(dir.path().join("jobs.test.sqlite")).unwrap();

        let id = queue.enqueue(&detail_job()).unwrap();
        let claimed = queue.claim(JobKind::DetailBatch, LEASE).unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.job, detail_job());
        assert_eq!(claimed.attempt, 1);
        assert!(queue.claim(JobKind::DetailBatch, LEASE).unwrap().is_none());

        queue.ack(id).unwrap();
        assert_eq!(queue.stats(JobKind::DetailBatch).unwrap(), QueueStats::default());
    }

    #[test]
    fn test_jobs_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jobs.test.sqlite");
        {
            let queue = SqliteJobQueue::new(&path).unwrap();
            queue.enqueue(&detail_job()).unwrap();
            // Claimed but never acknowledged: the worker "crashed"
            queue.claim(JobKind::DetailBatch, Duration::ZERO).unwrap();
        }

        let queue = SqliteJobQueue::new(&path).unwrap();
        let claimed = queue.claim(JobKind::DetailBatch, LEASE).unwrap().unwrap();
        assert_eq!(claimed.attempt, 2);
    }

    #[test]
    fn test_retry_and_bury() {
        let dir = tempdir().unwrap();
        let queue = SqliteJobQueue::new(dir.path().join("jobs.test.sqlite")).unwrap();
        let id = queue.enqueue(&detail_job()).unwrap();
        queue.claim(JobKind::DetailBatch, LEASE).unwrap();

        queue
            .retry(id, Utc::now() + chrono::Duration::hours(1), "timeout")
            .unwrap();
        assert!(queue.claim(JobKind::DetailBatch, LEASE).unwrap().is_none());
        assert_eq!(queue.stats(JobKind::DetailBatch).unwrap().pending, 1);

        queue.bury(id, "gave up").unwrap();
        assert_eq!(queue.stats(JobKind::DetailBatch).unwrap().buried, 1);
        assert!(queue.bury(JobId(999), "missing").is_err());
    }

    #[test]
    fn test_enqueue_unique_and_release() {
        let dir = tempdir().unwrap();
        let queue = SqliteJobQueue::new(dir.path().join("jobs.test.sqlite")).unwrap();
        let labels = Job::SyncLabels {
            user_id: UserId::new("u1"),
        };

        let id = queue.enqueue_unique(&labels).unwrap().unwrap();
        assert!(queue.enqueue_unique(&labels).unwrap().is_none());
        assert!(queue.enqueue_unique(&detail_job()).unwrap().is_some());

        queue.claim(JobKind::SyncLabels, LEASE).unwrap().unwrap();
        assert!(queue.enqueue_unique(&labels).unwrap().is_none());

        queue.release(id, Utc::now()).unwrap();
        let claimed = queue.claim(JobKind::SyncLabels, LEASE).unwrap().unwrap();
        assert_eq!(claimed.attempt, 1);

        queue.bury(id, "gave up").unwrap();
        assert!(queue.enqueue_unique(&labels).unwrap().is_some());
        assert_eq!(queue.stats(JobKind::SyncLabels).unwrap().pending, 1);
    }
}

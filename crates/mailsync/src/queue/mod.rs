//! Job queues and the worker runtime
//!
//! Each [`JobKind`] has its own queue. Producers go through a
//! [`JobDispatcher`]; workers claim jobs with a lease, so a job whose worker
//! died is redelivered once the lease expires. Delivery is at-least-once and
//! every handler is written to be replay-safe.

mod memory;
mod rate_limit;
mod sqlite;
mod worker;

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{SyncKind, UserId};

pub use memory::InMemoryJobQueue;
pub use rate_limit::RateLimiter;
pub use sqlite::SqliteJobQueue;
pub use worker::{JobHandler, Worker, WorkerOutcome, WorkerPool};

/// The four job kinds, one queue each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    SyncInitial,
    SyncIncremental,
    SyncLabels,
    DetailBatch,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::SyncInitial,
        JobKind::SyncIncremental,
        JobKind::SyncLabels,
        JobKind::DetailBatch,
    ];

    pub fn queue_name(&self) -> &'static str {
        match self {
            Self::SyncInitial => "sync_initial",
            Self::SyncIncremental => "sync_incremental",
            Self::SyncLabels => "sync_labels",
            Self::DetailBatch => "detail_batch",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.queue_name() == name)
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.queue_name())
    }
}

/// Payload of a detail batch job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailBatch {
    pub user_id: UserId,
    pub batch_size: usize,
    /// Run that produced the stubs; picks the drain order
    pub sync_kind: SyncKind,
    /// Progress row the batch reports into
    pub progress_id: i64,
}

/// A unit of work; serialized as the queue payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Job {
    SyncInitial { user_id: UserId },
    SyncIncremental { user_id: UserId },
    SyncLabels { user_id: UserId },
    DetailBatch(DetailBatch),
}

impl Job {
    pub fn kind(&self) -> JobKind {
        match self {
            Self::SyncInitial { .. } => JobKind::SyncInitial,
            Self::SyncIncremental { .. } => JobKind::SyncIncremental,
            Self::SyncLabels { .. } => JobKind::SyncLabels,
            Self::DetailBatch(_) => JobKind::DetailBatch,
        }
    }

    pub fn user_id(&self) -> &UserId {
        match self {
            Self::SyncInitial { user_id }
            | Self::SyncIncremental { user_id }
            | Self::SyncLabels { user_id } => user_id,
            Self::DetailBatch(batch) => &batch.user_id,
        }
    }

    /// The sync job for a kind of run
    pub fn sync(kind: SyncKind, user_id: UserId) -> Self {
        match kind {
            SyncKind::Initial => Self::SyncInitial { user_id },
            SyncKind::Incremental => Self::SyncIncremental { user_id },
            SyncKind::Labels => Self::SyncLabels { user_id },
        }
    }
}

/// Queue-assigned job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A leased job handed to a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedJob {
    pub id: JobId,
    pub job: Job,
    /// Deliveries so far, including this one
    pub attempt: u32,
}

/// Per-queue counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Waiting, whether due now or scheduled for retry
    pub pending: usize,
    /// Claimed and not yet acknowledged (including expired leases)
    pub leased: usize,
    /// Given up on after exhausting attempts or failing terminally
    pub buried: usize,
}

/// Storage for queued jobs
///
/// Acknowledged jobs are removed; buried jobs stay for inspection.
pub trait JobQueue: Send + Sync {
    /// Record a job; returns once it is durably stored
    fn enqueue(&self, job: &Job) -> Result<JobId>;

    /// Record a job unless one of the same kind for the same user is still
    /// pending or leased
    ///
    /// The check and the insert happen in one step. Returns `None` when an
    /// open job already exists.
    fn enqueue_unique(&self, job: &Job) -> Result<Option<JobId>>;

    /// Lease the next due job of `kind` for `lease`, counting the attempt
    ///
    /// Due means pending with `run_at <= now`, or leased with an expired lease.
    fn claim(&self, kind: JobKind, lease: Duration) -> Result<Option<ClaimedJob>>;

    fn ack(&self, id: JobId) -> Result<()>;

    /// Release the lease and make the job due again at `run_at`
    fn retry(&self, id: JobId, run_at: DateTime<Utc>, error: &str) -> Result<()>;

    /// Hand a claimed job back untouched, due at `run_at`
    ///
    /// Unlike [`JobQueue::retry`] the delivery does not count as an attempt.
    fn release(&self, id: JobId, run_at: DateTime<Utc>) -> Result<()>;

    fn bury(&self, id: JobId, error: &str) -> Result<()>;

    fn stats(&self, kind: JobKind) -> Result<QueueStats>;
}

/// Producer-side entry point used by the coordinator and engines
pub trait JobDispatcher: Send + Sync {
    fn dispatch(&self, job: Job) -> Result<JobId>;

    /// Dispatch unless the same kind of job for the same user is still open
    fn dispatch_unique(&self, job: Job) -> Result<Option<JobId>>;
}

/// Dispatches jobs onto the queue for their kind
pub struct Dispatcher<Q: JobQueue + ?Sized> {
    queue: std::sync::Arc<Q>,
}

impl<Q: JobQueue + ?Sized> Dispatcher<Q> {
    pub fn new(queue: std::sync::Arc<Q>) -> Self {
        Self { queue }
    }
}

impl<Q: JobQueue + ?Sized> JobDispatcher for Dispatcher<Q> {
    fn dispatch(&self, job: Job) -> Result<JobId> {
        let id = self.queue.enqueue(&job)?;
        log::debug!(
            "[QUEUE] Enqueued {} job {} for {}",
            job.kind(),
            id,
            job.user_id()
        );
        Ok(id)
    }

    fn dispatch_unique(&self, job: Job) -> Result<Option<JobId>> {
        let id = self.queue.enqueue_unique(&job)?;
        match id {
            Some(id) => log::debug!(
                "[QUEUE] Enqueued {} job {} for {}",
                job.kind(),
                id,
                job.user_id()
            ),
            None => log::debug!(
                "[QUEUE] {} job for {} already queued",
                job.kind(),
                job.user_id()
            ),
        }
        Ok(id)
    }
}

/// Milliseconds since the epoch, as stored in queue rows
fn epoch_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn lease_until(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_job_payload_format() {
        let job = Job::DetailBatch(DetailBatch {
            user_id: UserId::new("u1"),
            batch_size: 50,
            sync_kind: SyncKind::Initial,
            progress_id: 7,
        });
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["type"], "detail_batch");
        assert_eq!(json["sync_kind"], "initial");
        assert_eq!(json["progress_id"], 7);

        let sync = serde_json::to_value(Job::SyncLabels {
            user_id: UserId::new("u1"),
        })
        .unwrap();
        assert_eq!(sync["type"], "sync_labels");
        assert_eq!(sync["user_id"], "u1");
    }

    #[test]
    fn test_job_kinds() {
        let user = UserId::new("u1");
        assert_eq!(Job::sync(SyncKind::Initial, user.clone()).kind(), JobKind::SyncInitial);
        assert_eq!(
            Job::sync(SyncKind::Incremental, user.clone()).kind(),
            JobKind::SyncIncremental
        );
        assert_eq!(Job::sync(SyncKind::Labels, user).kind(), JobKind::SyncLabels);

        for kind in JobKind::ALL {
            assert_eq!(JobKind::parse(kind.queue_name()), Some(kind));
        }
        assert_eq!(JobKind::parse("unknown"), None);
    }

    #[test]
    fn test_dispatcher_routes_by_kind() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let dispatcher = Dispatcher::new(queue.clone());

        dispatcher
            .dispatch(Job::SyncLabels {
                user_id: UserId::new("u1"),
            })
            .unwrap();

        assert_eq!(queue.stats(JobKind::SyncLabels).unwrap().pending, 1);
        assert_eq!(queue.stats(JobKind::SyncInitial).unwrap().pending, 0);
    }
}

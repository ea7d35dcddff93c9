//! In-memory job queue for tests and single-process embedding

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};

use super::{ClaimedJob, Job, JobId, JobKind, JobQueue, QueueStats, lease_until};
use crate::models::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Pending,
    Leased,
    Buried,
}

struct StoredJob {
    job: Job,
    state: JobState,
    attempts: u32,
    run_at: DateTime<Utc>,
    lease_until: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl StoredJob {
    fn is_open_for(&self, kind: JobKind, user_id: &UserId) -> bool {
        self.state != JobState::Buried && self.job.kind() == kind && self.job.user_id() == user_id
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Pending => self.run_at <= now,
            JobState::Leased => self.lease_until.is_some_and(|until| until <= now),
            JobState::Buried => false,
        }
    }
}

#[derive(Default)]
struct QueueInner {
    jobs: BTreeMap<i64, StoredJob>,
    next_id: i64,
}

impl QueueInner {
    fn insert(&mut self, job: &Job) -> JobId {
        self.next_id += 1;
        let id = self.next_id;
        self.jobs.insert(
            id,
            StoredJob {
                job: job.clone(),
                state: JobState::Pending,
                attempts: 0,
                run_at: Utc::now(),
                lease_until: None,
                last_error: None,
            },
        );
        JobId(id)
    }
}

/// Job queue held in process memory
pub struct InMemoryJobQueue {
    inner: Mutex<QueueInner>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
        }
    }

    /// Jobs of `kind` still waiting to run, in id order
    pub fn pending_jobs(&self, kind: JobKind) -> Vec<Job> {
        let inner = self.inner.lock().unwrap();
        inner
            .jobs
            .values()
            .filter(|j| j.job.kind() == kind && j.state == JobState::Pending)
            .map(|j| j.job.clone())
            .collect()
    }

    /// Last recorded error of a job, if any
    pub fn last_error(&self, id: JobId) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.jobs.get(&id.0).and_then(|j| j.last_error.clone())
    }

    /// Make every scheduled retry due now
    pub fn release_scheduled(&self) {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        for job in inner.jobs.values_mut() {
            if job.state == JobState::Pending && job.run_at > now {
                job.run_at = now;
            }
        }
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue(&self, job: &Job) -> Result<JobId> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.insert(job))
    }

    fn enqueue_unique(&self, job: &Job) -> Result<Option<JobId>> {
        let mut inner = self.inner.lock().unwrap();
        let open = inner
            .jobs
            .values()
            .any(|j| j.is_open_for(job.kind(), job.user_id()));
        if open {
            return Ok(None);
        }
        Ok(Some(inner.insert(job)))
    }

    fn claim(&self, kind: JobKind, lease: Duration) -> Result<Option<ClaimedJob>> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();

        let next = inner
            .jobs
            .iter_mut()
            .filter(|(_, j)| j.job.kind() == kind && j.is_due(now))
            .min_by_key(|(id, j)| (j.run_at, **id));

        let Some((id, stored)) = next else {
            return Ok(None);
        };

        stored.state = JobState::Leased;
        stored.attempts += 1;
        stored.lease_until = Some(lease_until(now, lease));

        Ok(Some(ClaimedJob {
            id: JobId(*id),
            job: stored.job.clone(),
            attempt: stored.attempts,
        }))
    }

    fn ack(&self, id: JobId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.jobs.remove(&id.0);
        Ok(())
    }

    fn retry(&self, id: JobId, run_at: DateTime<Utc>, error: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some(stored) = inner.jobs.get_mut(&id.0) else {
            bail!("Job {} not found", id);
        };
        stored.state = JobState::Pending;
        stored.run_at = run_at;
        stored.lease_until = None;
        stored.last_error = Some(error.to_string());
        Ok(())
    }

    fn release(&self, id: JobId, run_at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some(stored) = inner.jobs.get_mut(&id.0) else {
            bail!("Job {} not found", id);
        };
        stored.state = JobState::Pending;
        stored.run_at = run_at;
        stored.lease_until = None;
        stored.attempts = stored.attempts.saturating_sub(1);
        Ok(())
    }

    fn bury(&self, id: JobId, error: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let Some(stored) = inner.jobs.get_mut(&id.0) else {
            bail!("Job {} not found", id);
        };
        stored.state = JobState::Buried;
        stored.lease_until = None;
        stored.last_error = Some(error.to_string());
        Ok(())
    }

    fn stats(&self, kind: JobKind) -> Result<QueueStats> {
        let inner = self.inner.lock().unwrap();
        let mut stats = QueueStats::default();
        for job in inner.jobs.values().filter(|j| j.job.kind() == kind) {
            match job.state {
                JobState::Pending => stats.pending += 1,
                JobState::Leased => stats.leased += 1,
                JobState::Buried => stats.buried += 1,
            }
        }
        Ok(stats)
    }
}

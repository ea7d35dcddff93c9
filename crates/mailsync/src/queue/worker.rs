//! Worker runtime: claim, run, then ack, retry or bury

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;

use super::{ClaimedJob, Job, JobKind, JobQueue, RateLimiter};
use crate::config::QueuePolicies;
use crate::error;

/// How long an idle worker thread sleeps before polling again
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Executes jobs claimed from the queues
pub trait JobHandler: Send + Sync {
    fn handle(&self, job: &Job) -> Result<()>;

    /// Called once a job is buried, with the error that ended it
    fn on_exhausted(&self, job: &Job, error: &anyhow::Error) -> Result<()>;
}

/// Result of one [`Worker::run_once`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Nothing due
    Idle,
    /// The kind's rate limit is spent for this long
    Throttled(Duration),
    Completed,
    /// Failed and rescheduled
    Retried,
    /// Failed for good
    Buried,
}

/// Applies per-kind policies around a [`JobHandler`]
pub struct Worker {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    policies: QueuePolicies,
    limiters: HashMap<JobKind, RateLimiter>,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        handler: Arc<dyn JobHandler>,
        policies: QueuePolicies,
    ) -> Self {
        let limiters = JobKind::ALL
            .into_iter()
            .filter_map(|kind| {
                policies
                    .for_kind(kind)
                    .rate_limit
                    .map(|limit| (kind, RateLimiter::new(limit)))
            })
            .collect();

        Self {
            queue,
            handler,
            policies,
            limiters,
        }
    }

    /// Claim and process at most one job of `kind`
    ///
    /// A rate-limit slot is only spent once a job was actually claimed.
    pub fn run_once(&self, kind: JobKind) -> Result<WorkerOutcome> {
        let limiter = self.limiters.get(&kind);
        if let Some(limiter) = limiter
            && let Err(wait) = limiter.check()
        {
            return Ok(WorkerOutcome::Throttled(wait));
        }

        let policy = self.policies.for_kind(kind);
        let Some(claimed) = self.queue.claim(kind, policy.timeout())? else {
            return Ok(WorkerOutcome::Idle);
        };

        // Another thread may have taken the last slot since the check
        if let Some(limiter) = limiter
            && let Err(wait) = limiter.try_acquire()
        {
            self.queue.release(claimed.id, Utc::now() + chrono_duration(wait))?;
            return Ok(WorkerOutcome::Throttled(wait));
        }

        // A job past its budget here kept losing its lease without reporting
        if claimed.attempt > policy.max_attempts {
            let err = anyhow::anyhow!(
                "{} job {} timed out {} times",
                kind,
                claimed.id,
                claimed.attempt - 1
            );
            return self.bury(&claimed, err);
        }

        log::debug!(
            "[QUEUE] Running {} job {} (attempt {}/{})",
            kind,
            claimed.id,
            claimed.attempt,
            policy.max_attempts
        );

        match self.handler.handle(&claimed.job) {
            Ok(()) => {
                self.queue.ack(claimed.id)?;
                Ok(WorkerOutcome::Completed)
            }
            Err(e) if error::is_retryable(&e) && claimed.attempt < policy.max_attempts => {
                let delay = policy.backoff(claimed.attempt) + Duration::from_millis(jitter_ms());
                log::warn!(
                    "[QUEUE] {} job {} failed (attempt {}/{}): {:#}. Retrying in {:?}",
                    kind,
                    claimed.id,
                    claimed.attempt,
                    policy.max_attempts,
                    e,
                    delay
                );
                let run_at = Utc::now() + chrono_duration(delay);
                self.queue.retry(claimed.id, run_at, &format!("{:#}", e))?;
                Ok(WorkerOutcome::Retried)
            }
            Err(e) => self.bury(&claimed, e),
        }
    }

    fn bury(&self, claimed: &ClaimedJob, err: anyhow::Error) -> Result<WorkerOutcome> {
        log::error!(
            "[QUEUE] Burying {} job {} after {} attempt(s): {:#}",
            claimed.job.kind(),
            claimed.id,
            claimed.attempt,
            err
        );
        self.queue.bury(claimed.id, &format!("{:#}", err))?;
        if let Err(e) = self.handler.on_exhausted(&claimed.job, &err) {
            log::error!(
                "[QUEUE] Failure hook for job {} failed: {:#}",
                claimed.id,
                e
            );
        }
        Ok(WorkerOutcome::Buried)
    }
}

/// Worker threads for every job kind
pub struct WorkerPool {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `concurrency` threads per kind
    pub fn start(worker: Arc<Worker>) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();

        for kind in JobKind::ALL {
            let concurrency = worker.policies.for_kind(kind).concurrency;
            for n in 0..concurrency {
                let worker = worker.clone();
                let stop = stop.clone();
                let handle = std::thread::Builder::new()
                    .name(format!("{}-{}", kind.queue_name(), n))
                    .spawn(move || worker_loop(&worker, kind, &stop))
                    .with_context(|| format!("Failed to spawn {} worker", kind))?;
                handles.push(handle);
            }
        }

        log::info!("[QUEUE] Started {} worker threads", handles.len());
        Ok(Self { stop, handles })
    }

    /// Signal every thread to stop and wait for in-flight jobs to finish
    pub fn shutdown(self) {
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.handles {
            if handle.join().is_err() {
                log::error!("[QUEUE] A worker thread panicked");
            }
        }
        log::info!("[QUEUE] Worker pool stopped");
    }
}

fn worker_loop(worker: &Worker, kind: JobKind, stop: &AtomicBool) {
    while !stop.load(Ordering::SeqCst) {
        match worker.run_once(kind) {
            Ok(WorkerOutcome::Idle) => std::thread::sleep(POLL_INTERVAL),
            Ok(WorkerOutcome::Throttled(wait)) => std::thread::sleep(wait.min(POLL_INTERVAL)),
            Ok(_) => {}
            Err(e) => {
                log::error!("[QUEUE] {} worker error: {:#}", kind, e);
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero())
}

/// Random jitter (0-250ms) so retries of a burst spread out
fn jitter_ms() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    RandomState::new().build_hasher().finish() % 250
}

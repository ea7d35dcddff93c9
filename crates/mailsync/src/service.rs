//! SyncService facade
//!
//! Wires the durable store, the job queues, the Gmail client and the worker
//! runtime together. Embedders create one service, call
//! [`SyncService::request_sync`] whenever a user should be brought up to
//! date, and keep a [`WorkerPool`] running.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::{GmailCredentials, SyncConfig};
use crate::gmail::{FileCredentialStore, GmailAuth, GmailMailboxProvider, MailboxProvider};
use crate::models::UserId;
use crate::queue::{Dispatcher, JobKind, JobQueue, QueueStats, SqliteJobQueue, Worker, WorkerPool};
use crate::storage::{MirrorStore, SqliteMirrorStore};
use crate::sync::{
    DispatchOutcome, SyncContext, SyncJobHandler, SyncStatusReport, coordinate, sync_status,
};

const MIRROR_DB: &str = "mirror.db";
const QUEUE_DB: &str = "jobs.db";

/// Entry point for embedding the sync engine
pub struct SyncService {
    ctx: Arc<SyncContext>,
    queue: Arc<dyn JobQueue>,
}

impl SyncService {
    /// Open (or create) the mirror and queue databases under `data_dir`
    ///
    /// Tokens are read from the shared config directory.
    pub fn open(
        data_dir: &Path,
        config: SyncConfig,
        credentials: GmailCredentials,
    ) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let store = SqliteMirrorStore::new(data_dir.join(MIRROR_DB))
            .context("Failed to open mirror database")?;
        let queue = SqliteJobQueue::new(data_dir.join(QUEUE_DB))
            .context("Failed to open job queue")?;
        let tokens = FileCredentialStore::in_config_dir()?;
        let auth = Arc::new(GmailAuth::new(credentials, Arc::new(tokens)));

        Ok(Self::from_parts(
            Arc::new(store),
            Arc::new(queue),
            Arc::new(GmailMailboxProvider::new(auth)),
            config,
        ))
    }

    /// Assemble a service from existing parts
    pub fn from_parts(
        store: Arc<dyn MirrorStore>,
        queue: Arc<dyn JobQueue>,
        mailboxes: Arc<dyn MailboxProvider>,
        config: SyncConfig,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(queue.clone()));
        let ctx = Arc::new(SyncContext::new(store, mailboxes, dispatcher, config));
        Self { ctx, queue }
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    /// Enqueue whatever sync the user needs next
    pub fn request_sync(&self, user_id: &UserId) -> Result<DispatchOutcome> {
        coordinate(&self.ctx, user_id)
    }

    pub fn status(&self, user_id: &UserId) -> Result<SyncStatusReport> {
        sync_status(&self.ctx, user_id)
    }

    pub fn queue_stats(&self, kind: JobKind) -> Result<QueueStats> {
        self.queue.stats(kind)
    }

    /// A worker applying the configured queue policies
    pub fn worker(&self) -> Worker {
        Worker::new(
            self.queue.clone(),
            Arc::new(SyncJobHandler::new(self.ctx.clone())),
            self.ctx.config.queues.clone(),
        )
    }

    /// Start background workers for every job kind
    pub fn start_workers(&self) -> Result<WorkerPool> {
        WorkerPool::start(Arc::new(self.worker()))
    }
}

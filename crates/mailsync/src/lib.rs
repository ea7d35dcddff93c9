//! Mailsync - keeps a local mirror of a remote mailbox consistent
//!
//! This crate provides:
//! - Domain models (messages, labels, sync state and progress rows)
//! - A Gmail client behind the `RemoteMailbox` boundary
//! - SQLite and in-memory mirror stores
//! - Durable per-kind job queues and a worker runtime
//! - Resumable, replay-safe sync engines and their coordinator
//!
//! Work is delivered at least once. Every engine writes through idempotent
//! upserts or set operations and keeps its cross-call state in the store, so
//! any job can be retried after a crash.

pub mod config;
pub mod error;
pub mod gmail;
pub mod models;
pub mod queue;
pub mod service;
pub mod storage;
pub mod sync;

pub use config::{GmailCredentials, QueuePolicy, RateLimit, SyncConfig};
pub use error::SyncError;
pub use gmail::{GmailAuth, GmailClient, MailboxProvider, RemoteMailbox};
pub use models::{
    Label, LabelId, Message, MessageId, MessageStub, SyncKind, SyncProgress, SyncStatus, ThreadId,
    UserId, UserSyncState,
};
pub use queue::{
    Dispatcher, InMemoryJobQueue, Job, JobDispatcher, JobId, JobKind, JobQueue, SqliteJobQueue,
    Worker, WorkerOutcome, WorkerPool,
};
pub use service::SyncService;
pub use storage::{InMemoryMirrorStore, MirrorStore, SqliteMirrorStore};
pub use sync::{
    // Coordination
    DispatchOutcome, SkipReason, SyncRequirements, SyncStatusReport, coordinate,
    sync_requirements, sync_status,
    // Engines
    SyncContext, SyncJobHandler, run_detail_batch, run_incremental_sync, run_initial_sync,
    run_label_sync,
};

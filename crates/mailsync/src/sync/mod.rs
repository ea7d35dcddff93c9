//! Sync engines and their coordination
//!
//! Every engine is a plain function of `(ctx, user_id)` or a job payload plus
//! store state, so any job can be replayed after a crash. Cross-call state
//! lives only in the progress rows and [`UserSyncState`](crate::models::UserSyncState).

mod coordinator;
mod detail;
mod handler;
mod incremental;
mod initial;
mod labels;
mod progress;
mod timing;

use std::sync::Arc;

use crate::config::SyncConfig;
use crate::gmail::MailboxProvider;
use crate::queue::JobDispatcher;
use crate::storage::MirrorStore;

pub use coordinator::{
    DispatchOutcome, KindStatus, SkipReason, SyncRequirements, SyncStatusReport, coordinate,
    sync_requirements, sync_status,
};
pub use detail::{DetailBatchOutcome, run_detail_batch};
pub use handler::SyncJobHandler;
pub use incremental::{
    HistoryBuckets, HistoryWindow, IncrementalSyncOutcome, LabelDelta, run_incremental_sync,
};
pub use initial::{InitialSyncOutcome, run_initial_sync};
pub use labels::{LabelSyncOutcome, run_label_sync};
pub use progress::ProgressTracker;
pub use timing::{batches_for, cooldown_remaining};

/// Collaborators shared by every engine
pub struct SyncContext {
    pub store: Arc<dyn MirrorStore>,
    pub mailboxes: Arc<dyn MailboxProvider>,
    pub dispatcher: Arc<dyn JobDispatcher>,
    pub config: SyncConfig,
}

impl SyncContext {
    pub fn new(
        store: Arc<dyn MirrorStore>,
        mailboxes: Arc<dyn MailboxProvider>,
        dispatcher: Arc<dyn JobDispatcher>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            mailboxes,
            dispatcher,
            config,
        }
    }
}

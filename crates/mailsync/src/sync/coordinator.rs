//! Sync coordinator: decide which sync a user needs and enqueue it
//!
//! The coordinator never runs sync logic itself. It reads the user's state,
//! picks at most one kind (labels, then initial, then incremental) and hands
//! a job to the dispatcher.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;

use super::{SyncContext, cooldown_remaining};
use crate::models::{SyncKind, SyncProgress, UserId, UserSyncState};
use crate::queue::{Job, JobId};

/// What a user's state allows or requires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRequirements {
    pub needs_label_sync: bool,
    pub needs_initial_sync: bool,
    pub can_incremental_sync: bool,
}

/// Derive requirements from a user's state; an unknown user needs everything
pub fn sync_requirements(state: Option<&UserSyncState>) -> SyncRequirements {
    match state {
        None => SyncRequirements {
            needs_label_sync: true,
            needs_initial_sync: true,
            can_incremental_sync: false,
        },
        Some(state) => SyncRequirements {
            needs_label_sync: !state.label_sync_completed,
            needs_initial_sync: !state.initial_sync_completed,
            can_incremental_sync: state.can_incremental_sync(),
        },
    }
}

/// Why coordination enqueued nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A run or queued job of this kind has not finished yet
    AlreadyRunning(SyncKind),
    /// The last incremental sync was too recent; retry after the duration
    Cooldown(Duration),
    /// No sync is needed or possible
    NothingToDo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Dispatched { kind: SyncKind, job_id: JobId },
    Skipped(SkipReason),
}

/// Enqueue the one sync `user_id` needs next, if any
///
/// A dispatch failure propagates with nothing written.
pub fn coordinate(ctx: &SyncContext, user_id: &UserId) -> Result<DispatchOutcome> {
    let state = ctx.store.get_user_state(user_id)?;
    let requirements = sync_requirements(state.as_ref());

    let kind = if requirements.needs_label_sync {
        SyncKind::Labels
    } else if requirements.needs_initial_sync {
        SyncKind::Initial
    } else if requirements.can_incremental_sync {
        let last = state.as_ref().and_then(|s| s.last_incremental_sync_at);
        if let Some(wait) =
            cooldown_remaining(last, ctx.config.incremental_cooldown_secs, Utc::now())
        {
            log::debug!("[SYNC] Incremental sync for {} cooling down for {:?}", user_id, wait);
            return Ok(DispatchOutcome::Skipped(SkipReason::Cooldown(wait)));
        }
        SyncKind::Incremental
    } else {
        log::debug!("[SYNC] Nothing to sync for {}", user_id);
        return Ok(DispatchOutcome::Skipped(SkipReason::NothingToDo));
    };

    if let Some(active) = ctx.store.active_progress(user_id, kind)? {
        log::debug!(
            "[SYNC] {} run {} for {} still {}",
            kind,
            active.id,
            user_id,
            active.status.as_str()
        );
        return Ok(DispatchOutcome::Skipped(SkipReason::AlreadyRunning(kind)));
    }

    // A job still waiting in the queue has no progress row yet
    let Some(job_id) = ctx
        .dispatcher
        .dispatch_unique(Job::sync(kind, user_id.clone()))?
    else {
        log::debug!("[SYNC] {} sync for {} is already queued", kind, user_id);
        return Ok(DispatchOutcome::Skipped(SkipReason::AlreadyRunning(kind)));
    };
    log::info!("[SYNC] Dispatched {} sync for {} as job {}", kind, user_id, job_id);
    Ok(DispatchOutcome::Dispatched { kind, job_id })
}

/// Active and most recent run of one kind
#[derive(Debug, Clone, PartialEq)]
pub struct KindStatus {
    pub kind: SyncKind,
    pub active: Option<SyncProgress>,
    pub latest: Option<SyncProgress>,
}

/// Everything a status surface needs about one user
#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatusReport {
    pub user_id: UserId,
    pub state: Option<UserSyncState>,
    pub requirements: SyncRequirements,
    pub runs: Vec<KindStatus>,
}

impl SyncStatusReport {
    /// True while any kind has an unfinished run
    pub fn is_syncing(&self) -> bool {
        self.runs.iter().any(|r| r.active.is_some())
    }
}

pub fn sync_status(ctx: &SyncContext, user_id: &UserId) -> Result<SyncStatusReport> {
    let state = ctx.store.get_user_state(user_id)?;
    let requirements = sync_requirements(state.as_ref());

    let mut runs = Vec::with_capacity(SyncKind::ALL.len());
    for kind in SyncKind::ALL {
        runs.push(KindStatus {
            kind,
            active: ctx.store.active_progress(user_id, kind)?,
            latest: ctx.store.latest_progress(user_id, kind)?,
        });
    }

    Ok(SyncStatusReport {
        user_id: user_id.clone(),
        state,
        requirements,
        runs,
    })
}

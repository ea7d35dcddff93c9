//! Durable checkpoint for one (user, sync kind) run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::UserId;

/// Page cursor value recorded once paging has ended
pub const CURSOR_FINISHED: &str = "finished";

/// Category of reconciliation work, each with its own progress rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncKind {
    Initial,
    Incremental,
    Labels,
}

impl SyncKind {
    pub const ALL: [SyncKind; 3] = [SyncKind::Initial, SyncKind::Incremental, SyncKind::Labels];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Incremental => "incremental",
            Self::Labels => "labels",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initial" => Some(Self::Initial),
            "incremental" => Some(Self::Incremental),
            "labels" => Some(Self::Labels),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Error raised on an illegal lifecycle transition
#[derive(Debug, thiserror::Error)]
#[error("progress row {id} cannot move from {from} to {to}")]
pub struct TransitionError {
    pub id: i64,
    pub from: &'static str,
    pub to: &'static str,
}

/// Progress of one sync run
///
/// Lifecycle: `pending` at run start, `in_progress` once remote work is
/// underway, then exactly one terminal transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncProgress {
    /// Store-assigned row id (0 until persisted)
    pub id: i64,
    pub user_id: UserId,
    pub kind: SyncKind,
    /// Page token of the next page to fetch, or [`CURSOR_FINISHED`]
    pub cursor: Option<String>,
    /// Mailbox history id captured when an initial run started
    pub history_cursor: Option<String>,
    pub num_processed: u64,
    pub num_total: u64,
    pub batches_completed: u64,
    pub batches_total: u64,
    pub status: SyncStatus,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncProgress {
    /// A fresh `pending` row
    pub fn new(user_id: UserId, kind: SyncKind) -> Self {
        Self {
            id: 0,
            user_id,
            kind,
            cursor: None,
            history_cursor: None,
            num_processed: 0,
            num_total: 0,
            batches_completed: 0,
            batches_total: 0,
            status: SyncStatus::Pending,
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// True once the page loop has recorded its end
    pub fn paging_finished(&self) -> bool {
        self.cursor.as_deref() == Some(CURSOR_FINISHED)
    }

    /// Move to `in_progress`
    pub fn start(&mut self) -> Result<(), TransitionError> {
        match self.status {
            SyncStatus::Pending | SyncStatus::InProgress => {
                self.status = SyncStatus::InProgress;
                Ok(())
            }
            _ => Err(self.transition_error(SyncStatus::InProgress)),
        }
    }

    /// Terminal success; sets `completed_at`
    pub fn complete(&mut self) -> Result<(), TransitionError> {
        self.finish(SyncStatus::Completed, None)
    }

    /// Terminal failure with a message; sets `completed_at`
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        self.finish(SyncStatus::Failed, Some(message.into()))
    }

    /// Record finished work; the counter only moves forward
    pub fn record_processed(&mut self, processed: u64) {
        self.num_processed = self.num_processed.saturating_add(processed);
    }

    /// Completion ratio in [0, 1], if a total is known
    pub fn fraction(&self) -> Option<f64> {
        if self.num_total == 0 {
            return None;
        }
        Some((self.num_processed as f64 / self.num_total as f64).min(1.0))
    }

    fn finish(&mut self, to: SyncStatus, message: Option<String>) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(self.transition_error(to));
        }
        self.status = to;
        self.error_message = message;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    fn transition_error(&self, to: SyncStatus) -> TransitionError {
        TransitionError {
            id: self.id,
            from: self.status.as_str(),
            to: to.as_str(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress() -> SyncProgress {
        SyncProgress::new(UserId::new("u1"), SyncKind::Initial)
    }

    #[test]
    fn test_lifecycle() {
        let mut p = progress();
        assert_eq!(p.status, SyncStatus::Pending);
        assert!(p.is_active());

        p.start().unwrap();
        assert_eq!(p.status, SyncStatus::InProgress);
        assert!(p.completed_at.is_none());

        p.complete().unwrap();
        assert_eq!(p.status, SyncStatus::Completed);
        assert!(p.completed_at.is_some());
        assert!(!p.is_active());
    }

    #[test]
    fn test_completed_at_set_once() {
        let mut p = progress();
        p.complete().unwrap();
        let first = p.completed_at;

        assert!(p.complete().is_err());
        assert!(p.fail("late").is_err());
        assert_eq!(p.completed_at, first);
        assert_eq!(p.status, SyncStatus::Completed);
        assert!(p.error_message.is_none());
    }

    #[test]
    fn test_fail_records_message() {
        let mut p = progress();
        p.start().unwrap();
        p.fail("remote unavailable").unwrap();
        assert_eq!(p.status, SyncStatus::Failed);
        assert_eq!(p.error_message.as_deref(), Some("remote unavailable"));
        assert!(p.start().is_err());
    }

    #[test]
    fn test_fraction() {
        let mut p = progress();
        assert_eq!(p.fraction(), None);
        p.num_total = 4;
        p.record_processed(1);
        assert_eq!(p.fraction(), Some(0.25));
        p.record_processed(10);
        assert_eq!(p.fraction(), Some(1.0));
    }

    #[test]
    fn test_kind_and_status_parse() {
        for kind in SyncKind::ALL {
            assert_eq!(SyncKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(SyncStatus::parse("in_progress"), Some(SyncStatus::InProgress));
        assert_eq!(SyncStatus::parse("bogus"), None);
    }
}

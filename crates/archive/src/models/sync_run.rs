//! Persisted record of one backup run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a sync run, assigned by the repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyncRunId(pub i64);

impl std::fmt::Display for SyncRunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Running => "running",
            SyncStatus::Succeeded => "succeeded",
            SyncStatus::Failed => "failed",
            SyncStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SyncStatus::Pending),
            "running" => Some(SyncStatus::Running),
            "succeeded" => Some(SyncStatus::Succeeded),
            "failed" => Some(SyncStatus::Failed),
            "cancelled" => Some(SyncStatus::Cancelled),
            _ => None,
        }
    }

    /// Whether the run has stopped for good or until resumed
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            SyncStatus::Succeeded | SyncStatus::Failed | SyncStatus::Cancelled
        )
    }

    /// Whether `resume` may pick the run up again
    pub fn is_resumable(&self) -> bool {
        matches!(self, SyncStatus::Failed | SyncStatus::Cancelled)
    }
}

/// Counters accumulated while a run ingests threads
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncStats {
    /// Provider list pages fully ingested
    pub pages_completed: usize,
    /// Threads upserted into the repository
    pub threads_synced: usize,
    /// Messages upserted into the repository
    pub messages_synced: usize,
    /// Attachment payloads fetched and written
    pub attachments_stored: usize,
    /// Attachments already present (write-once) and not refetched
    pub attachments_skipped: usize,
    /// Attachments whose payload length differed from the announced size
    pub size_mismatches: usize,
}

/// One backup run of an owner's mailbox under a search query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: SyncRunId,
    pub owner: String,
    /// Provider search expression; empty means all mail
    pub query: String,
    pub status: SyncStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Token of the next provider page to fetch; `None` before the first
    /// page completes and after the last one
    pub page_token: Option<String>,
    pub stats: SyncStats,
    /// Failure reason of a Failed run
    pub error: Option<String>,
}

impl SyncRun {
    /// A freshly triggered run, not yet persisted (id 0)
    pub fn pending(owner: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            id: SyncRunId(0),
            owner: owner.into(),
            query: query.into(),
            status: SyncStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            page_token: None,
            stats: SyncStats::default(),
            error: None,
        }
    }

    /// Back to Pending for a resume; the checkpoint is kept
    pub fn reopen(&mut self) {
        self.status = SyncStatus::Pending;
        self.finished_at = None;
        self.error = None;
    }

    pub fn mark_running(&mut self) {
        self.status = SyncStatus::Running;
        self.finished_at = None;
        self.error = None;
    }

    pub fn mark_succeeded(&mut self) {
        self.status = SyncStatus::Succeeded;
        self.page_token = None;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = SyncStatus::Failed;
        self.error = Some(error.into());
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_cancelled(&mut self) {
        self.status = SyncStatus::Cancelled;
        self.finished_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_run() {
        let run = SyncRun::pending("user@example.com", "has:attachment");
        assert_eq!(run.status, SyncStatus::Pending);
        assert_eq!(run.query, "has:attachment");
        assert!(run.finished_at.is_none());
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut run = SyncRun::pending("user@example.com", "");
        run.mark_running();
        assert_eq!(run.status, SyncStatus::Running);
        assert!(!run.status.is_finished());

        run.page_token = Some("p2".to_string());
        run.mark_failed("rate limited");
        assert!(run.status.is_resumable());
        assert_eq!(run.page_token.as_deref(), Some("p2"));

        run.mark_running();
        assert!(run.error.is_none());
        run.mark_succeeded();
        assert!(run.status.is_finished());
        assert!(!run.status.is_resumable());
        assert!(run.page_token.is_none());
    }

    #[test]
    fn test_reopen_keeps_checkpoint() {
        let mut run = SyncRun::pending("user@example.com", "");
        run.page_token = Some("p3".to_string());
        run.mark_cancelled();

        run.reopen();
        assert_eq!(run.status, SyncStatus::Pending);
        assert!(run.finished_at.is_none());
        assert_eq!(run.page_token.as_deref(), Some("p3"));
    }

    #[test]
    fn test_stats_without_newer_counters_parse() {
        let stats: SyncStats = serde_json::from_str(
            r#"{"pages_completed":2,"threads_synced":5,"messages_synced":9,
                "attachments_stored":1,"attachments_skipped":0}"#,
        )
        .unwrap();
        assert_eq!(stats.pages_completed, 2);
        assert_eq!(stats.size_mismatches, 0);
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            SyncStatus::Pending,
            SyncStatus::Running,
            SyncStatus::Succeeded,
            SyncStatus::Failed,
            SyncStatus::Cancelled,
        ] {
            assert_eq!(SyncStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_serialization() {
        let run = SyncRun::pending("user@example.com", "label:work");
        let json = serde_json::to_string(&run).unwrap();
        let deserialized: SyncRun = serde_json::from_str(&json).unwrap();
        assert_eq!(run, deserialized);
    }
}

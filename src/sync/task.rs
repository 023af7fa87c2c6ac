//! Sync task bookkeeping.
//!
//! A [`SyncTask`] is the ephemeral record of one sync pass.  The engine
//! updates it as entries complete; status snapshots derive progress,
//! throughput, and ETA from it without touching the engine.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// One entry that could not be synced, with its classified error.
#[derive(Debug, Clone, Serialize)]
pub struct FailureDetail {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SyncCounts {
    /// Remote entries seen by the listing.
    pub total: u64,
    pub added: u64,
    pub updated: u64,
    pub deleted: u64,
    pub unchanged: u64,
    pub failed: u64,
}

impl SyncCounts {
    /// Entries actually transferred this pass.
    pub fn synced(&self) -> u64 {
        self.added + self.updated
    }
}

static TASK_SEQ: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Serialize)]
pub struct SyncTask {
    pub id: String,
    pub source_name: String,
    pub status: TaskStatus,
    pub counts: SyncCounts,
    pub bytes_transferred: u64,
    /// Entry currently (or most recently) being fetched.
    pub current_path: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub failures: Vec<FailureDetail>,
}

impl SyncTask {
    pub fn new(source_name: &str) -> Self {
        let now = Utc::now();
        let seq = TASK_SEQ.fetch_add(1, Ordering::Relaxed);
        Self {
            id: format!("{source_name}-{}-{seq}", now.timestamp()),
            source_name: source_name.to_string(),
            status: TaskStatus::Pending,
            counts: SyncCounts::default(),
            bytes_transferred: 0,
            current_path: None,
            started_at: now,
            updated_at: now,
            finished_at: None,
            error: None,
            failures: Vec::new(),
        }
    }

    pub fn mark_running(&mut self) {
        self.status = TaskStatus::Running;
        self.touch();
    }

    pub fn mark_completed(&mut self) {
        self.status = TaskStatus::Completed;
        self.finish();
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = TaskStatus::Failed;
        self.error = Some(error);
        self.finish();
    }

    pub fn mark_cancelled(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.finish();
    }

    pub fn record_failure(&mut self, path: &str, error: String) {
        self.counts.failed += 1;
        self.failures.push(FailureDetail {
            path: path.to_string(),
            error,
        });
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn finish(&mut self) {
        let now = Utc::now();
        self.updated_at = now;
        self.finished_at = Some(now);
    }

    pub fn duration_secs(&self) -> f64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as f64 / 1000.0
    }

    /// Fraction of classified work completed, in percent.
    pub fn progress_percent(&self) -> f64 {
        if self.counts.total == 0 {
            return 0.0;
        }
        let done = self.counts.synced() + self.counts.unchanged + self.counts.failed;
        (done as f64 / self.counts.total as f64 * 100.0).min(100.0)
    }

    /// Average transfer rate over the task so far.
    pub fn throughput_bytes_per_sec(&self) -> f64 {
        let secs = self.duration_secs();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes_transferred as f64 / secs
    }

    /// Rough remaining time, from entries completed versus pending.
    pub fn eta_secs(&self) -> Option<f64> {
        if self.status != TaskStatus::Running {
            return None;
        }
        let done = self.counts.synced() + self.counts.unchanged + self.counts.failed;
        if done == 0 || self.counts.total <= done {
            return None;
        }
        let secs = self.duration_secs();
        let per_entry = secs / done as f64;
        Some(per_entry * (self.counts.total - done) as f64)
    }
}

/// Compact record of a completed pass, kept in the per-source history ring.
#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub task_id: String,
    pub status: TaskStatus,
    pub counts: SyncCounts,
    pub bytes_transferred: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl From<&SyncTask> for PassSummary {
    fn from(task: &SyncTask) -> Self {
        Self {
            task_id: task.id.clone(),
            status: task.status,
            counts: task.counts,
            bytes_transferred: task.bytes_transferred,
            started_at: task.started_at,
            finished_at: task.finished_at,
            error: task.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_reconcile() {
        let mut task = SyncTask::new("ubuntu");
        task.counts.total = 100;
        task.counts.unchanged = 10;
        task.counts.added = 85;
        task.counts.updated = 5;
        assert_eq!(task.counts.synced(), 90);
        assert_eq!(
            task.counts.synced() + task.counts.unchanged,
            task.counts.total
        );
        assert!((task.progress_percent() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn task_ids_are_unique() {
        let a = SyncTask::new("s");
        let b = SyncTask::new("s");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn eta_only_while_running_with_progress() {
        let mut task = SyncTask::new("s");
        assert_eq!(task.eta_secs(), None);
        task.mark_running();
        task.counts.total = 10;
        assert_eq!(task.eta_secs(), None);
        task.counts.added = 5;
        assert!(task.eta_secs().is_some());
        task.mark_completed();
        assert_eq!(task.eta_secs(), None);
    }
}

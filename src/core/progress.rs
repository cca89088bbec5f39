//! In-memory tracking of jobs.
//!
//! Every job started through the orchestrator has an entry here from the
//! moment its handle is returned until the caller acknowledges it. Entries
//! are updated on every progress tick but never persisted; only status
//! transitions go to the database.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;

use super::error::OrchestratorError;
use super::models::{BackupState, FileStatus, JobKind, JobOutcome, JobStatus, TransferJob};

/// Progress reported by the transfer engine at file boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TransferStatus {
    /// Sizes measured, nothing copied yet
    Ready { job: TransferJob },
    InProgress {
        bytes_total: u64,
        bytes_transferred: u64,
        current_file: String,
        file_index: usize,
        file_count: usize,
        percentage: u8,
    },
    FileFinished {
        file_index: usize,
        file: String,
        status: FileStatus,
        bytes_transferred: u64,
    },
    /// Final snapshot, sent once after the last file
    Done { job: TransferJob },
}

/// Anything a running job reports before its terminal event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobUpdate {
    Transfer(TransferStatus),
    Step(BackupState),
}

impl From<TransferStatus> for JobUpdate {
    fn from(status: TransferStatus) -> Self {
        Self::Transfer(status)
    }
}

impl From<BackupState> for JobUpdate {
    fn from(state: BackupState) -> Self {
        Self::Step(state)
    }
}

/// What a job's work gets to see of the job running it.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub device_id: String,
    pub cancel: CancellationToken,
    pub updates: mpsc::Sender<JobUpdate>,
}

impl JobContext {
    pub async fn step(&self, state: BackupState) {
        let _ = self.updates.send(state.into()).await;
    }

    pub fn check_cancelled(&self) -> Result<(), OrchestratorError> {
        if self.cancel.is_cancelled() {
            Err(OrchestratorError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub job_id: String,
    pub device_id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Mirror of the engine's job, including per-file status
    pub transfer: Option<TransferJob>,
    pub backup_step: Option<BackupState>,
    pub outcome: Option<JobOutcome>,
    pub error: Option<OrchestratorError>,
}

impl JobProgress {
    pub fn new(job_id: &str, device_id: &str, kind: JobKind) -> Self {
        Self {
            job_id: job_id.to_string(),
            device_id: device_id.to_string(),
            kind,
            status: JobStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            transfer: None,
            backup_step: None,
            outcome: None,
            error: None,
        }
    }

    /// Fold one update into the entry.
    pub fn apply(&mut self, update: &JobUpdate) {
        match update {
            JobUpdate::Step(state) => self.backup_step = Some(*state),
            JobUpdate::Transfer(TransferStatus::Ready { job } | TransferStatus::Done { job }) => {
                self.transfer = Some(job.clone())
            }
            JobUpdate::Transfer(TransferStatus::InProgress {
                bytes_transferred,
                file_index,
                ..
            }) => {
                if let Some(job) = self.transfer.as_mut() {
                    job.bytes_transferred = *bytes_transferred;
                    if let Some(file) = job.files.get_mut(*file_index) {
                        file.status = FileStatus::InProgress;
                    }
                }
            }
            JobUpdate::Transfer(TransferStatus::FileFinished {
                file_index,
                status,
                bytes_transferred,
                ..
            }) => {
                if let Some(job) = self.transfer.as_mut() {
                    job.bytes_transferred = *bytes_transferred;
                    if let Some(file) = job.files.get_mut(*file_index) {
                        file.status = status.clone();
                    }
                }
            }
        }
    }

    /// Record the terminal result.
    pub fn finish(&mut self, result: &Result<JobOutcome, OrchestratorError>) {
        self.finished_at = Some(Utc::now());
        match result {
            Ok(outcome) => {
                self.status = match outcome {
                    JobOutcome::Transfer(job) => job.status,
                    _ => JobStatus::Completed,
                };
                if let JobOutcome::Transfer(job) = outcome {
                    self.transfer = Some(job.clone());
                }
                self.outcome = Some(outcome.clone());
            }
            Err(e) => {
                self.status = e.terminal_status();
                self.error = Some(e.clone());
            }
        }
    }
}

#[derive(Default)]
struct TrackerState {
    jobs: HashMap<String, JobProgress>,
    cancels: HashMap<String, CancellationToken>,
}

/// Shared store of job progress, keyed by job id.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    inner: Arc<RwLock<TrackerState>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, progress: JobProgress, cancel: CancellationToken) {
        let mut state = self.inner.write().await;
        state.cancels.insert(progress.job_id.clone(), cancel);
        state.jobs.insert(progress.job_id.clone(), progress);
    }

    pub async fn set_status(&self, job_id: &str, status: JobStatus) {
        let mut state = self.inner.write().await;
        if let Some(job) = state.jobs.get_mut(job_id) {
            job.status = status;
        }
    }

    pub async fn apply(&self, job_id: &str, update: &JobUpdate) {
        let mut state = self.inner.write().await;
        if let Some(job) = state.jobs.get_mut(job_id) {
            job.apply(update);
        }
    }

    /// Record the terminal result; the entry stays until acknowledged.
    pub async fn finish(&self, job_id: &str, result: &Result<JobOutcome, OrchestratorError>) {
        let mut state = self.inner.write().await;
        state.cancels.remove(job_id);
        if let Some(job) = state.jobs.get_mut(job_id) {
            job.finish(result);
        }
    }

    pub async fn get(&self, job_id: &str) -> Option<JobProgress> {
        let state = self.inner.read().await;
        state.jobs.get(job_id).cloned()
    }

    /// Request cooperative cancellation. Returns false if the job is unknown
    /// or already finished.
    pub async fn cancel(&self, job_id: &str) -> bool {
        let state = self.inner.read().await;
        match state.cancels.get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove a finished job. Running jobs are left alone and `None` is
    /// returned for them.
    pub async fn acknowledge(&self, job_id: &str) -> Option<JobProgress> {
        let mut state = self.inner.write().await;
        if !state.jobs.get(job_id)?.status.is_terminal() {
            return None;
        }
        state.jobs.remove(job_id)
    }

    /// All tracked jobs, sorted oldest first.
    pub async fn get_all(&self) -> Vec<JobProgress> {
        let state = self.inner.read().await;
        let mut jobs: Vec<_> = state.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.job_id.cmp(&b.job_id)));
        jobs
    }

    /// Number of jobs that have not reached a terminal status.
    pub async fn active_count(&self) -> usize {
        let state = self.inner.read().await;
        state
            .jobs
            .values()
            .filter(|job| !job.status.is_terminal())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{FileEntry, TransferDirection};
    use std::path::PathBuf;

    fn transfer_job(files: usize) -> TransferJob {
        TransferJob {
            job_id: "job-1".to_string(),
            device_id: "dev".to_string(),
            direction: TransferDirection::Push,
            destination_root: "/sdcard/maps".to_string(),
            status: JobStatus::InProgress,
            files: (0..files)
                .map(|i| FileEntry {
                    local_path: PathBuf::from(format!("f{}.map", i)),
                    remote_path: format!("/sdcard/maps/f{}.map", i),
                    size_bytes: 100,
                    status: FileStatus::Pending,
                })
                .collect(),
            bytes_transferred: 0,
            bytes_total: files as u64 * 100,
        }
    }

    #[tokio::test]
    async fn test_progress_tracker_basic_operations() {
        let tracker = ProgressTracker::new();
        assert_eq!(tracker.active_count().await, 0);
        assert!(tracker.get("job-1").await.is_none());

        tracker
            .register(
                JobProgress::new("job-1", "dev", JobKind::Transfer),
                CancellationToken::new(),
            )
            .await;
        tracker.set_status("job-1", JobStatus::InProgress).await;
        assert_eq!(tracker.active_count().await, 1);

        tracker
            .apply(
                "job-1",
                &TransferStatus::Ready {
                    job: transfer_job(2),
                }
                .into(),
            )
            .await;
        tracker
            .apply(
                "job-1",
                &TransferStatus::FileFinished {
                    file_index: 0,
                    file: "f0.map".to_string(),
                    status: FileStatus::Completed,
                    bytes_transferred: 100,
                }
                .into(),
            )
            .await;

        let progress = tracker.get("job-1").await.unwrap();
        let job = progress.transfer.unwrap();
        assert_eq!(job.bytes_transferred, 100);
        assert_eq!(job.files[0].status, FileStatus::Completed);
        assert_eq!(job.files[1].status, FileStatus::Pending);
    }

    #[tokio::test]
    async fn test_acknowledge_only_removes_finished_jobs() {
        let tracker = ProgressTracker::new();
        tracker
            .register(
                JobProgress::new("job-1", "dev", JobKind::Backup),
                CancellationToken::new(),
            )
            .await;

        assert!(tracker.acknowledge("job-1").await.is_none());
        assert!(tracker.get("job-1").await.is_some());

        tracker.finish("job-1", &Ok(JobOutcome::Done)).await;
        assert_eq!(tracker.active_count().await, 0);

        let acked = tracker.acknowledge("job-1").await.unwrap();
        assert_eq!(acked.status, JobStatus::Completed);
        assert!(tracker.get("job-1").await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_fires_token_until_finished() {
        let tracker = ProgressTracker::new();
        let token = CancellationToken::new();
        tracker
            .register(JobProgress::new("job-1", "dev", JobKind::Transfer), token.clone())
            .await;

        assert!(tracker.cancel("job-1").await);
        assert!(token.is_cancelled());

        tracker
            .finish("job-1", &Err(OrchestratorError::Cancelled))
            .await;
        assert!(!tracker.cancel("job-1").await);
        assert_eq!(
            tracker.get("job-1").await.unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_progress_tracker_multiple_jobs() {
        let tracker = ProgressTracker::new();
        for (id, kind) in [
            ("job-1", JobKind::Transfer),
            ("job-2", JobKind::Screenshot),
            ("job-3", JobKind::Backup),
        ] {
            tracker
                .register(JobProgress::new(id, "dev", kind), CancellationToken::new())
                .await;
        }
        tracker
            .finish(
                "job-2",
                &Err(OrchestratorError::DeviceOffline {
                    device_id: "dev".to_string(),
                }),
            )
            .await;

        let all = tracker.get_all().await;
        assert_eq!(all.len(), 3);
        assert_eq!(tracker.active_count().await, 2);
        let failed = all.iter().find(|j| j.job_id == "job-2").unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
    }
}

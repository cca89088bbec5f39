//! Ordered multi-file copies between local storage and a device.
//!
//! A job measures every file up front so byte totals are exact before the
//! first copy, then moves files one at a time. A failed file is recorded
//! and the batch continues; the job only fails outright when the device
//! cannot be reached before the first file.

mod plan;

pub use plan::{plan_download, plan_upload};

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::bridge::{DeviceBridge, TimeoutClass, parse_stat, remote_parent, shell_quote};
use super::error::{ItemFailure, OrchestratorError};
use super::models::{FileEntry, FileStatus, FileTransfer, JobStatus, TransferDirection, TransferJob};
use super::progress::{JobUpdate, TransferStatus};
use crate::logging::LogThrottle;

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub job_id: String,
    pub device_id: String,
    pub direction: TransferDirection,
    pub files: Vec<FileTransfer>,
    /// Root the files land under, for reporting
    pub destination_root: String,
}

/// Why a single file did not make it across.
struct FileCopyError {
    message: String,
    is_device_gone: bool,
}

impl From<OrchestratorError> for FileCopyError {
    fn from(err: OrchestratorError) -> Self {
        Self {
            is_device_gone: err.is_device_gone(),
            message: err.to_string(),
        }
    }
}

pub struct TransferEngine {
    bridge: Arc<dyn DeviceBridge>,
}

impl TransferEngine {
    pub fn new(bridge: Arc<dyn DeviceBridge>) -> Self {
        Self { bridge }
    }

    /// Run a transfer to completion, reporting on `tx`.
    ///
    /// Returns `Err` only when the job could not start. Otherwise the
    /// returned job's status is `Completed`, `PartiallyFailed` or
    /// `Cancelled`, with per-file detail.
    pub async fn copy(
        &self,
        req: &TransferRequest,
        tx: mpsc::Sender<JobUpdate>,
        cancel: &CancellationToken,
    ) -> Result<TransferJob, OrchestratorError> {
        let span = info_span!(
            "transfer",
            job_id = %req.job_id,
            device_id = %req.device_id,
            direction = ?req.direction
        );

        async {
            self.bridge
                .run(Some(&req.device_id), &["get-state"], TimeoutClass::Short)
                .await?;

            let start_time = Instant::now();
            let (mut job, unmeasured) = self.measure(req).await;
            info!(
                files = job.files.len(),
                bytes_total = job.bytes_total,
                "Starting transfer"
            );
            let _ = tx.send(TransferStatus::Ready { job: job.clone() }.into()).await;

            let throttle = LogThrottle::new(Duration::from_millis(500));
            let mut created_dirs = HashSet::new();
            let mut device_gone: Option<String> = None;
            let file_count = job.files.len();

            for index in 0..file_count {
                if cancel.is_cancelled() {
                    for file in &mut job.files[index..] {
                        file.status = FileStatus::Skipped {
                            reason: "job cancelled".to_string(),
                        };
                    }
                    job.status = JobStatus::Cancelled;
                    info!(remaining = file_count - index, "Transfer cancelled");
                    break;
                }

                let name = job.files[index].display_name(req.direction);

                let status = if let Some(reason) = &device_gone {
                    FileStatus::Failed {
                        reason: reason.clone(),
                    }
                } else if let Some(reason) = &unmeasured[index] {
                    warn!(file = %name, error = %reason, "Source could not be measured");
                    FileStatus::Failed {
                        reason: reason.clone(),
                    }
                } else {
                    job.files[index].status = FileStatus::InProgress;
                    let _ = tx
                        .send(
                            TransferStatus::InProgress {
                                bytes_total: job.bytes_total,
                                bytes_transferred: job.bytes_transferred,
                                current_file: name.clone(),
                                file_index: index,
                                file_count,
                                percentage: job.percentage(),
                            }
                            .into(),
                        )
                        .await;

                    match self
                        .copy_one(req, &job.files[index], &mut created_dirs)
                        .await
                    {
                        Ok(bytes) => {
                            job.bytes_transferred += bytes;
                            FileStatus::Completed
                        }
                        Err(e) => {
                            warn!(file = %name, error = %e.message, "File transfer failed");
                            if e.is_device_gone {
                                device_gone = Some(e.message.clone());
                            }
                            FileStatus::Failed { reason: e.message }
                        }
                    }
                };

                job.files[index].status = status.clone();
                if let Some(suppressed) = throttle.admit() {
                    debug!(
                        file = %name,
                        suppressed,
                        index,
                        bytes_transferred = job.bytes_transferred,
                        bytes_total = job.bytes_total,
                        "Transfer progress"
                    );
                }
                let _ = tx
                    .send(
                        TransferStatus::FileFinished {
                            file_index: index,
                            file: name,
                            status,
                            bytes_transferred: job.bytes_transferred,
                        }
                        .into(),
                    )
                    .await;
            }

            if job.status != JobStatus::Cancelled {
                job.status = if job.files.iter().all(|f| f.status.is_completed()) {
                    JobStatus::Completed
                } else {
                    JobStatus::PartiallyFailed
                };
            }

            info!(
                status = %job.status,
                completed = job.completed_files(),
                files = file_count,
                bytes = job.bytes_transferred,
                duration_secs = start_time.elapsed().as_secs(),
                "Transfer finished"
            );
            let _ = tx.send(TransferStatus::Done { job: job.clone() }.into()).await;

            Ok(job)
        }
        .instrument(span)
        .await
    }

    /// Build the job with every file's size.
    ///
    /// The second vector holds, per file, why its source could not be
    /// measured. Those files count for nothing in `bytes_total` and fail
    /// without being copied.
    async fn measure(&self, req: &TransferRequest) -> (TransferJob, Vec<Option<String>>) {
        let mut files = Vec::with_capacity(req.files.len());
        let mut unmeasured = Vec::with_capacity(req.files.len());
        for file in &req.files {
            let size = match req.direction {
                TransferDirection::Push => local_file_size(&file.local_path).await,
                TransferDirection::Pull => self.remote_file_size(&req.device_id, &file.remote_path).await,
            };
            files.push(FileEntry {
                local_path: file.local_path.clone(),
                remote_path: file.remote_path.clone(),
                size_bytes: *size.as_ref().unwrap_or(&0),
                status: FileStatus::Pending,
            });
            unmeasured.push(size.err());
        }

        let job = TransferJob {
            job_id: req.job_id.clone(),
            device_id: req.device_id.clone(),
            direction: req.direction,
            destination_root: req.destination_root.clone(),
            status: JobStatus::InProgress,
            bytes_total: files.iter().map(|f| f.size_bytes).sum(),
            bytes_transferred: 0,
            files,
        };
        (job, unmeasured)
    }

    async fn remote_file_size(&self, device_id: &str, remote_path: &str) -> Result<u64, String> {
        let command = format!("stat -c '%s %Y' {}", shell_quote(remote_path));
        let output = self
            .bridge
            .shell(device_id, &command, TimeoutClass::Short)
            .await
            .map_err(|e| format!("cannot stat {}: {}", remote_path, OrchestratorError::from(e)))?;
        parse_stat(&output.stdout_text())
            .map(|(size, _)| size)
            .ok_or_else(|| format!("cannot stat {}: unexpected output", remote_path))
    }

    async fn copy_one(
        &self,
        req: &TransferRequest,
        file: &FileEntry,
        created_dirs: &mut HashSet<String>,
    ) -> Result<u64, FileCopyError> {
        let local = file.local_path.to_string_lossy().into_owned();

        match req.direction {
            TransferDirection::Push => {
                let metadata = tokio::fs::metadata(&file.local_path).await.map_err(|e| {
                    FileCopyError {
                        message: format!("cannot read {}: {}", local, e),
                        is_device_gone: false,
                    }
                })?;
                if !metadata.is_file() {
                    return Err(FileCopyError {
                        message: format!("{} is not a regular file", local),
                        is_device_gone: false,
                    });
                }

                if let Some(parent) = remote_parent(&file.remote_path) {
                    if created_dirs.insert(parent.to_string()) {
                        let command = format!("mkdir -p {}", shell_quote(parent));
                        if let Err(e) = self
                            .bridge
                            .shell(&req.device_id, &command, TimeoutClass::Short)
                            .await
                        {
                            created_dirs.remove(parent);
                            return Err(OrchestratorError::from(e).into());
                        }
                    }
                }

                self.bridge
                    .run(
                        Some(&req.device_id),
                        &["push", &local, &file.remote_path],
                        TimeoutClass::Long,
                    )
                    .await
                    .map_err(|e| FileCopyError::from(OrchestratorError::from(e)))?;

                Ok(metadata.len())
            }
            TransferDirection::Pull => {
                if let Some(parent) = file.local_path.parent() {
                    if !parent.as_os_str().is_empty() {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .map_err(|e| FileCopyError {
                                message: format!("cannot create {}: {}", parent.display(), e),
                                is_device_gone: false,
                            })?;
                    }
                }

                self.bridge
                    .run(
                        Some(&req.device_id),
                        &["pull", &file.remote_path, &local],
                        TimeoutClass::Long,
                    )
                    .await
                    .map_err(|e| FileCopyError::from(OrchestratorError::from(e)))?;

                Ok(file.size_bytes)
            }
        }
    }
}

/// Per-file failures of a finished job, keyed by the source path.
pub fn failed_items(job: &TransferJob) -> Vec<ItemFailure> {
    job.files
        .iter()
        .filter_map(|f| match &f.status {
            FileStatus::Failed { reason } | FileStatus::Skipped { reason } => Some(ItemFailure {
                item: f.display_name(job.direction),
                error: reason.clone(),
            }),
            _ => None,
        })
        .collect()
}

/// Terminal result of a user-requested transfer.
///
/// Anything short of `Completed` is an error.
pub fn transfer_outcome(job: TransferJob) -> Result<TransferJob, OrchestratorError> {
    match job.status {
        JobStatus::Completed => Ok(job),
        JobStatus::Cancelled => Err(OrchestratorError::Cancelled),
        JobStatus::PartiallyFailed => Err(OrchestratorError::PartialFailure {
            succeeded: job
                .files
                .iter()
                .filter(|f| f.status.is_completed())
                .map(|f| f.display_name(job.direction))
                .collect(),
            failed: failed_items(&job),
        }),
        status => Err(OrchestratorError::TransferFailed {
            status,
            files: failed_items(&job),
        }),
    }
}

async fn local_file_size(path: &Path) -> Result<u64, String> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    if !metadata.is_file() {
        return Err(format!("{} is not a regular file", path.display()));
    }
    Ok(metadata.len())
}

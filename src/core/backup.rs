//! Device backup lifecycle.
//!
//! One archive per device lives at the configured backup path. Creating,
//! downloading, uploading and deleting it are multi-step sequences; each
//! step is reported as a [`BackupState`] through the job's update channel.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::{Instrument, debug, info, info_span};

use super::bridge::{BridgeError, DeviceBridge, TimeoutClass, parse_stat, remote_parent, shell_quote};
use super::error::{ItemFailure, OrchestratorError};
use super::models::{
    BackupRecord, BackupState, FileTransfer, JobStatus, TransferDirection, timestamped_file_name,
};
use super::progress::JobContext;
use super::transfer_engine::{TransferEngine, TransferRequest, failed_items};
use super::verifier::verify_download;
use crate::config::DeviceLayout;

/// Keep device-gone and cancellation errors as they are; anything else
/// becomes a backup failure.
fn backup_error(err: impl Into<OrchestratorError>) -> OrchestratorError {
    let err = err.into();
    match err {
        OrchestratorError::Cancelled
        | OrchestratorError::DeviceUnauthorized { .. }
        | OrchestratorError::InvalidRequest { .. } => err,
        _ if err.is_device_gone() => err,
        _ => OrchestratorError::BackupFailed {
            reason: err.to_string(),
        },
    }
}

/// File name of a downloaded archive.
pub fn archive_file_name(device_id: &str, at: DateTime<Utc>) -> String {
    timestamped_file_name(device_id, at, "tar.gz")
}

pub struct BackupManager {
    bridge: Arc<dyn DeviceBridge>,
    transfers: Arc<TransferEngine>,
    layout: DeviceLayout,
    records: RwLock<HashMap<String, BackupRecord>>,
}

impl BackupManager {
    pub fn new(
        bridge: Arc<dyn DeviceBridge>,
        transfers: Arc<TransferEngine>,
        layout: DeviceLayout,
    ) -> Self {
        Self {
            bridge,
            transfers,
            layout,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// The last known record for a device, without asking the device.
    pub fn record(&self, device_id: &str) -> Option<BackupRecord> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        records.get(device_id).cloned()
    }

    fn store(&self, record: BackupRecord) {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records.insert(record.device_id.clone(), record);
    }

    fn forget(&self, device_id: &str) {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records.remove(device_id);
    }

    async fn remote_stat(&self, device_id: &str) -> Result<Option<(u64, i64)>, OrchestratorError> {
        let command = format!("stat -c '%s %Y' {}", shell_quote(&self.layout.backup_path));
        match self
            .bridge
            .shell(device_id, &command, TimeoutClass::Short)
            .await
        {
            Ok(output) => Ok(parse_stat(&output.stdout_text())),
            // a missing archive is a failed stat, not a failed device
            Err(BridgeError::CommandFailed { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Archive the device's data directory into the backup path.
    pub async fn backup(&self, job: &JobContext) -> Result<BackupRecord, OrchestratorError> {
        let device_id = job.device_id.as_str();
        let span = info_span!("backup", job_id = %job.job_id, device_id);

        async {
            job.check_cancelled()?;
            job.step(BackupState::Creating).await;
            info!(data_dir = %self.layout.data_dir, "Creating backup");

            if let Some(parent) = remote_parent(&self.layout.backup_path) {
                let command = format!("mkdir -p {}", shell_quote(parent));
                self.bridge
                    .shell(device_id, &command, TimeoutClass::Short)
                    .await
                    .map_err(backup_error)?;
            }
            job.check_cancelled()?;

            let command = format!(
                "tar -czf {} -C {} .",
                shell_quote(&self.layout.backup_path),
                shell_quote(&self.layout.data_dir)
            );
            self.bridge
                .shell(device_id, &command, TimeoutClass::Long)
                .await
                .map_err(backup_error)?;
            // a cancelled backup leaves its archive on the device unregistered
            job.check_cancelled()?;

            let (size_bytes, _) = self
                .remote_stat(device_id)
                .await
                .map_err(backup_error)?
                .ok_or_else(|| OrchestratorError::BackupFailed {
                    reason: format!("archive missing after tar: {}", self.layout.backup_path),
                })?;

            let record = BackupRecord {
                device_id: device_id.to_string(),
                created_at: Utc::now(),
                size_bytes,
                remote_path: self.layout.backup_path.clone(),
                remote_present: true,
                local_path: None,
                checksum: None,
            };
            self.store(record.clone());
            job.step(BackupState::Created).await;
            info!(size_bytes, "Backup created");

            Ok(record)
        }
        .instrument(span)
        .await
    }

    /// Current state of the device's backup, merged with any local copy.
    pub async fn backup_info(&self, device_id: &str) -> Result<Option<BackupRecord>, OrchestratorError> {
        let known = self.record(device_id);

        let record = match (self.remote_stat(device_id).await?, known) {
            (Some((size_bytes, mtime)), known) => {
                let mut record = known.unwrap_or_else(|| BackupRecord {
                    device_id: device_id.to_string(),
                    created_at: DateTime::from_timestamp(mtime, 0).unwrap_or_else(Utc::now),
                    size_bytes,
                    remote_path: self.layout.backup_path.clone(),
                    remote_present: true,
                    local_path: None,
                    checksum: None,
                });
                record.size_bytes = size_bytes;
                record.remote_present = true;
                Some(record)
            }
            (None, Some(mut known)) if known.local_path.is_some() => {
                known.remote_present = false;
                Some(known)
            }
            (None, _) => None,
        };

        match &record {
            Some(record) => self.store(record.clone()),
            None => self.forget(device_id),
        }
        Ok(record)
    }

    /// Pull the device archive into `output_dir` and verify it.
    pub async fn download_backup(
        &self,
        job: &JobContext,
        output_dir: &Path,
    ) -> Result<BackupRecord, OrchestratorError> {
        let device_id = job.device_id.as_str();
        let span = info_span!("download_backup", job_id = %job.job_id, device_id);

        async {
            job.check_cancelled()?;
            let mut record = self
                .backup_info(device_id)
                .await?
                .filter(|r| r.remote_present)
                .ok_or_else(|| OrchestratorError::BackupFailed {
                    reason: "no backup on device".to_string(),
                })?;

            job.step(BackupState::Downloading).await;
            let local_path = output_dir.join(archive_file_name(device_id, Utc::now()));
            let request = TransferRequest {
                job_id: job.job_id.clone(),
                device_id: device_id.to_string(),
                direction: TransferDirection::Pull,
                files: vec![FileTransfer {
                    local_path: local_path.clone(),
                    remote_path: record.remote_path.clone(),
                }],
                destination_root: output_dir.display().to_string(),
            };
            let transfer = self
                .transfers
                .copy(&request, job.updates.clone(), &job.cancel)
                .await?;

            if transfer.status != JobStatus::Completed {
                return Err(match transfer.status {
                    JobStatus::Cancelled => OrchestratorError::Cancelled,
                    status => OrchestratorError::TransferFailed {
                        status,
                        files: failed_items(&transfer),
                    },
                });
            }

            let verified = verify_download(&local_path, record.size_bytes, None)
                .await
                .map_err(|e| OrchestratorError::TransferFailed {
                    status: JobStatus::Failed,
                    files: vec![ItemFailure {
                        item: local_path.display().to_string(),
                        error: e.to_string(),
                    }],
                })?;

            record.local_path = Some(local_path.clone());
            record.checksum = Some(verified.checksum);
            self.store(record.clone());
            job.step(BackupState::Downloaded).await;
            info!(path = %local_path.display(), bytes = verified.bytes_verified, "Backup downloaded");

            Ok(record)
        }
        .instrument(span)
        .await
    }

    /// Replace the device's data with the contents of a local archive.
    ///
    /// The archive is staged next to the backup path, extracted from there,
    /// and only moved over the existing archive once extraction succeeded.
    pub async fn upload_backup(
        &self,
        job: &JobContext,
        local_path: &Path,
    ) -> Result<BackupRecord, OrchestratorError> {
        let device_id = job.device_id.as_str();
        let span = info_span!("upload_backup", job_id = %job.job_id, device_id);

        async {
            let metadata = tokio::fs::metadata(local_path).await.map_err(|e| {
                OrchestratorError::invalid(format!("cannot read {}: {}", local_path.display(), e))
            })?;
            if !metadata.is_file() {
                return Err(OrchestratorError::invalid(format!(
                    "{} is not a file",
                    local_path.display()
                )));
            }

            job.check_cancelled()?;
            job.step(BackupState::Uploading).await;

            let staging = format!("{}.upload", self.layout.backup_path);
            let request = TransferRequest {
                job_id: job.job_id.clone(),
                device_id: device_id.to_string(),
                direction: TransferDirection::Push,
                files: vec![FileTransfer {
                    local_path: local_path.to_path_buf(),
                    remote_path: staging.clone(),
                }],
                destination_root: remote_parent(&staging).unwrap_or("/").to_string(),
            };
            let transfer = self
                .transfers
                .copy(&request, job.updates.clone(), &job.cancel)
                .await?;

            if transfer.status != JobStatus::Completed {
                self.remove_staging(device_id, &staging).await;
                return Err(match transfer.status {
                    JobStatus::Cancelled => OrchestratorError::Cancelled,
                    status => OrchestratorError::TransferFailed {
                        status,
                        files: failed_items(&transfer),
                    },
                });
            }

            // extract from the staged copy; the current archive is only
            // replaced once the data directory has been restored
            let command = format!(
                "mkdir -p {dir} && tar -xzf {archive} -C {dir}",
                archive = shell_quote(&staging),
                dir = shell_quote(&self.layout.data_dir)
            );
            if let Err(e) = self
                .bridge
                .shell(device_id, &command, TimeoutClass::Long)
                .await
            {
                self.remove_staging(device_id, &staging).await;
                return Err(backup_error(e));
            }

            let command = format!(
                "mv {} {}",
                shell_quote(&staging),
                shell_quote(&self.layout.backup_path)
            );
            if let Err(e) = self
                .bridge
                .shell(device_id, &command, TimeoutClass::Short)
                .await
            {
                self.remove_staging(device_id, &staging).await;
                return Err(backup_error(e));
            }

            let record = BackupRecord {
                device_id: device_id.to_string(),
                created_at: Utc::now(),
                size_bytes: metadata.len(),
                remote_path: self.layout.backup_path.clone(),
                remote_present: true,
                local_path: Some(local_path.to_path_buf()),
                checksum: None,
            };
            self.store(record.clone());
            job.step(BackupState::Restored).await;
            info!(path = %local_path.display(), "Backup restored");

            Ok(record)
        }
        .instrument(span)
        .await
    }

    async fn remove_staging(&self, device_id: &str, staging: &str) {
        let command = format!("rm -f {}", shell_quote(staging));
        if let Err(e) = self
            .bridge
            .shell(device_id, &command, TimeoutClass::Short)
            .await
        {
            debug!(device_id, error = %e, "Could not remove staged archive");
        }
    }

    /// Delete the on-device archive. A downloaded copy is left alone.
    ///
    /// Returns the remaining record, if a local copy keeps it alive.
    pub async fn delete_backup(&self, job: &JobContext) -> Result<Option<BackupRecord>, OrchestratorError> {
        let device_id = job.device_id.as_str();
        job.check_cancelled()?;
        job.step(BackupState::Deleting).await;

        let command = format!("rm -f {}", shell_quote(&self.layout.backup_path));
        self.bridge
            .shell(device_id, &command, TimeoutClass::Short)
            .await
            .map_err(backup_error)?;

        let remaining = match self.record(device_id) {
            Some(mut record) if record.local_path.is_some() => {
                record.remote_present = false;
                self.store(record.clone());
                Some(record)
            }
            _ => {
                self.forget(device_id);
                None
            }
        };

        job.step(BackupState::Deleted).await;
        if remaining.is_some() {
            info!(device_id, "Remote backup deleted, local copy kept");
        } else {
            info!(device_id, "Remote backup deleted");
        }
        Ok(remaining)
    }
}

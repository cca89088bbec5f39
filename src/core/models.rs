use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DeviceLayout;

pub type FeatureId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Online,
    Offline,
    Unauthorized,
}

impl DeviceState {
    /// Map the state column of `adb devices` onto the registry's states.
    pub fn from_adb(raw: &str) -> Self {
        match raw {
            "device" => Self::Online,
            "unauthorized" | "authorizing" | "no permissions" => Self::Unauthorized,
            _ => Self::Offline,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Unauthorized => "unauthorized",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub display_name: String,
    pub state: DeviceState,
    pub capabilities: BTreeSet<FeatureId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    pub id: FeatureId,
    pub name: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    /// Local files to the device
    Push,
    /// Device files to local storage
    Pull,
}

/// One file of a transfer request, before sizes are known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTransfer {
    pub local_path: PathBuf,
    pub remote_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    InProgress,
    Completed,
    Failed { reason: String },
    /// Not attempted because the job was cancelled first
    Skipped { reason: String },
}

impl FileStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub size_bytes: u64,
    pub status: FileStatus,
}

impl FileEntry {
    /// The path on the source side of the copy, used in progress reports.
    pub fn display_name(&self, direction: TransferDirection) -> String {
        match direction {
            TransferDirection::Push => self.local_path.display().to_string(),
            TransferDirection::Pull => self.remote_path.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    PartiallyFailed,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::InProgress => "InProgress",
            Self::PartiallyFailed => "PartiallyFailed",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferJob {
    pub job_id: String,
    pub device_id: String,
    pub direction: TransferDirection,
    pub destination_root: String,
    pub status: JobStatus,
    pub files: Vec<FileEntry>,
    pub bytes_transferred: u64,
    pub bytes_total: u64,
}

impl TransferJob {
    pub fn completed_files(&self) -> usize {
        self.files.iter().filter(|f| f.status.is_completed()).count()
    }

    pub fn percentage(&self) -> u8 {
        if self.bytes_total == 0 {
            return if self.status == JobStatus::Completed { 100 } else { 0 };
        }
        let ratio = self.bytes_transferred as f64 / self.bytes_total as f64;
        (ratio * 100.0).min(100.0) as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub device_id: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub remote_path: String,
    /// False once the on-device archive has been deleted
    pub remote_present: bool,
    pub local_path: Option<PathBuf>,
    /// BLAKE3 hex digest of the local copy
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupState {
    Idle,
    Creating,
    Created,
    Downloading,
    Downloaded,
    Deleting,
    Deleted,
    Uploading,
    Restored,
}

/// `<device>-<YYYYmmdd-HHMMSS>.<extension>`, with the device id made safe
/// for any host filesystem.
pub fn timestamped_file_name(device_id: &str, at: DateTime<Utc>, extension: &str) -> String {
    let device: String = device_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "._-".contains(c) {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}-{}.{}", device, at.format("%Y%m%d-%H%M%S"), extension)
}

/// Kinds of content that live under a fixed root on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Map,
    Routing,
    Theme,
}

impl ContentKind {
    pub fn remote_root<'a>(&self, layout: &'a DeviceLayout) -> &'a str {
        match self {
            Self::Map => &layout.maps_dir,
            Self::Routing => &layout.routing_dir,
            Self::Theme => &layout.themes_dir,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Screenshot {
    pub path: PathBuf,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    pub package: String,
    pub version_name: Option<String>,
    pub version_code: Option<u64>,
    pub first_install_time: Option<String>,
    pub last_update_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebServerInfo {
    pub running: bool,
    pub port: Option<u16>,
    /// Host-side URL, present while a port forward is active
    pub local_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Transfer,
    Backup,
    DownloadBackup,
    UploadBackup,
    DeleteBackup,
    Screenshot,
    WebServerStart,
    WebServerStop,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transfer => "transfer",
            Self::Backup => "backup",
            Self::DownloadBackup => "download_backup",
            Self::UploadBackup => "upload_backup",
            Self::DeleteBackup => "delete_backup",
            Self::Screenshot => "screenshot",
            Self::WebServerStart => "web_server_start",
            Self::WebServerStop => "web_server_stop",
        }
    }
}

/// Success payload of a finished job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobOutcome {
    Transfer(TransferJob),
    Backup(BackupRecord),
    Screenshot(Screenshot),
    WebServer(WebServerInfo),
    Done,
}

/// A persisted job row with its latest status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub device_id: String,
    pub kind: String,
    pub created_at: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusEntry {
    pub status: String,
    pub description: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobWithHistory {
    #[serde(flatten)]
    pub job: Job,
    pub history: Vec<JobStatusEntry>,
}

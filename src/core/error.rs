//! Error taxonomy exposed by the orchestration layer.
//!
//! Every terminal job event and every failed request carries one of these.
//! The enum is serialisable so it can cross the RPC/WebSocket boundary
//! unchanged; `kind` names the variant on the wire.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::bridge::BridgeError;
use super::models::JobStatus;

/// A single failed item of a batch operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub item: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrchestratorError {
    #[error("device bridge unavailable: {message}")]
    BridgeUnavailable { message: String },

    #[error("device not found: {device_id}")]
    DeviceNotFound { device_id: String },

    #[error("device offline: {device_id}")]
    DeviceOffline { device_id: String },

    #[error("device unauthorized: {device_id}")]
    DeviceUnauthorized { device_id: String },

    #[error("bridge command timed out after {after_ms}ms: {command}")]
    Timeout { command: String, after_ms: u64 },

    #[error("bridge command failed (exit code {exit_code:?}): {stderr}")]
    CommandFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("{} of {} item(s) failed", .failed.len(), .failed.len() + .succeeded.len())]
    PartialFailure {
        succeeded: Vec<String>,
        failed: Vec<ItemFailure>,
    },

    #[error("feature '{feature_id}': {cause}")]
    FeatureError { feature_id: String, cause: String },

    #[error("backup failed: {reason}")]
    BackupFailed { reason: String },

    #[error("transfer ended {status}: {} file(s) failed", .files.len())]
    TransferFailed {
        status: JobStatus,
        files: Vec<ItemFailure>,
    },

    #[error("job not found: {job_id}")]
    JobNotFound { job_id: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("I/O error: {message}")]
    Io { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl OrchestratorError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Variant name as it appears in serialized payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BridgeUnavailable { .. } => "bridge_unavailable",
            Self::DeviceNotFound { .. } => "device_not_found",
            Self::DeviceOffline { .. } => "device_offline",
            Self::DeviceUnauthorized { .. } => "device_unauthorized",
            Self::Timeout { .. } => "timeout",
            Self::CommandFailed { .. } => "command_failed",
            Self::PartialFailure { .. } => "partial_failure",
            Self::FeatureError { .. } => "feature_error",
            Self::BackupFailed { .. } => "backup_failed",
            Self::TransferFailed { .. } => "transfer_failed",
            Self::JobNotFound { .. } => "job_not_found",
            Self::Cancelled => "cancelled",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Io { .. } => "io",
            Self::Internal { .. } => "internal",
        }
    }

    /// Whether a caller may reasonably retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::DeviceOffline { .. })
    }

    /// Errors that mean the device (or the whole bridge) went away rather
    /// than a single command failing.
    pub fn is_device_gone(&self) -> bool {
        matches!(
            self,
            Self::DeviceNotFound { .. } | Self::DeviceOffline { .. } | Self::BridgeUnavailable { .. }
        )
    }

    /// The job status a terminal result of this error maps to.
    pub fn terminal_status(&self) -> JobStatus {
        match self {
            Self::Cancelled => JobStatus::Cancelled,
            Self::PartialFailure { .. } => JobStatus::PartiallyFailed,
            Self::TransferFailed { status, .. } => *status,
            _ => JobStatus::Failed,
        }
    }
}

impl From<BridgeError> for OrchestratorError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Unavailable(message) => Self::BridgeUnavailable { message },
            BridgeError::Spawn(e) => Self::BridgeUnavailable {
                message: e.to_string(),
            },
            BridgeError::DeviceNotFound(device_id) => Self::DeviceNotFound { device_id },
            BridgeError::DeviceOffline(device_id) => Self::DeviceOffline { device_id },
            BridgeError::DeviceUnauthorized(device_id) => Self::DeviceUnauthorized { device_id },
            BridgeError::Timeout { command, after } => Self::Timeout {
                command,
                after_ms: after.as_millis() as u64,
            },
            BridgeError::CommandFailed { exit_code, stderr } => {
                Self::CommandFailed { exit_code, stderr }
            }
        }
    }
}

impl From<std::io::Error> for OrchestratorError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_bridge_errors_map_to_taxonomy() {
        let err: OrchestratorError = BridgeError::DeviceNotFound("R5CT1".to_string()).into();
        assert_eq!(
            err,
            OrchestratorError::DeviceNotFound {
                device_id: "R5CT1".to_string()
            }
        );

        let err: OrchestratorError = BridgeError::Timeout {
            command: "adb push".to_string(),
            after: Duration::from_secs(2),
        }
        .into();
        assert!(err.is_retryable());
        assert!(matches!(err, OrchestratorError::Timeout { after_ms: 2000, .. }));
    }

    #[test]
    fn test_partial_failure_message_counts_items() {
        let err = OrchestratorError::PartialFailure {
            succeeded: vec!["a".to_string(), "b".to_string()],
            failed: vec![ItemFailure {
                item: "c".to_string(),
                error: "boom".to_string(),
            }],
        };
        assert_eq!(err.to_string(), "1 of 3 item(s) failed");
        assert_eq!(err.terminal_status(), JobStatus::PartiallyFailed);
    }

    #[test]
    fn test_serialized_error_carries_kind() {
        let err = OrchestratorError::CommandFailed {
            exit_code: Some(1),
            stderr: "nope".to_string(),
        };
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["kind"], err.kind());
        assert_eq!(value["exit_code"], 1);

        let back: OrchestratorError = serde_json::from_value(value).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_cancelled_is_terminal_cancelled() {
        assert_eq!(
            OrchestratorError::Cancelled.terminal_status(),
            JobStatus::Cancelled
        );
        assert_eq!(
            OrchestratorError::internal("x").terminal_status(),
            JobStatus::Failed
        );
    }
}

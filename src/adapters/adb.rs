use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::config::TimeoutConfig;
use crate::core::bridge::{BridgeError, BridgeOutput, DeviceBridge, TimeoutClass};

static DEVICE_NOT_FOUND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"device '[^']*' not found|no devices/emulators found")
        .expect("device not found regex is valid")
});

/// Runs the real `adb` executable.
pub struct AdbBridge {
    adb_path: PathBuf,
    timeouts: TimeoutConfig,
}

impl AdbBridge {
    pub fn new(adb_path: PathBuf, timeouts: TimeoutConfig) -> Self {
        Self { adb_path, timeouts }
    }
}

/// Map a failed invocation onto the bridge error taxonomy using adb's
/// stderr, which is the only signal it gives.
pub fn classify_failure(device_id: Option<&str>, exit_code: Option<i32>, stderr: &str) -> BridgeError {
    let device = device_id.unwrap_or_default().to_string();

    if stderr.contains("cannot connect to daemon")
        || stderr.contains("failed to start daemon")
        || stderr.contains("Connection refused")
    {
        BridgeError::Unavailable(stderr.to_string())
    } else if device_id.is_some() && DEVICE_NOT_FOUND.is_match(stderr) {
        BridgeError::DeviceNotFound(device)
    } else if stderr.contains("device offline") {
        BridgeError::DeviceOffline(device)
    } else if stderr.contains("device unauthorized") {
        BridgeError::DeviceUnauthorized(device)
    } else {
        BridgeError::CommandFailed {
            exit_code,
            stderr: stderr.to_string(),
        }
    }
}

#[async_trait]
impl DeviceBridge for AdbBridge {
    async fn run(
        &self,
        device_id: Option<&str>,
        args: &[&str],
        class: TimeoutClass,
    ) -> Result<BridgeOutput, BridgeError> {
        let mut cmd = Command::new(&self.adb_path);
        if let Some(id) = device_id {
            cmd.arg("-s").arg(id);
        }
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        trace!(device_id = ?device_id, args = ?args, "Running adb");

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BridgeError::Unavailable(format!("{} not found", self.adb_path.display()))
            } else {
                BridgeError::Spawn(e)
            }
        })?;

        let limit = self.timeouts.for_class(class);
        // dropping the wait future on timeout kills the child
        let output = match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                let command = format!("adb {}", args.join(" "));
                debug!(device_id = ?device_id, command = %command, after = ?limit, "adb timed out");
                return Err(BridgeError::Timeout {
                    command,
                    after: limit,
                });
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if output.status.success() {
            return Ok(BridgeOutput {
                stdout: output.stdout,
                stderr,
                exit_code: output.status.code(),
            });
        }

        let err = classify_failure(device_id, output.status.code(), &stderr);
        debug!(device_id = ?device_id, args = ?args, error = %err, "adb failed");
        Err(err)
    }
}

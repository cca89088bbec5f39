//! Single-shot device intents: screenshots, app maintenance, reboot and
//! the on-device debug web server.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use super::bridge::{
    BridgeOutput, DeviceBridge, TimeoutClass, parse_getprop, parse_package_info, parse_prop_bool,
    shell_quote,
};
use super::error::OrchestratorError;
use super::models::{AppInfo, Screenshot, WebServerInfo, timestamped_file_name};
use crate::config::{DeviceLayout, WebServerConfig};

const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";
const LAUNCHER_CATEGORY: &str = "android.intent.category.LAUNCHER";

pub struct DeviceControl {
    bridge: Arc<dyn DeviceBridge>,
    layout: DeviceLayout,
    web: WebServerConfig,
}

impl DeviceControl {
    pub fn new(bridge: Arc<dyn DeviceBridge>, layout: DeviceLayout, web: WebServerConfig) -> Self {
        Self {
            bridge,
            layout,
            web,
        }
    }

    async fn shell(&self, device_id: &str, command: &str) -> Result<BridgeOutput, OrchestratorError> {
        Ok(self
            .bridge
            .shell(device_id, command, TimeoutClass::Short)
            .await?)
    }

    /// Capture the screen as PNG into `output_dir`.
    pub async fn screenshot(
        &self,
        device_id: &str,
        output_dir: &Path,
    ) -> Result<Screenshot, OrchestratorError> {
        let output = self
            .bridge
            .run(
                Some(device_id),
                &["exec-out", "screencap", "-p"],
                TimeoutClass::Short,
            )
            .await?;

        if !output.stdout.starts_with(PNG_MAGIC) {
            return Err(OrchestratorError::CommandFailed {
                exit_code: output.exit_code,
                stderr: if output.stderr.is_empty() {
                    "screencap did not return a PNG image".to_string()
                } else {
                    output.stderr
                },
            });
        }

        tokio::fs::create_dir_all(output_dir).await?;
        let path = output_dir.join(timestamped_file_name(device_id, Utc::now(), "png"));
        tokio::fs::write(&path, &output.stdout).await?;

        let size_bytes = output.stdout.len() as u64;
        info!(device_id, path = %path.display(), size_bytes, "Screenshot saved");
        Ok(Screenshot { path, size_bytes })
    }

    pub async fn app_info(&self, device_id: &str) -> Result<AppInfo, OrchestratorError> {
        let package = &self.layout.package;
        let output = self
            .shell(device_id, &format!("dumpsys package {}", shell_quote(package)))
            .await?;

        parse_package_info(&output.stdout_text(), package).ok_or_else(|| {
            OrchestratorError::CommandFailed {
                exit_code: output.exit_code,
                stderr: format!("package {} is not installed", package),
            }
        })
    }

    pub async fn clear_cache(&self, device_id: &str) -> Result<(), OrchestratorError> {
        let inner = format!("rm -rf {}/*", shell_quote(&self.layout.cache_dir));
        self.shell(device_id, &format!("sh -c {}", shell_quote(&inner)))
            .await?;
        info!(device_id, cache_dir = %self.layout.cache_dir, "Cache cleared");
        Ok(())
    }

    pub async fn restart_application(&self, device_id: &str) -> Result<(), OrchestratorError> {
        let package = shell_quote(&self.layout.package);
        self.shell(device_id, &format!("am force-stop {}", package))
            .await?;
        self.shell(
            device_id,
            &format!("monkey -p {} -c {} 1", package, LAUNCHER_CATEGORY),
        )
        .await?;
        info!(device_id, package = %self.layout.package, "Application restarted");
        Ok(())
    }

    pub async fn reboot(&self, device_id: &str) -> Result<(), OrchestratorError> {
        self.bridge
            .run(Some(device_id), &["reboot"], TimeoutClass::Short)
            .await?;
        info!(device_id, "Reboot requested");
        Ok(())
    }

    pub async fn web_server_info(&self, device_id: &str) -> Result<WebServerInfo, OrchestratorError> {
        let output = self.shell(device_id, "getprop").await?;
        let props = parse_getprop(&output.stdout_text());
        let prop = |name: &str| props.get(&format!("{}{}", self.web.property_prefix, name));

        let running = prop("running").is_some_and(|v| parse_prop_bool(v));
        let port = prop("port").and_then(|v| v.trim().parse().ok());
        let local_url = if running && self.is_forwarded(device_id).await {
            Some(format!("http://127.0.0.1:{}", self.web.local_port))
        } else {
            None
        };

        Ok(WebServerInfo {
            running,
            port,
            local_url,
        })
    }

    async fn is_forwarded(&self, device_id: &str) -> bool {
        let local = format!("tcp:{}", self.web.local_port);
        match self
            .bridge
            .run(Some(device_id), &["forward", "--list"], TimeoutClass::Short)
            .await
        {
            Ok(output) => output.stdout_text().lines().any(|line| {
                let mut parts = line.split_whitespace();
                parts.next() == Some(device_id) && parts.next() == Some(local.as_str())
            }),
            Err(e) => {
                debug!(device_id, error = %e, "Could not list port forwards");
                false
            }
        }
    }

    pub async fn start_web_server(&self, device_id: &str) -> Result<WebServerInfo, OrchestratorError> {
        self.shell(
            device_id,
            &format!("am broadcast -a {}", shell_quote(&self.web.start_action)),
        )
        .await?;

        let local = format!("tcp:{}", self.web.local_port);
        let remote = format!("tcp:{}", self.web.device_port);
        self.bridge
            .run(Some(device_id), &["forward", &local, &remote], TimeoutClass::Short)
            .await?;

        let info = self.web_server_info(device_id).await?;
        info!(device_id, running = info.running, port = ?info.port, "Web server started");
        Ok(info)
    }

    pub async fn stop_web_server(&self, device_id: &str) -> Result<WebServerInfo, OrchestratorError> {
        let local = format!("tcp:{}", self.web.local_port);
        if let Err(e) = self
            .bridge
            .run(
                Some(device_id),
                &["forward", "--remove", &local],
                TimeoutClass::Short,
            )
            .await
        {
            debug!(device_id, error = %e, "No port forward to remove");
        }

        self.shell(
            device_id,
            &format!("am broadcast -a {}", shell_quote(&self.web.stop_action)),
        )
        .await?;

        let info = self.web_server_info(device_id).await?;
        info!(device_id, running = info.running, "Web server stopped");
        Ok(info)
    }
}

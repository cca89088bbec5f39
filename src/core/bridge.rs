//! The device bridge boundary.
//!
//! Everything the orchestration layer knows about a device comes through
//! [`DeviceBridge::run`], a line-oriented invocation of the bridge tool.
//! The parsers for the bridge's textual output live here too so every
//! adapter (real or simulated) produces and consumes the same formats.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::models::{AppInfo, DeviceState};

/// Which timeout budget a bridge call runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutClass {
    /// Property reads/writes, state queries, short shell commands
    Short,
    /// File transfer, archival and restore
    Long,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl BridgeOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("adb unavailable: {0}")]
    Unavailable(String),

    #[error("failed to spawn adb: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("device '{0}' not found")]
    DeviceNotFound(String),

    #[error("device '{0}' offline")]
    DeviceOffline(String),

    #[error("device '{0}' unauthorized")]
    DeviceUnauthorized(String),

    #[error("command timed out after {after:?}: {command}")]
    Timeout { command: String, after: Duration },

    #[error("command exited with {exit_code:?}: {stderr}")]
    CommandFailed {
        exit_code: Option<i32>,
        stderr: String,
    },
}

#[async_trait]
pub trait DeviceBridge: Send + Sync {
    /// Run one bridge command.
    ///
    /// `device_id = None` addresses the bridge server itself (enumeration);
    /// otherwise the command is scoped to that device. Implementations must
    /// enforce the timeout for `class` and must not leave the subprocess
    /// running once it has expired.
    async fn run(
        &self,
        device_id: Option<&str>,
        args: &[&str],
        class: TimeoutClass,
    ) -> Result<BridgeOutput, BridgeError>;

    /// Run a single shell command line on the device.
    async fn shell(
        &self,
        device_id: &str,
        command: &str,
        class: TimeoutClass,
    ) -> Result<BridgeOutput, BridgeError> {
        self.run(Some(device_id), &["shell", command], class).await
    }
}

/// Quote one argument for the device-side `sh`.
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-:=+,@%".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Parent directory of a device path, if it has one.
pub fn remote_parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&trimmed[..idx]),
        None => None,
    }
}

/// Join a device directory and a relative path with `/`.
pub fn remote_join(root: &str, relative: &str) -> String {
    format!(
        "{}/{}",
        root.trim_end_matches('/'),
        relative.trim_start_matches('/')
    )
}

/// One row of `adb devices -l`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceListing {
    pub serial: String,
    pub state: DeviceState,
    pub model: Option<String>,
    pub product: Option<String>,
}

impl DeviceListing {
    pub fn display_name(&self) -> String {
        match &self.model {
            Some(model) => model.replace('_', " "),
            None => self.serial.clone(),
        }
    }
}

static DEVICE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(\S+)\s+(device|offline|unauthorized|authorizing|connecting|recovery|rescue|sideload|bootloader|host|no permissions)\b(.*)$",
    )
    .expect("device line regex is valid")
});

static DEVICE_ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\w+):(\S+)").expect("device attribute regex is valid"));

static PROP_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[([^\]]+)\]: \[(.*)\]$").expect("getprop regex is valid"));

/// Parse the output of `adb devices -l`.
pub fn parse_device_list(output: &str) -> Vec<DeviceListing> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('*'))
        .filter(|line| !line.starts_with("List of devices"))
        .filter_map(|line| {
            let caps = DEVICE_LINE.captures(line)?;
            let mut model = None;
            let mut product = None;
            for attr in DEVICE_ATTR.captures_iter(&caps[3]) {
                match &attr[1] {
                    "model" => model = Some(attr[2].to_string()),
                    "product" => product = Some(attr[2].to_string()),
                    _ => {}
                }
            }
            Some(DeviceListing {
                serial: caps[1].to_string(),
                state: DeviceState::from_adb(&caps[2]),
                model,
                product,
            })
        })
        .collect()
}

/// Parse `getprop` output (`[key]: [value]` per line).
pub fn parse_getprop(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let caps = PROP_LINE.captures(line.trim())?;
            Some((caps[1].to_string(), caps[2].to_string()))
        })
        .collect()
}

/// Parse `stat -c '%s %Y'` output into `(size, mtime)`.
pub fn parse_stat(output: &str) -> Option<(u64, i64)> {
    let mut parts = output.split_whitespace();
    let size = parts.next()?.parse().ok()?;
    let mtime = parts.next()?.parse().ok()?;
    Some((size, mtime))
}

/// Interpret a boolean system property value.
pub fn parse_prop_bool(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "on" | "yes")
}

/// Extract version details from `dumpsys package <package>`.
///
/// Returns `None` when the package is not installed.
pub fn parse_package_info(output: &str, package: &str) -> Option<AppInfo> {
    let field = |name: &str| -> Option<String> {
        output.lines().find_map(|line| {
            let line = line.trim();
            let idx = line.find(&format!("{}=", name))?;
            let rest = &line[idx + name.len() + 1..];
            let value = match name {
                // timestamps contain a space between date and time
                "firstInstallTime" | "lastUpdateTime" => rest.trim(),
                _ => rest.split_whitespace().next().unwrap_or_default(),
            };
            (!value.is_empty()).then(|| value.to_string())
        })
    };

    let version_name = field("versionName");
    let version_code = field("versionCode").and_then(|v| v.parse().ok());

    if version_name.is_none() && version_code.is_none() {
        return None;
    }

    Some(AppInfo {
        package: package.to_string(),
        version_name,
        version_code,
        first_install_time: field("firstInstallTime"),
        last_update_time: field("lastUpdateTime"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_list() {
        let output = "\
* daemon not running; starting now at tcp:5037
* daemon started successfully
List of devices attached
R5CT1                  device usb:1-1 product:bolt model:ELEMNT_BOLT device:bolt transport_id:3
emulator-5554          offline transport_id:1
0123456789ABCDEF       unauthorized usb:1-2 transport_id:4
ZX1G22                 no permissions (user in plugdev group; are your udev rules wrong?); see [http://developer.android.com/tools/device.html] usb:1-3
";
        let devices = parse_device_list(output);
        assert_eq!(devices.len(), 4);

        assert_eq!(devices[0].serial, "R5CT1");
        assert_eq!(devices[0].state, DeviceState::Online);
        assert_eq!(devices[0].model.as_deref(), Some("ELEMNT_BOLT"));
        assert_eq!(devices[0].display_name(), "ELEMNT BOLT");

        assert_eq!(devices[1].state, DeviceState::Offline);
        assert_eq!(devices[1].display_name(), "emulator-5554");
        assert_eq!(devices[2].state, DeviceState::Unauthorized);
        assert_eq!(devices[3].state, DeviceState::Unauthorized);
    }

    #[test]
    fn test_parse_device_list_empty() {
        assert!(parse_device_list("List of devices attached\n\n").is_empty());
    }

    #[test]
    fn test_parse_getprop() {
        let output = "[ro.product.model]: [ELEMNT BOLT]\n[persist.elemnt.feature.offline-maps]: [1]\n[empty.prop]: []\n";
        let props = parse_getprop(output);
        assert_eq!(props.len(), 3);
        assert_eq!(props["ro.product.model"], "ELEMNT BOLT");
        assert_eq!(props["persist.elemnt.feature.offline-maps"], "1");
        assert_eq!(props["empty.prop"], "");
    }

    #[test]
    fn test_parse_stat() {
        assert_eq!(parse_stat("1048576 1700000000\n"), Some((1_048_576, 1_700_000_000)));
        assert_eq!(parse_stat("stat: No such file"), None);
    }

    #[test]
    fn test_parse_package_info() {
        let output = "\
Packages:
  Package [com.wahoofitness.bolt] (8c0a2f1):
    versionCode=20231 minSdk=21 targetSdk=28
    versionName=13.2.1
    firstInstallTime=2023-01-05 10:11:12
    lastUpdateTime=2024-02-01 08:00:00
";
        let info = parse_package_info(output, "com.wahoofitness.bolt").unwrap();
        assert_eq!(info.version_code, Some(20231));
        assert_eq!(info.version_name.as_deref(), Some("13.2.1"));
        assert_eq!(info.first_install_time.as_deref(), Some("2023-01-05 10:11:12"));
        assert_eq!(info.last_update_time.as_deref(), Some("2024-02-01 08:00:00"));

        assert!(parse_package_info("Unable to find package: x", "x").is_none());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/sdcard/maps/a.map"), "/sdcard/maps/a.map");
        assert_eq!(shell_quote("my map.map"), "'my map.map'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_remote_paths() {
        assert_eq!(remote_parent("/sdcard/maps/a.map"), Some("/sdcard/maps"));
        assert_eq!(remote_parent("/a"), Some("/"));
        assert_eq!(remote_parent("a"), None);
        assert_eq!(remote_join("/sdcard/maps/", "tiles/1.map"), "/sdcard/maps/tiles/1.map");
    }

    #[test]
    fn test_parse_prop_bool() {
        assert!(parse_prop_bool("1"));
        assert!(parse_prop_bool("true"));
        assert!(!parse_prop_bool("0"));
        assert!(!parse_prop_bool(""));
    }
}

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::config::WebServerConfig;
use crate::core::bridge::{BridgeError, BridgeOutput, DeviceBridge, TimeoutClass};
use crate::core::models::DeviceState;

const PNG_HEADER: &[u8] = b"\x89PNG\r\n\x1a\n";
const ARCHIVE_MAGIC: &[u8] = b"SIMTAR1\n";
/// mtime reported by `stat` for every simulated file
const FILE_MTIME: i64 = 1_700_000_000;

/// How an injected fault makes a matching call fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFault {
    /// Non-zero exit with a generic stderr
    CommandFailed,
    /// The device drops off the bus before the call completes
    Disconnect,
    Timeout,
    /// The adb server cannot be reached
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct CallRecord {
    pub device_id: Option<String>,
    pub args: Vec<String>,
    pub started_at: Instant,
    pub finished_at: Instant,
}

struct FaultRule {
    device_id: Option<String>,
    pattern: String,
    fault: SimFault,
    remaining: Option<u32>,
}

struct SimDevice {
    /// False once unplugged; storage survives for a later `add_device`
    attached: bool,
    state: DeviceState,
    model: String,
    props: BTreeMap<String, String>,
    files: BTreeMap<String, Vec<u8>>,
    /// package -> (version name, version code)
    packages: BTreeMap<String, (String, u64)>,
}

struct SimState {
    devices: BTreeMap<String, SimDevice>,
    faults: Vec<FaultRule>,
    calls: Vec<CallRecord>,
    latency: Duration,
    daemon_up: bool,
    /// (device, local, remote)
    forwards: Vec<(String, String, String)>,
    /// broadcast action -> properties it sets
    broadcast_hooks: HashMap<String, Vec<(String, String)>>,
}

type Shared = Arc<Mutex<SimState>>;

fn lock(state: &Shared) -> std::sync::MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Controller for the simulated fleet, used by tests and the `--simulation`
/// stdin console.
#[derive(Clone)]
pub struct Simulator {
    state: Shared,
}

impl Simulator {
    pub fn add_device(&self, device_id: &str, model: &str) {
        let mut state = lock(&self.state);
        match state.devices.get_mut(device_id) {
            Some(device) => {
                device.attached = true;
                device.state = DeviceState::Online;
                device.model = model.to_string();
            }
            None => {
                state.devices.insert(
                    device_id.to_string(),
                    SimDevice {
                        attached: true,
                        state: DeviceState::Online,
                        model: model.to_string(),
                        props: BTreeMap::from([(
                            "ro.product.model".to_string(),
                            model.replace('_', " "),
                        )]),
                        files: BTreeMap::new(),
                        packages: BTreeMap::new(),
                    },
                );
            }
        }
    }

    /// Unplug a device. Its storage is kept, so plugging it back in with
    /// `add_device` resumes where it left off.
    pub fn remove_device(&self, device_id: &str) {
        unplug(&mut lock(&self.state), device_id);
    }

    pub fn set_state(&self, device_id: &str, device_state: DeviceState) {
        let mut state = lock(&self.state);
        if let Some(device) = state.devices.get_mut(device_id) {
            device.state = device_state;
        }
    }

    pub fn set_prop(&self, device_id: &str, key: &str, value: &str) {
        let mut state = lock(&self.state);
        if let Some(device) = state.devices.get_mut(device_id) {
            device.props.insert(key.to_string(), value.to_string());
        }
    }

    pub fn prop(&self, device_id: &str, key: &str) -> Option<String> {
        let state = lock(&self.state);
        state.devices.get(device_id)?.props.get(key).cloned()
    }

    pub fn put_file(&self, device_id: &str, path: &str, contents: Vec<u8>) {
        let mut state = lock(&self.state);
        if let Some(device) = state.devices.get_mut(device_id) {
            device.files.insert(path.to_string(), contents);
        }
    }

    pub fn file(&self, device_id: &str, path: &str) -> Option<Vec<u8>> {
        let state = lock(&self.state);
        state.devices.get(device_id)?.files.get(path).cloned()
    }

    pub fn remove_file(&self, device_id: &str, path: &str) {
        let mut state = lock(&self.state);
        if let Some(device) = state.devices.get_mut(device_id) {
            device.files.remove(path);
        }
    }

    pub fn install_package(&self, device_id: &str, package: &str, version_name: &str, version_code: u64) {
        let mut state = lock(&self.state);
        if let Some(device) = state.devices.get_mut(device_id) {
            device
                .packages
                .insert(package.to_string(), (version_name.to_string(), version_code));
        }
    }

    /// Make the configured start/stop broadcasts flip the web server
    /// properties, as the real application does.
    pub fn install_web_server(&self, config: &WebServerConfig) {
        let running = format!("{}running", config.property_prefix);
        let port = format!("{}port", config.property_prefix);
        let mut state = lock(&self.state);
        state.broadcast_hooks.insert(
            config.start_action.clone(),
            vec![
                (running.clone(), "1".to_string()),
                (port, config.device_port.to_string()),
            ],
        );
        state
            .broadcast_hooks
            .insert(config.stop_action.clone(), vec![(running, "0".to_string())]);
    }

    /// Fail calls whose arguments contain `pattern`.
    ///
    /// `device_id = None` matches calls to any device and to the server.
    /// `count = None` keeps the fault active forever.
    pub fn fail_matching(
        &self,
        device_id: Option<&str>,
        pattern: &str,
        fault: SimFault,
        count: Option<u32>,
    ) {
        lock(&self.state).faults.push(FaultRule {
            device_id: device_id.map(str::to_string),
            pattern: pattern.to_string(),
            fault,
            remaining: count,
        });
    }

    pub fn clear_faults(&self) {
        lock(&self.state).faults.clear();
    }

    /// Delay applied to every call before it runs.
    pub fn set_latency(&self, latency: Duration) {
        lock(&self.state).latency = latency;
    }

    pub fn stop_daemon(&self) {
        lock(&self.state).daemon_up = false;
    }

    pub fn start_daemon(&self) {
        lock(&self.state).daemon_up = true;
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        lock(&self.state).calls.clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.state).calls.clear();
    }
}

fn unplug(state: &mut SimState, device_id: &str) {
    if let Some(device) = state.devices.get_mut(device_id) {
        device.attached = false;
    }
    state.forwards.retain(|(d, _, _)| d != device_id);
}

pub struct SimulatedBridge {
    state: Shared,
}

impl SimulatedBridge {
    pub fn new() -> (Self, Simulator) {
        let state = Arc::new(Mutex::new(SimState {
            devices: BTreeMap::new(),
            faults: Vec::new(),
            calls: Vec::new(),
            latency: Duration::ZERO,
            daemon_up: true,
            forwards: Vec::new(),
            broadcast_hooks: HashMap::new(),
        }));

        (
            Self {
                state: state.clone(),
            },
            Simulator { state },
        )
    }
}

#[async_trait]
impl DeviceBridge for SimulatedBridge {
    async fn run(
        &self,
        device_id: Option<&str>,
        args: &[&str],
        _class: TimeoutClass,
    ) -> Result<BridgeOutput, BridgeError> {
        let started_at = Instant::now();
        let latency = lock(&self.state).latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = lock(&self.state);
        let result = execute(&mut state, device_id, args);
        state.calls.push(CallRecord {
            device_id: device_id.map(str::to_string),
            args: args.iter().map(|a| a.to_string()).collect(),
            started_at,
            finished_at: Instant::now(),
        });
        result
    }
}

fn ok(stdout: impl Into<Vec<u8>>) -> Result<BridgeOutput, BridgeError> {
    Ok(BridgeOutput {
        stdout: stdout.into(),
        stderr: String::new(),
        exit_code: Some(0),
    })
}

fn failed(exit_code: i32, stderr: impl Into<String>) -> Result<BridgeOutput, BridgeError> {
    Err(BridgeError::CommandFailed {
        exit_code: Some(exit_code),
        stderr: stderr.into(),
    })
}

fn take_fault(state: &mut SimState, device_id: Option<&str>, command: &str) -> Option<SimFault> {
    let idx = state.faults.iter().position(|rule| {
        (rule.device_id.is_none() || rule.device_id.as_deref() == device_id)
            && command.contains(&rule.pattern)
    })?;

    let rule = &mut state.faults[idx];
    let fault = rule.fault;
    let exhausted = match rule.remaining.as_mut() {
        Some(remaining) => {
            *remaining = remaining.saturating_sub(1);
            *remaining == 0
        }
        None => false,
    };
    if exhausted {
        state.faults.remove(idx);
    }
    Some(fault)
}

fn execute(
    state: &mut SimState,
    device_id: Option<&str>,
    args: &[&str],
) -> Result<BridgeOutput, BridgeError> {
    let command = args.join(" ");

    if let Some(fault) = take_fault(state, device_id, &command) {
        return match fault {
            SimFault::CommandFailed => failed(1, format!("simulated failure: {}", command)),
            SimFault::Timeout => Err(BridgeError::Timeout {
                command: format!("adb {}", command),
                after: Duration::ZERO,
            }),
            SimFault::Unavailable => Err(BridgeError::Unavailable(
                "cannot connect to daemon".to_string(),
            )),
            SimFault::Disconnect => {
                let id = device_id.unwrap_or_default().to_string();
                unplug(state, &id);
                Err(BridgeError::DeviceNotFound(id))
            }
        };
    }

    if !state.daemon_up {
        return Err(BridgeError::Unavailable(
            "cannot connect to daemon at tcp:5037: Connection refused".to_string(),
        ));
    }

    let Some(device_id) = device_id else {
        return match args {
            ["devices", ..] => ok(list_devices(state)),
            ["version"] => ok("Android Debug Bridge version 1.0.41 (simulated)\n"),
            _ => failed(1, format!("adb: unknown command {}", command)),
        };
    };

    let device_state = match state.devices.get(device_id) {
        Some(device) if device.attached => device.state,
        _ => return Err(BridgeError::DeviceNotFound(device_id.to_string())),
    };
    match device_state {
        DeviceState::Online => {}
        DeviceState::Offline => return Err(BridgeError::DeviceOffline(device_id.to_string())),
        DeviceState::Unauthorized => {
            return Err(BridgeError::DeviceUnauthorized(device_id.to_string()));
        }
    }

    match args {
        ["get-state"] => ok("device\n"),
        ["push", local, remote] => {
            let contents = std::fs::read(local).map_err(|e| BridgeError::CommandFailed {
                exit_code: Some(1),
                stderr: format!("adb: error: cannot stat '{}': {}", local, e),
            })?;
            device_mut(state, device_id)
                .files
                .insert(remote.to_string(), contents);
            ok(format!("{}: 1 file pushed.\n", local))
        }
        ["pull", remote, local] => {
            let Some(contents) = device_mut(state, device_id).files.get(*remote).cloned() else {
                return failed(1, format!("adb: error: remote object '{}' does not exist", remote));
            };
            std::fs::write(Path::new(local), &contents).map_err(|e| {
                BridgeError::CommandFailed {
                    exit_code: Some(1),
                    stderr: format!("adb: error: cannot create '{}': {}", local, e),
                }
            })?;
            ok(format!("{}: 1 file pulled.\n", remote))
        }
        ["exec-out", "screencap", "-p"] => {
            let mut png = PNG_HEADER.to_vec();
            png.extend_from_slice(b"simulated screen");
            ok(png)
        }
        ["reboot"] => ok(""),
        ["forward", "--list"] => {
            let listing: String = state
                .forwards
                .iter()
                .map(|(d, l, r)| format!("{} {} {}\n", d, l, r))
                .collect();
            ok(listing)
        }
        ["forward", "--remove", local] => {
            let before = state.forwards.len();
            state
                .forwards
                .retain(|(d, l, _)| !(d == device_id && l == local));
            if state.forwards.len() == before {
                return failed(1, format!("adb: error: listener '{}' not found", local));
            }
            ok("")
        }
        ["forward", local, remote] => {
            state.forwards.retain(|(_, l, _)| l != local);
            state
                .forwards
                .push((device_id.to_string(), local.to_string(), remote.to_string()));
            ok(format!("{}\n", local.trim_start_matches("tcp:")))
        }
        ["shell", line] => shell(state, device_id, line),
        _ => failed(1, format!("adb: unknown command {}", command)),
    }
}

fn device_mut<'a>(state: &'a mut SimState, device_id: &str) -> &'a mut SimDevice {
    state
        .devices
        .entry(device_id.to_string())
        .or_insert_with(|| SimDevice {
            attached: true,
            state: DeviceState::Online,
            model: String::new(),
            props: BTreeMap::new(),
            files: BTreeMap::new(),
            packages: BTreeMap::new(),
        })
}

fn list_devices(state: &SimState) -> String {
    let mut out = String::from("List of devices attached\n");
    let attached = state.devices.iter().filter(|(_, d)| d.attached);
    for (index, (id, device)) in attached.enumerate() {
        match device.state {
            DeviceState::Online => out.push_str(&format!(
                "{}\tdevice usb:1-{} product:bolt model:{} device:bolt transport_id:{}\n",
                id,
                index + 1,
                device.model,
                index + 1
            )),
            DeviceState::Unauthorized => out.push_str(&format!(
                "{}\tunauthorized usb:1-{} transport_id:{}\n",
                id,
                index + 1,
                index + 1
            )),
            DeviceState::Offline => {
                out.push_str(&format!("{}\toffline transport_id:{}\n", id, index + 1))
            }
        }
    }
    out
}

/// Split a shell line into words, honouring single and double quotes and
/// backslash escapes.
fn tokenize(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_word = true;
            }
            (None, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    in_word = true;
                }
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

fn shell(state: &mut SimState, device_id: &str, line: &str) -> Result<BridgeOutput, BridgeError> {
    let words = tokenize(line);
    let mut stdout = Vec::new();
    for command in words.split(|w| w == "&&") {
        let output = shell_command(state, device_id, command)?;
        stdout.extend(output.stdout);
    }
    ok(stdout)
}

fn shell_command(
    state: &mut SimState,
    device_id: &str,
    words: &[String],
) -> Result<BridgeOutput, BridgeError> {
    let argv: Vec<&str> = words.iter().map(String::as_str).collect();

    match argv.as_slice() {
        ["getprop"] => {
            let device = device_mut(state, device_id);
            let listing: String = device
                .props
                .iter()
                .map(|(k, v)| format!("[{}]: [{}]\n", k, v))
                .collect();
            ok(listing)
        }
        ["getprop", key] => {
            let value = device_mut(state, device_id)
                .props
                .get(*key)
                .cloned()
                .unwrap_or_default();
            ok(format!("{}\n", value))
        }
        ["setprop", key, value] => {
            device_mut(state, device_id)
                .props
                .insert(key.to_string(), value.to_string());
            ok("")
        }
        ["mkdir", "-p", _] => ok(""),
        ["stat", "-c", _, path] => match device_mut(state, device_id).files.get(*path) {
            Some(contents) => ok(format!("{} {}\n", contents.len(), FILE_MTIME)),
            None => failed(1, format!("stat: '{}': No such file or directory", path)),
        },
        ["tar", "-czf", archive, "-C", dir, "."] => {
            let device = device_mut(state, device_id);
            let prefix = format!("{}/", dir.trim_end_matches('/'));
            let entries: BTreeMap<&str, &Vec<u8>> = device
                .files
                .iter()
                .filter_map(|(path, contents)| Some((path.strip_prefix(&prefix)?, contents)))
                .collect();
            if entries.is_empty() {
                return failed(2, format!("tar: {}: Cannot open: No such file or directory", dir));
            }
            let mut bytes = ARCHIVE_MAGIC.to_vec();
            bytes.extend(serde_json::to_vec(&entries).map_err(|e| BridgeError::CommandFailed {
                exit_code: Some(2),
                stderr: e.to_string(),
            })?);
            device.files.insert(archive.to_string(), bytes);
            ok("")
        }
        ["tar", "-xzf", archive, "-C", dir] => {
            let device = device_mut(state, device_id);
            let Some(bytes) = device.files.get(*archive) else {
                return failed(2, format!("tar: {}: Cannot open: No such file or directory", archive));
            };
            let entries: BTreeMap<String, Vec<u8>> = match bytes
                .strip_prefix(ARCHIVE_MAGIC)
                .and_then(|body| serde_json::from_slice(body).ok())
            {
                Some(entries) => entries,
                None => return failed(2, "tar: invalid magic\ntar: short read"),
            };
            for (relative, contents) in entries {
                device
                    .files
                    .insert(format!("{}/{}", dir.trim_end_matches('/'), relative), contents);
            }
            ok("")
        }
        ["mv", from, to] => {
            let device = device_mut(state, device_id);
            match device.files.remove(*from) {
                Some(contents) => {
                    device.files.insert(to.to_string(), contents);
                    ok("")
                }
                None => failed(1, format!("mv: bad '{}': No such file or directory", from)),
            }
        }
        ["rm", "-f", path] => {
            device_mut(state, device_id).files.remove(*path);
            ok("")
        }
        ["rm", "-rf", path] => {
            let device = device_mut(state, device_id);
            let prefix = match path.strip_suffix("/*") {
                Some(dir) => format!("{}/", dir),
                None => {
                    device.files.remove(*path);
                    format!("{}/", path.trim_end_matches('/'))
                }
            };
            device.files.retain(|p, _| !p.starts_with(&prefix));
            ok("")
        }
        ["sh", "-c", inner] => shell(state, device_id, inner),
        ["dumpsys", "package", package] => match device_mut(state, device_id).packages.get(*package) {
            Some((name, code)) => ok(format!(
                "Packages:\n  Package [{}] (5f2a1c0):\n    versionCode={} minSdk=21 targetSdk=28\n    versionName={}\n    firstInstallTime=2024-01-01 00:00:00\n    lastUpdateTime=2024-01-01 00:00:00\n",
                package, code, name
            )),
            None => ok(format!("Unable to find package: {}\n", package)),
        },
        ["am", "force-stop", _] => ok(""),
        ["am", "broadcast", "-a", action] => {
            if let Some(props) = state.broadcast_hooks.get(*action).cloned() {
                device_mut(state, device_id).props.extend(props);
            }
            ok(format!(
                "Broadcasting: Intent {{ act={} }}\nBroadcast completed: result=0\n",
                action
            ))
        }
        ["monkey", "-p", _, ..] => ok("Events injected: 1\n"),
        [] => ok(""),
        [program, ..] => failed(127, format!("/system/bin/sh: {}: not found", program)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bridge::parse_device_list;

    #[test]
    fn test_tokenize_quotes() {
        assert_eq!(
            tokenize(r#"sh -c 'rm -rf /sdcard/cache/*'"#),
            vec!["sh", "-c", "rm -rf /sdcard/cache/*"]
        );
        assert_eq!(tokenize(r"stat -c '%s %Y' 'my map.map'"), vec!["stat", "-c", "%s %Y", "my map.map"]);
        assert_eq!(tokenize(r"echo 'it'\''s'"), vec!["echo", "it's"]);
        assert_eq!(tokenize(r#"echo "a \"b\"""#), vec!["echo", r#"a "b""#]);
    }

    #[tokio::test]
    async fn test_device_listing_parses() {
        let (bridge, sim) = SimulatedBridge::new();
        sim.add_device("R5CT1", "ELEMNT_BOLT");
        sim.add_device("R6XY2", "ELEMNT_ROAM");
        sim.set_state("R6XY2", DeviceState::Unauthorized);

        let output = bridge
            .run(None, &["devices", "-l"], TimeoutClass::Short)
            .await
            .unwrap();
        let devices = parse_device_list(&output.stdout_text());
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].model.as_deref(), Some("ELEMNT_BOLT"));
        assert_eq!(devices[1].state, DeviceState::Unauthorized);
    }

    #[tokio::test]
    async fn test_removed_device_is_not_found_and_unlisted() {
        let (bridge, sim) = SimulatedBridge::new();
        sim.add_device("R5CT1", "ELEMNT_BOLT");
        sim.put_file("R5CT1", "/sdcard/maps/a.map", b"a".to_vec());
        sim.remove_device("R5CT1");

        let err = bridge
            .run(Some("R5CT1"), &["get-state"], TimeoutClass::Short)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::DeviceNotFound(_)));

        let output = bridge
            .run(None, &["devices", "-l"], TimeoutClass::Short)
            .await
            .unwrap();
        assert!(parse_device_list(&output.stdout_text()).is_empty());

        sim.add_device("R5CT1", "ELEMNT_BOLT");
        assert!(sim.file("R5CT1", "/sdcard/maps/a.map").is_some());
    }

    #[tokio::test]
    async fn test_fault_count_is_consumed() {
        let (bridge, sim) = SimulatedBridge::new();
        sim.add_device("R5CT1", "ELEMNT_BOLT");
        sim.fail_matching(Some("R5CT1"), "getprop", SimFault::Timeout, Some(1));

        let first = bridge.shell("R5CT1", "getprop", TimeoutClass::Short).await;
        assert!(matches!(first, Err(BridgeError::Timeout { .. })));
        let second = bridge.shell("R5CT1", "getprop", TimeoutClass::Short).await;
        assert!(second.is_ok());
        assert_eq!(sim.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_stopped_daemon_is_unavailable() {
        let (bridge, sim) = SimulatedBridge::new();
        sim.stop_daemon();
        let err = bridge
            .run(None, &["devices", "-l"], TimeoutClass::Short)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_tar_round_trip_restores_tree() {
        let (bridge, sim) = SimulatedBridge::new();
        sim.add_device("R5CT1", "ELEMNT_BOLT");
        sim.put_file("R5CT1", "/sdcard/elemnt/a.json", b"a".to_vec());

        bridge
            .shell("R5CT1", "tar -czf /sdcard/b.tgz -C /sdcard/elemnt .", TimeoutClass::Long)
            .await
            .unwrap();
        sim.remove_file("R5CT1", "/sdcard/elemnt/a.json");
        bridge
            .shell(
                "R5CT1",
                "mkdir -p /sdcard/elemnt && tar -xzf /sdcard/b.tgz -C /sdcard/elemnt",
                TimeoutClass::Long,
            )
            .await
            .unwrap();
        assert_eq!(sim.file("R5CT1", "/sdcard/elemnt/a.json").unwrap(), b"a");
    }

    #[tokio::test]
    async fn test_unknown_shell_command_fails() {
        let (bridge, sim) = SimulatedBridge::new();
        sim.add_device("R5CT1", "ELEMNT_BOLT");
        let err = bridge
            .shell("R5CT1", "frobnicate", TimeoutClass::Short)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::CommandFailed { exit_code: Some(127), .. }));
    }
}

use std::sync::Arc;

use tracing::info;

use crate::config::AppConfig;
use crate::core::bridge::DeviceBridge;
use crate::core::models::DeviceState;

mod adb;
mod simulated;

pub use adb::{AdbBridge, classify_failure};
pub use simulated::{CallRecord, SimFault, SimulatedBridge, Simulator};

/// Build the bridge for this run.
///
/// In simulation mode the fleet starts empty and is driven from stdin.
pub fn get_bridge(config: &AppConfig) -> Arc<dyn DeviceBridge> {
    if config.simulation {
        let (bridge, controller) = SimulatedBridge::new();
        controller.install_web_server(&config.web_server);
        info!("Simulation mode: type 'help' for simulator commands");

        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lines() {
                if let Ok(cmd) = line {
                    run_console_command(&controller, &cmd);
                }
            }
        });

        return Arc::new(bridge);
    }

    Arc::new(AdbBridge::new(
        config.adb_path.clone(),
        config.timeouts.clone(),
    ))
}

fn run_console_command(controller: &Simulator, cmd: &str) {
    let parts: Vec<&str> = cmd.split_whitespace().collect();
    match parts.as_slice() {
        ["add", id] => controller.add_device(id, "ELEMNT_BOLT"),
        ["add", id, model] => controller.add_device(id, model),
        ["rm", id] => controller.remove_device(id),
        ["state", id, state] => {
            let state = match *state {
                "online" => DeviceState::Online,
                "unauthorized" => DeviceState::Unauthorized,
                _ => DeviceState::Offline,
            };
            controller.set_state(id, state);
        }
        ["prop", id, key, value] => controller.set_prop(id, key, value),
        ["file", id, path, contents @ ..] => {
            controller.put_file(id, path, contents.join(" ").into_bytes())
        }
        ["pkg", id, package, version] => controller.install_package(id, package, version, 1),
        ["fail", id, pattern] => controller.fail_matching(Some(*id), pattern, SimFault::CommandFailed, Some(1)),
        ["unplug-on", id, pattern] => controller.fail_matching(Some(*id), pattern, SimFault::Disconnect, Some(1)),
        ["heal"] => controller.clear_faults(),
        ["latency", ms] => match ms.parse() {
            Ok(ms) => controller.set_latency(std::time::Duration::from_millis(ms)),
            Err(_) => println!("(Simulator) latency takes milliseconds"),
        },
        ["daemon", "stop"] => controller.stop_daemon(),
        ["daemon", "start"] => controller.start_daemon(),
        _ => println!(
            "(Simulator) Use: 'add <id> [model]', 'rm <id>', 'state <id> online|offline|unauthorized', \
             'prop <id> <key> <value>', 'file <id> <path> <text>', 'pkg <id> <package> <version>', \
             'fail <id> <pattern>', 'unplug-on <id> <pattern>', 'heal', 'latency <ms>', 'daemon stop|start'"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_commands_drive_simulator() {
        let (_bridge, sim) = SimulatedBridge::new();
        run_console_command(&sim, "add R5CT1");
        run_console_command(&sim, "prop R5CT1 persist.elemnt.feature.routing 1");
        run_console_command(&sim, "file R5CT1 /sdcard/maps/a.map hello world");

        assert_eq!(
            sim.prop("R5CT1", "persist.elemnt.feature.routing").as_deref(),
            Some("1")
        );
        assert_eq!(sim.file("R5CT1", "/sdcard/maps/a.map").unwrap(), b"hello world");
    }

    #[test]
    fn test_real_bridge_outside_simulation() {
        let config = AppConfig::default();
        // constructing the real bridge must not spawn anything
        let _bridge = get_bridge(&config);
    }
}

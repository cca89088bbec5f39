//! The live device set.
//!
//! Reconciliation passes diff `adb devices -l` against the known set. A
//! device that drops out of one pass is kept as `Offline`; it is only
//! removed after a second consecutive miss.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::bridge::{DeviceBridge, TimeoutClass, parse_device_list};
use super::error::OrchestratorError;
use super::events::{EventBus, OrchestratorEvent};
use super::locks::DeviceLocks;
use super::models::{Device, DeviceState, FeatureId};
use crate::logging::LogThrottle;

struct Entry {
    device: Device,
    /// Consecutive passes this device was absent from
    missed_passes: u8,
}

#[derive(Default)]
struct RegistryState {
    devices: BTreeMap<String, Entry>,
    last_pass: Option<Instant>,
}

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

pub struct DeviceRegistry {
    bridge: Arc<dyn DeviceBridge>,
    events: EventBus,
    locks: DeviceLocks,
    interval: Duration,
    state: RwLock<RegistryState>,
    refresh: Notify,
}

impl DeviceRegistry {
    pub fn new(
        bridge: Arc<dyn DeviceBridge>,
        events: EventBus,
        locks: DeviceLocks,
        interval: Duration,
    ) -> Self {
        Self {
            bridge,
            events,
            locks,
            interval,
            state: RwLock::new(RegistryState::default()),
            refresh: Notify::new(),
        }
    }

    /// Run one reconciliation pass.
    ///
    /// A bridge failure leaves the known set untouched and does not count
    /// as a pass.
    pub async fn reconcile(&self) -> Result<ReconcileSummary, OrchestratorError> {
        let output = self
            .bridge
            .run(None, &["devices", "-l"], TimeoutClass::Short)
            .await?;
        let listings = parse_device_list(&output.stdout_text());

        let mut summary = ReconcileSummary::default();
        let mut events = Vec::new();
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let seen: HashSet<&str> = listings.iter().map(|l| l.serial.as_str()).collect();

            for listing in &listings {
                match state.devices.get_mut(&listing.serial) {
                    Some(entry) => {
                        entry.missed_passes = 0;
                        entry.device.display_name = listing.display_name();
                        if entry.device.state != listing.state {
                            events.push(OrchestratorEvent::DeviceStateChanged {
                                device_id: listing.serial.clone(),
                                from: entry.device.state,
                                to: listing.state,
                            });
                            entry.device.state = listing.state;
                            summary.changed.push(listing.serial.clone());
                        }
                    }
                    None => {
                        let device = Device {
                            id: listing.serial.clone(),
                            display_name: listing.display_name(),
                            state: listing.state,
                            capabilities: BTreeSet::new(),
                        };
                        events.push(OrchestratorEvent::DeviceAdded {
                            device: device.clone(),
                        });
                        state.devices.insert(
                            listing.serial.clone(),
                            Entry {
                                device,
                                missed_passes: 0,
                            },
                        );
                        summary.added.push(listing.serial.clone());
                    }
                }
            }

            let missing: Vec<String> = state
                .devices
                .keys()
                .filter(|id| !seen.contains(id.as_str()))
                .cloned()
                .collect();

            for id in missing {
                let remove = match state.devices.get_mut(&id) {
                    Some(entry) if entry.missed_passes == 0 => {
                        entry.missed_passes = 1;
                        if entry.device.state != DeviceState::Offline {
                            events.push(OrchestratorEvent::DeviceStateChanged {
                                device_id: id.clone(),
                                from: entry.device.state,
                                to: DeviceState::Offline,
                            });
                            entry.device.state = DeviceState::Offline;
                            summary.changed.push(id.clone());
                        }
                        false
                    }
                    Some(_) => true,
                    None => false,
                };

                if remove {
                    state.devices.remove(&id);
                    events.push(OrchestratorEvent::DeviceRemoved {
                        device_id: id.clone(),
                    });
                    summary.removed.push(id);
                }
            }

            state.last_pass = Some(Instant::now());
        }

        for id in &summary.removed {
            self.locks.forget(id);
        }
        for event in events {
            self.events.emit(event);
        }

        if summary != ReconcileSummary::default() {
            info!(
                added = summary.added.len(),
                removed = summary.removed.len(),
                changed = summary.changed.len(),
                "Device set changed"
            );
        }

        Ok(summary)
    }

    /// Snapshot of the known devices, sorted by id.
    ///
    /// Never waits on the bridge. A stale snapshot nudges the
    /// reconciliation loop to run early.
    pub fn list_devices(&self) -> Vec<Device> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let stale = state
            .last_pass
            .is_none_or(|at| at.elapsed() >= self.interval);
        if stale {
            self.refresh.notify_one();
        }
        state.devices.values().map(|e| e.device.clone()).collect()
    }

    /// The device as reported by the last pass.
    pub fn get_device(&self, device_id: &str) -> Result<Device, OrchestratorError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .devices
            .get(device_id)
            .filter(|entry| entry.missed_passes == 0)
            .map(|entry| entry.device.clone())
            .ok_or_else(|| OrchestratorError::DeviceNotFound {
                device_id: device_id.to_string(),
            })
    }

    pub fn set_capabilities(&self, device_id: &str, capabilities: BTreeSet<FeatureId>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = state.devices.get_mut(device_id) {
            entry.device.capabilities = capabilities;
        }
    }

    /// Ask the loop for an out-of-band pass.
    pub fn request_refresh(&self) {
        self.refresh.notify_one();
    }

    /// Periodic reconciliation until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Device registry started");
        let error_throttle = LogThrottle::new(Duration::from_secs(60));

        loop {
            match self.reconcile().await {
                Ok(_) => error_throttle.reset(),
                Err(e) => {
                    if let Some(suppressed) = error_throttle.admit() {
                        warn!(error = %e, suppressed, "Device enumeration failed");
                    } else {
                        debug!(error = %e, "Device enumeration failed");
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.refresh.notified() => debug!("Out-of-band device refresh"),
                _ = shutdown.cancelled() => break,
            }
        }

        info!("Device registry stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{SimFault, SimulatedBridge, Simulator};

    fn registry() -> (DeviceRegistry, Simulator, EventBus) {
        let (bridge, sim) = SimulatedBridge::new();
        let events = EventBus::new(64);
        let registry = DeviceRegistry::new(
            Arc::new(bridge),
            events.clone(),
            DeviceLocks::new(),
            Duration::from_secs(3),
        );
        (registry, sim, events)
    }

    #[tokio::test]
    async fn test_new_device_is_added() {
        let (registry, sim, events) = registry();
        let mut rx = events.subscribe();
        sim.add_device("R5CT1", "ELEMNT_BOLT");

        let summary = registry.reconcile().await.unwrap();
        assert_eq!(summary.added, vec!["R5CT1".to_string()]);

        let device = registry.get_device("R5CT1").unwrap();
        assert_eq!(device.display_name, "ELEMNT BOLT");
        assert_eq!(device.state, DeviceState::Online);
        assert!(matches!(
            rx.try_recv().unwrap(),
            OrchestratorEvent::DeviceAdded { .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_device_not_found() {
        let (registry, _sim, _) = registry();
        registry.reconcile().await.unwrap();
        let err = registry.get_device("nope").unwrap_err();
        assert_eq!(
            err,
            OrchestratorError::DeviceNotFound {
                device_id: "nope".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_removal_is_debounced_over_two_passes() {
        let (registry, sim, _) = registry();
        sim.add_device("R5CT1", "ELEMNT_BOLT");
        registry.reconcile().await.unwrap();

        sim.remove_device("R5CT1");
        let first = registry.reconcile().await.unwrap();
        assert!(first.removed.is_empty());
        let listed = registry.list_devices();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].state, DeviceState::Offline);
        assert!(registry.get_device("R5CT1").is_err());

        let second = registry.reconcile().await.unwrap();
        assert_eq!(second.removed, vec!["R5CT1".to_string()]);
        assert!(registry.list_devices().is_empty());
    }

    #[tokio::test]
    async fn test_reappearing_device_resumes_entity() {
        let (registry, sim, _) = registry();
        sim.add_device("R5CT1", "ELEMNT_BOLT");
        registry.reconcile().await.unwrap();
        registry.set_capabilities("R5CT1", BTreeSet::from(["routing".to_string()]));

        sim.remove_device("R5CT1");
        registry.reconcile().await.unwrap();
        sim.add_device("R5CT1", "ELEMNT_BOLT");
        let summary = registry.reconcile().await.unwrap();

        assert!(summary.added.is_empty());
        let device = registry.get_device("R5CT1").unwrap();
        assert_eq!(device.state, DeviceState::Online);
        assert!(device.capabilities.contains("routing"));
    }

    #[tokio::test]
    async fn test_unauthorized_becomes_online() {
        let (registry, sim, events) = registry();
        sim.add_device("R5CT1", "ELEMNT_BOLT");
        sim.set_state("R5CT1", DeviceState::Unauthorized);
        registry.reconcile().await.unwrap();
        assert_eq!(
            registry.get_device("R5CT1").unwrap().state,
            DeviceState::Unauthorized
        );

        let mut rx = events.subscribe();
        sim.set_state("R5CT1", DeviceState::Online);
        registry.reconcile().await.unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            OrchestratorEvent::DeviceStateChanged {
                device_id: "R5CT1".to_string(),
                from: DeviceState::Unauthorized,
                to: DeviceState::Online,
            }
        );
    }

    #[tokio::test]
    async fn test_bridge_error_does_not_count_as_pass() {
        let (registry, sim, _) = registry();
        sim.add_device("R5CT1", "ELEMNT_BOLT");
        registry.reconcile().await.unwrap();

        sim.fail_matching(None, "devices", SimFault::Unavailable, Some(2));
        assert!(registry.reconcile().await.is_err());
        assert!(registry.reconcile().await.is_err());

        assert_eq!(
            registry.get_device("R5CT1").unwrap().state,
            DeviceState::Online
        );
    }

    #[tokio::test]
    async fn test_list_devices_sorted() {
        let (registry, sim, _) = registry();
        sim.add_device("ZZZ", "ELEMNT_ROAM");
        sim.add_device("AAA", "ELEMNT_BOLT");
        registry.reconcile().await.unwrap();
        let ids: Vec<_> = registry.list_devices().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["AAA", "ZZZ"]);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (registry, sim, _) = registry();
        sim.add_device("R5CT1", "ELEMNT_BOLT");
        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();

        let run = async {
            registry.run(shutdown).await;
        };
        let stop = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stopper.cancel();
        };
        tokio::time::timeout(Duration::from_secs(2), async { tokio::join!(run, stop) })
            .await
            .unwrap();
        assert!(registry.get_device("R5CT1").is_ok());
    }
}

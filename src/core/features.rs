//! Per-device feature flags, stored as system properties.
//!
//! The device is the only source of truth: every read issues a fresh
//! `getprop`, and nothing here caches the enabled state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::bridge::{DeviceBridge, TimeoutClass, parse_getprop, parse_prop_bool};
use super::error::{ItemFailure, OrchestratorError};
use super::models::{Feature, FeatureId};
use crate::config::FeatureConfig;

static FEATURE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("feature id regex is valid"));

/// Features as read from the device, plus which of them have a property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSnapshot {
    pub features: Vec<Feature>,
    pub capabilities: BTreeSet<FeatureId>,
}

/// Outcome of a batch save. Every changed feature was attempted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveReport {
    pub updated: Vec<FeatureId>,
    pub unchanged: Vec<FeatureId>,
    pub failed: Vec<ItemFailure>,
}

impl SaveReport {
    pub fn into_result(self) -> Result<SaveReport, OrchestratorError> {
        if self.failed.is_empty() {
            return Ok(self);
        }
        let mut succeeded = self.updated;
        succeeded.extend(self.unchanged);
        Err(OrchestratorError::PartialFailure {
            succeeded,
            failed: self.failed,
        })
    }
}

pub fn validate_feature_id(feature_id: &str) -> Result<(), OrchestratorError> {
    if FEATURE_ID.is_match(feature_id) {
        Ok(())
    } else {
        Err(OrchestratorError::invalid(format!(
            "invalid feature id '{}'",
            feature_id
        )))
    }
}

pub struct FeatureStore {
    bridge: Arc<dyn DeviceBridge>,
    config: FeatureConfig,
}

impl FeatureStore {
    pub fn new(bridge: Arc<dyn DeviceBridge>, config: FeatureConfig) -> Self {
        Self { bridge, config }
    }

    fn property(&self, feature_id: &str) -> String {
        format!("{}{}", self.config.property_prefix, feature_id)
    }

    /// Read every feature from the device, sorted by id.
    ///
    /// Catalog features are always present (a missing property reads as
    /// disabled). Unknown properties under the prefix are listed too.
    pub async fn read_features(&self, device_id: &str) -> Result<FeatureSnapshot, OrchestratorError> {
        let output = self
            .bridge
            .shell(device_id, "getprop", TimeoutClass::Short)
            .await?;
        let props = parse_getprop(&output.stdout_text());

        let mut features: BTreeMap<FeatureId, Feature> = self
            .config
            .catalog
            .iter()
            .map(|def| {
                (
                    def.id.clone(),
                    Feature {
                        id: def.id.clone(),
                        name: def.name.clone(),
                        enabled: false,
                    },
                )
            })
            .collect();
        let mut capabilities = BTreeSet::new();

        for (key, value) in &props {
            let Some(id) = key.strip_prefix(&self.config.property_prefix) else {
                continue;
            };
            if validate_feature_id(id).is_err() {
                debug!(property = %key, "Ignoring malformed feature property");
                continue;
            }
            capabilities.insert(id.to_string());
            features
                .entry(id.to_string())
                .or_insert_with(|| Feature {
                    id: id.to_string(),
                    name: id.to_string(),
                    enabled: false,
                })
                .enabled = parse_prop_bool(value);
        }

        Ok(FeatureSnapshot {
            features: features.into_values().collect(),
            capabilities,
        })
    }

    pub async fn get_features(&self, device_id: &str) -> Result<Vec<Feature>, OrchestratorError> {
        Ok(self.read_features(device_id).await?.features)
    }

    /// Write one feature with a single `setprop`.
    pub async fn set_feature(
        &self,
        device_id: &str,
        feature_id: &str,
        enabled: bool,
    ) -> Result<(), OrchestratorError> {
        validate_feature_id(feature_id)?;

        let command = format!(
            "setprop {} {}",
            self.property(feature_id),
            if enabled { "1" } else { "0" }
        );
        self.bridge
            .shell(device_id, &command, TimeoutClass::Short)
            .await
            .map_err(|e| {
                let err = OrchestratorError::from(e);
                match err {
                    OrchestratorError::DeviceUnauthorized { .. } => err,
                    _ if err.is_device_gone() => err,
                    _ => OrchestratorError::FeatureError {
                        feature_id: feature_id.to_string(),
                        cause: err.to_string(),
                    },
                }
            })?;

        info!(device_id, feature_id, enabled, "Feature written");
        Ok(())
    }

    /// Bring the device in line with `desired`, writing only what differs.
    ///
    /// Writes are independent; one failing does not stop the others.
    pub async fn save_features(
        &self,
        device_id: &str,
        desired: &BTreeMap<FeatureId, bool>,
    ) -> Result<SaveReport, OrchestratorError> {
        let current: BTreeMap<FeatureId, bool> = self
            .get_features(device_id)
            .await?
            .into_iter()
            .map(|f| (f.id, f.enabled))
            .collect();

        let mut report = SaveReport::default();
        for (feature_id, &enabled) in desired {
            if current.get(feature_id).copied().unwrap_or(false) == enabled {
                report.unchanged.push(feature_id.clone());
                continue;
            }
            match self.set_feature(device_id, feature_id, enabled).await {
                Ok(()) => report.updated.push(feature_id.clone()),
                Err(e) => {
                    warn!(device_id, feature_id = %feature_id, error = %e, "Feature write failed");
                    report.failed.push(ItemFailure {
                        item: feature_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        debug!(
            device_id,
            updated = report.updated.len(),
            unchanged = report.unchanged.len(),
            failed = report.failed.len(),
            "Features saved"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{SimFault, SimulatedBridge, Simulator};
    use crate::config::AppConfig;

    fn store() -> (FeatureStore, Simulator) {
        let (bridge, sim) = SimulatedBridge::new();
        sim.add_device("R5CT1", "ELEMNT_BOLT");
        let store = FeatureStore::new(Arc::new(bridge), AppConfig::default().features);
        (store, sim)
    }

    fn setprop_calls(sim: &Simulator) -> usize {
        sim.calls()
            .iter()
            .filter(|c| c.args.iter().any(|a| a.starts_with("setprop")))
            .count()
    }

    #[tokio::test]
    async fn test_catalog_features_always_listed() {
        let (store, sim) = store();
        sim.set_prop("R5CT1", "persist.elemnt.feature.routing", "1");
        sim.set_prop("R5CT1", "persist.elemnt.feature.beta-climb", "true");

        let snapshot = store.read_features("R5CT1").await.unwrap();
        let ids: Vec<_> = snapshot.features.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "beta-climb",
                "custom-themes",
                "developer-mode",
                "offline-maps",
                "routing",
                "web-server"
            ]
        );
        let extra = &snapshot.features[0];
        assert_eq!(extra.name, "beta-climb");
        assert!(extra.enabled);
        assert!(!snapshot.features[3].enabled);
        assert_eq!(
            snapshot.capabilities,
            BTreeSet::from(["beta-climb".to_string(), "routing".to_string()])
        );
    }

    #[tokio::test]
    async fn test_identical_save_issues_no_writes() {
        let (store, sim) = store();
        sim.set_prop("R5CT1", "persist.elemnt.feature.routing", "1");

        let desired = BTreeMap::from([
            ("routing".to_string(), true),
            ("offline-maps".to_string(), false),
        ]);
        let report = store.save_features("R5CT1", &desired).await.unwrap();
        assert!(report.updated.is_empty());
        assert_eq!(report.unchanged.len(), 2);
        assert_eq!(setprop_calls(&sim), 0);
    }

    #[tokio::test]
    async fn test_single_change_single_write() {
        let (store, sim) = store();
        let desired = BTreeMap::from([
            ("offline-maps".to_string(), true),
            ("routing".to_string(), false),
        ]);
        let report = store.save_features("R5CT1", &desired).await.unwrap();
        assert_eq!(report.updated, vec!["offline-maps".to_string()]);
        assert_eq!(setprop_calls(&sim), 1);
        assert_eq!(
            sim.prop("R5CT1", "persist.elemnt.feature.offline-maps").as_deref(),
            Some("1")
        );
    }

    #[tokio::test]
    async fn test_failed_write_does_not_stop_others() {
        let (store, sim) = store();
        sim.fail_matching(
            Some("R5CT1"),
            "persist.elemnt.feature.developer-mode",
            SimFault::CommandFailed,
            None,
        );
        let desired = BTreeMap::from([
            ("developer-mode".to_string(), true),
            ("routing".to_string(), true),
        ]);
        let report = store.save_features("R5CT1", &desired).await.unwrap();
        assert_eq!(report.updated, vec!["routing".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].item, "developer-mode");

        let err = report.into_result().unwrap_err();
        assert!(matches!(err, OrchestratorError::PartialFailure { .. }));
    }

    #[tokio::test]
    async fn test_set_feature_rejects_unsafe_id() {
        let (store, sim) = store();
        let err = store
            .set_feature("R5CT1", "x; reboot", true)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
        assert!(sim.calls().is_empty());
    }

    #[tokio::test]
    async fn test_set_feature_wraps_command_failure() {
        let (store, sim) = store();
        sim.fail_matching(Some("R5CT1"), "setprop", SimFault::CommandFailed, Some(1));
        let err = store.set_feature("R5CT1", "routing", true).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::FeatureError { ref feature_id, .. } if feature_id == "routing"));
    }

    #[tokio::test]
    async fn test_missing_device_passes_through() {
        let (store, _sim) = store();
        let err = store.set_feature("GONE", "routing", true).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::DeviceNotFound { .. }));
    }
}

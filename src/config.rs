//! Layered configuration.
//!
//! Precedence, lowest first: built-in defaults, the TOML config file,
//! `ELEMNTARY_*` environment variables (`__` separates nested keys), and
//! finally command line flags.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::core::bridge::TimeoutClass;

pub const DEFAULT_CONFIG_PATH: &str = "elemntary.toml";
const ENV_PREFIX: &str = "ELEMNTARY_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub adb_path: PathBuf,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
    pub rpc_bind: SocketAddr,
    pub web_bind: SocketAddr,
    pub database_path: PathBuf,
    pub screenshot_directory: PathBuf,
    pub backup_directory: PathBuf,
    pub reconcile_interval_secs: u64,
    pub timeouts: TimeoutConfig,
    pub device: DeviceLayout,
    pub web_server: WebServerConfig,
    pub features: FeatureConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub short_secs: u64,
    pub long_secs: u64,
}

impl TimeoutConfig {
    pub fn for_class(&self, class: TimeoutClass) -> Duration {
        match class {
            TimeoutClass::Short => Duration::from_secs(self.short_secs),
            TimeoutClass::Long => Duration::from_secs(self.long_secs),
        }
    }
}

/// Where things live on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLayout {
    pub package: String,
    pub maps_dir: String,
    pub routing_dir: String,
    pub themes_dir: String,
    pub cache_dir: String,
    /// Directory archived by a backup and restored by an upload
    pub data_dir: String,
    pub backup_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebServerConfig {
    pub property_prefix: String,
    pub start_action: String,
    pub stop_action: String,
    pub device_port: u16,
    pub local_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub property_prefix: String,
    pub catalog: Vec<FeatureDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureDefinition {
    pub id: String,
    pub name: String,
}

impl FeatureDefinition {
    fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            adb_path: PathBuf::from("adb"),
            simulation: false,
            verbose: false,
            json_logs: false,
            rpc_bind: SocketAddr::from(([127, 0, 0, 1], 7420)),
            web_bind: SocketAddr::from(([127, 0, 0, 1], 7421)),
            database_path: PathBuf::from("elemntary.db"),
            screenshot_directory: PathBuf::from("screenshots"),
            backup_directory: PathBuf::from("backups"),
            reconcile_interval_secs: 3,
            timeouts: TimeoutConfig {
                short_secs: 15,
                long_secs: 30 * 60,
            },
            device: DeviceLayout {
                package: "com.wahoofitness.bolt".to_string(),
                maps_dir: "/sdcard/maps".to_string(),
                routing_dir: "/sdcard/routing".to_string(),
                themes_dir: "/sdcard/themes".to_string(),
                cache_dir: "/sdcard/Android/data/com.wahoofitness.bolt/cache".to_string(),
                data_dir: "/sdcard/elemnt".to_string(),
                backup_path: "/sdcard/elemntary/backup.tar.gz".to_string(),
            },
            web_server: WebServerConfig {
                property_prefix: "persist.elemnt.webserver.".to_string(),
                start_action: "com.wahoofitness.bolt.debug.START_WEB_SERVER".to_string(),
                stop_action: "com.wahoofitness.bolt.debug.STOP_WEB_SERVER".to_string(),
                device_port: 8080,
                local_port: 8080,
            },
            features: FeatureConfig {
                property_prefix: "persist.elemnt.feature.".to_string(),
                catalog: vec![
                    FeatureDefinition::new("offline-maps", "Offline maps"),
                    FeatureDefinition::new("routing", "Turn-by-turn routing"),
                    FeatureDefinition::new("custom-themes", "Custom themes"),
                    FeatureDefinition::new("web-server", "Debug web server"),
                    FeatureDefinition::new("developer-mode", "Developer mode"),
                ],
            },
        }
    }
}

impl AppConfig {
    /// Build the configuration from the default config file location.
    pub fn new<T: Serialize>(cli_args: Option<&T>) -> Result<Self> {
        Self::load(Path::new(DEFAULT_CONFIG_PATH), cli_args)
    }

    /// Build the configuration, reading `config_path` if it exists.
    ///
    /// `cli_args` is merged last; fields it serializes override everything
    /// else, so flags that were not given must be skipped during
    /// serialization.
    pub fn load<T: Serialize>(config_path: &Path, cli_args: Option<&T>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(args) = cli_args {
            figment = figment.merge(Serialized::defaults(args));
        }

        figment
            .extract()
            .with_context(|| format!("Invalid configuration (file: {})", config_path.display()))
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    /// Render this configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Write the configuration to `path`, refusing to clobber unless `force`.
    pub fn write_to(&self, path: &Path, force: bool) -> Result<()> {
        if path.exists() && !force {
            anyhow::bail!(
                "Config file already exists: {}. Use --force to overwrite.",
                path.display()
            );
        }
        std::fs::write(path, self.to_toml()?)
            .with_context(|| format!("Failed to write config file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[derive(Serialize)]
    struct Flags {
        #[serde(skip_serializing_if = "Option::is_none")]
        verbose: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        adb_path: Option<PathBuf>,
    }

    #[test]
    fn test_defaults_without_file() {
        Jail::expect_with(|_jail| {
            let config = AppConfig::load(Path::new("missing.toml"), None::<&Flags>).unwrap();
            assert_eq!(config, AppConfig::default());
            Ok(())
        });
    }

    #[test]
    fn test_file_env_and_flags_layer_in_order() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "elemntary.toml",
                r#"
                    adb_path = "/opt/platform-tools/adb"
                    reconcile_interval_secs = 10

                    [timeouts]
                    short_secs = 5
                    long_secs = 600
                "#,
            )?;
            jail.set_env("ELEMNTARY_RECONCILE_INTERVAL_SECS", "20");
            jail.set_env("ELEMNTARY_DEVICE__PACKAGE", "com.example.app");

            let flags = Flags {
                verbose: Some(true),
                adb_path: None,
            };
            let config = AppConfig::load(Path::new("elemntary.toml"), Some(&flags)).unwrap();

            assert_eq!(config.adb_path, PathBuf::from("/opt/platform-tools/adb"));
            assert_eq!(config.reconcile_interval_secs, 20);
            assert_eq!(config.device.package, "com.example.app");
            assert_eq!(config.timeouts.short_secs, 5);
            assert!(config.verbose);
            // untouched nested defaults survive a partial section
            assert_eq!(config.device.maps_dir, "/sdcard/maps");
            Ok(())
        });
    }

    #[test]
    fn test_toml_round_trip_and_write_refuses_overwrite() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("elemntary.toml");

        let config = AppConfig::default();
        config.write_to(&path, false).unwrap();
        assert!(config.write_to(&path, false).is_err());
        config.write_to(&path, true).unwrap();

        let loaded = AppConfig::load(&path, None::<&Flags>).unwrap();
        assert_eq!(loaded.features.catalog, config.features.catalog);
    }

    #[test]
    fn test_timeout_classes() {
        let timeouts = TimeoutConfig {
            short_secs: 3,
            long_secs: 90,
        };
        assert_eq!(timeouts.for_class(TimeoutClass::Short), Duration::from_secs(3));
        assert_eq!(timeouts.for_class(TimeoutClass::Long), Duration::from_secs(90));
    }
}

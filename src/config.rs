//! YAML configuration model.
//!
//! The configuration file has five recognised top-level sections: `mqtt`,
//! `devices`, `system`, `database` and `auto_mode`. Every scalar carries a
//! default so that a minimal file only needs the broker address and the
//! device list. Validation happens once at load time and is fatal: a
//! supervisor with a bad threshold ordering or an empty fleet must not start.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::device::DeviceKind;
use crate::error::{Error, Result};

/// MQTT broker connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// Broker host name or IP address.
    pub broker: String,
    /// Broker TCP port.
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Base client identifier; a timestamp and random suffix are appended.
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Optional username.
    #[serde(default)]
    pub username: Option<String>,
    /// Optional password.
    #[serde(default)]
    pub password: Option<String>,
    /// Keepalive interval in seconds.
    #[serde(default = "default_keepalive")]
    pub keepalive: u64,
    /// Topic prefix for everything the supervisor publishes and subscribes.
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
    /// Number of parallel publish workers.
    #[serde(default = "default_publish_workers")]
    pub max_publish_workers: usize,
    /// Maximum consecutive reconnect attempts before waiting for the
    /// health check to trigger a new round.
    #[serde(default = "default_retry_count")]
    pub connection_retry_count: u32,
    /// Connection health check interval in seconds.
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,
}

/// One Modbus/TCP device.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Unique device name, used in topics and the handler registry.
    pub name: String,
    /// Device kind.
    #[serde(rename = "type")]
    pub device_type: DeviceKind,
    /// Device IP address.
    pub ip: String,
    /// Modbus TCP port.
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    /// Modbus slave id.
    #[serde(default = "default_slave_id")]
    pub slave_id: u8,
    /// Polling interval in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
}

/// Process-wide settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Modbus connect timeout in seconds. Kept short for fast failure.
    pub connection_timeout: u64,
    /// Directory holding the per-device-type register map files.
    pub map_dir: PathBuf,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            connection_timeout: 2,
            map_dir: PathBuf::from("config"),
        }
    }
}

/// Site identification. The relational configuration store itself is an
/// external collaborator; only `device_location` is consumed here, for
/// topic construction and message filtering.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Whether the external configuration store integration is enabled.
    pub enabled: bool,
    /// Whether startup configuration should come from the store.
    pub load_config_from_db: bool,
    /// Store connection URL.
    pub url: Option<String>,
    /// Site identifier used in control/status topics.
    pub device_location: Option<String>,
}

/// Auto-mode thresholds and timing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutoModeConfig {
    /// Whether auto mode may be entered at all.
    pub enabled: bool,
    /// SOC percentage at which charging pauses into standby.
    pub soc_high_threshold: f64,
    /// SOC percentage at which the charge sequence starts.
    pub soc_low_threshold: f64,
    /// SOC percentage at which the charge sequence stops.
    pub soc_charge_stop_threshold: f64,
    /// Seconds to hold DCDC standby after reaching the high threshold.
    pub dcdc_standby_time: u64,
    /// Seconds between sequenced device commands.
    pub command_interval: u64,
    /// Charging power in kW.
    pub charging_power: f64,
    /// SOC monitor polling interval in seconds.
    pub soc_monitor_interval: f64,
}

impl Default for AutoModeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            soc_high_threshold: 88.0,
            soc_low_threshold: 5.0,
            soc_charge_stop_threshold: 25.0,
            dcdc_standby_time: 30,
            command_interval: 5,
            charging_power: 10.0,
            soc_monitor_interval: 2.0,
        }
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// MQTT broker settings.
    pub mqtt: MqttConfig,
    /// Device fleet.
    pub devices: Vec<DeviceConfig>,
    /// Process-wide settings.
    #[serde(default)]
    pub system: SystemConfig,
    /// Site identification.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Auto-mode thresholds and timing.
    #[serde(default)]
    pub auto_mode: AutoModeConfig,
}

impl Config {
    /// Loads and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Config = serde_yaml::from_str(&contents)
            .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(Error::Config("no devices configured".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate device name '{}'",
                    device.name
                )));
            }
            if device.poll_interval == 0 {
                return Err(Error::Config(format!(
                    "device '{}' has a zero poll interval",
                    device.name
                )));
            }
        }

        let auto = &self.auto_mode;
        if !(auto.soc_low_threshold < auto.soc_charge_stop_threshold
            && auto.soc_charge_stop_threshold < auto.soc_high_threshold)
        {
            return Err(Error::Config(format!(
                "SOC thresholds must satisfy low < charge_stop < high, got {} / {} / {}",
                auto.soc_low_threshold, auto.soc_charge_stop_threshold, auto.soc_high_threshold
            )));
        }

        Ok(())
    }

    /// The site identifier used for location-scoped topics.
    pub fn location(&self) -> &str {
        self.database.device_location.as_deref().unwrap_or("unknown")
    }

    /// Path of the register map file for a device kind.
    pub fn map_path(&self, kind: DeviceKind) -> PathBuf {
        self.system
            .map_dir
            .join(format!("{}_map.json", kind.as_str().to_lowercase()))
    }
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "pms_client".to_string()
}

fn default_keepalive() -> u64 {
    30
}

fn default_base_topic() -> String {
    "pms".to_string()
}

fn default_publish_workers() -> usize {
    5
}

fn default_retry_count() -> u32 {
    15
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_modbus_port() -> u16 {
    502
}

fn default_slave_id() -> u8 {
    1
}

fn default_poll_interval() -> u64 {
    5
}

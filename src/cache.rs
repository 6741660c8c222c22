//! Process-wide snapshot cache of the latest reading per device.
//!
//! Written by the polling pipeline, read by the SOC monitor, the recovery
//! watchdog and status consumers. Every entry pairs the latest successful
//! [`Reading`] with the device's connection status so that a dead device is
//! still visible to readers.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::device::DeviceKind;
use crate::process::ProcessedField;

/// A snapshot produced by one successful poll of one device.
#[derive(Debug, Clone, Serialize)]
pub struct Reading {
    /// Configured device name.
    pub device_name: String,
    /// Device kind.
    pub device_type: DeviceKind,
    /// Device IP address.
    pub ip_address: String,
    /// When the sweep completed.
    pub timestamp: DateTime<Utc>,
    /// Raw register values by register name.
    #[serde(skip)]
    pub raw: BTreeMap<String, i64>,
    /// Scaled and decoded fields, including derived ones.
    pub processed: BTreeMap<String, ProcessedField>,
}

impl Reading {
    /// Builds the telemetry payload published on `pms/<type>/<name>/data`.
    pub fn telemetry_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "device_name": self.device_name,
            "device_type": self.device_type,
            "ip_address": self.ip_address,
            "timestamp": self.timestamp.to_rfc3339(),
            "data": self.processed,
        })
    }
}

/// Connection status attached to a cache entry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceStatus {
    /// Whether the last interaction with the device succeeded.
    pub connected: bool,
    /// Last error message, if the device is failing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// When the device last delivered a full reading.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_successful_read: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct CacheEntry {
    reading: Option<Reading>,
    status: DeviceStatus,
    updated_at: Option<DateTime<Utc>>,
}

/// Thread-safe map of device name to latest reading and status.
#[derive(Debug, Default)]
pub struct SharedDataCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl SharedDataCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a fresh reading and marks the device connected.
    pub async fn update_reading(&self, reading: Reading) {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(reading.device_name.clone()).or_default();
        let now = Utc::now();
        entry.status.connected = true;
        entry.status.last_error = None;
        entry.status.last_successful_read = Some(reading.timestamp);
        entry.updated_at = Some(now);
        entry.reading = Some(reading);
    }

    /// Updates only the status portion of a device's entry.
    pub async fn update_status(&self, device_name: &str, connected: bool, error: Option<String>) {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(device_name.to_string()).or_default();
        entry.status.connected = connected;
        entry.status.last_error = error;
    }

    /// Returns a clone of the latest reading for a device.
    pub async fn reading(&self, device_name: &str) -> Option<Reading> {
        let entries = self.entries.read().await;
        entries.get(device_name).and_then(|e| e.reading.clone())
    }

    /// Returns the status of a device.
    pub async fn status(&self, device_name: &str) -> Option<DeviceStatus> {
        let entries = self.entries.read().await;
        entries.get(device_name).map(|e| e.status.clone())
    }

    /// Returns true if the device has a reading younger than `max_age_secs`.
    ///
    /// Data older than the limit is treated as missing.
    pub async fn is_fresh(&self, device_name: &str, max_age_secs: i64) -> bool {
        let entries = self.entries.read().await;
        match entries.get(device_name).and_then(|e| e.updated_at) {
            Some(updated_at) => (Utc::now() - updated_at).num_seconds() <= max_age_secs,
            None => false,
        }
    }

    /// Names of all devices the cache has seen.
    pub async fn device_names(&self) -> Vec<String> {
        let entries = self.entries.read().await;
        entries.keys().cloned().collect()
    }
}

/// Default freshness horizon, in seconds.
pub const DEFAULT_FRESHNESS_SECS: i64 = 300;

//! Operation manager: mode lifecycle and control message handling.
//!
//! Owns the current [`OperationMode`] and the auto-mode controller, handles
//! the location-scoped control topics (mode switches, auto start/stop,
//! threshold updates, basic-mode device commands), publishes status
//! periodically and runs the auto-recovery watchdog.
//!
//! Messages carrying a `location` field that does not match the configured
//! site are ignored; messages without one are accepted for compatibility
//! with older dashboards.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::auto_mode::AutoModeController;
use crate::config::Config;
use crate::device::{DeviceHandler, DeviceKind};
use crate::error::{Error, Result};
use crate::mqtt::MqttTransport;
use crate::recovery::AutoRecoveryManager;
use crate::state_machine::ThresholdUpdate;

/// Seconds between periodic threshold/status publications.
const STATUS_PERIOD_SECS: u64 = 30;

/// Seconds between recovery watchdog checks.
const RECOVERY_PERIOD_SECS: u64 = 30;

/// Warm-up delay before the first recovery check.
const RECOVERY_WARMUP_SECS: u64 = 10;

/// Stabilisation window after an attempted recovery.
const RECOVERY_STABILISE_SECS: u64 = 60;

/// Supervisor operating modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationMode {
    /// Manual operation; device commands are forwarded directly.
    Basic,
    /// Automatic operation; the state machine drives the devices.
    Auto,
}

impl OperationMode {
    /// The lower-case mode name used in payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationMode::Basic => "basic",
            OperationMode::Auto => "auto",
        }
    }
}

impl std::fmt::Display for OperationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OperationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "basic" => Ok(OperationMode::Basic),
            "auto" => Ok(OperationMode::Auto),
            other => Err(Error::InvalidCommand(format!(
                "unsupported operation mode '{other}'"
            ))),
        }
    }
}

/// Control and status topics for one site.
#[derive(Debug, Clone)]
pub struct ControlTopics {
    /// Mode switch requests.
    pub operation_mode: String,
    /// Auto-mode start requests.
    pub auto_start: String,
    /// Auto-mode stop requests.
    pub auto_stop: String,
    /// Auto-mode status queries.
    pub auto_status: String,
    /// Basic-mode device commands.
    pub basic_mode: String,
    /// Threshold updates.
    pub threshold_config: String,
    /// Status publications.
    pub status: String,
    /// Threshold status publications.
    pub threshold_status: String,
}

impl ControlTopics {
    /// Builds the topic set for a base topic and site location.
    pub fn new(base: &str, location: &str) -> Self {
        Self {
            operation_mode: format!("{base}/control/{location}/operation_mode"),
            auto_start: format!("{base}/control/{location}/auto_mode/start"),
            auto_stop: format!("{base}/control/{location}/auto_mode/stop"),
            auto_status: format!("{base}/control/{location}/auto_mode/status"),
            basic_mode: format!("{base}/control/{location}/basic_mode"),
            threshold_config: format!("{base}/control/{location}/threshold_config"),
            status: format!("{base}/status/{location}/operation_mode"),
            threshold_status: format!("{base}/status/{location}/threshold_config"),
        }
    }

    /// The topics the manager subscribes to.
    pub fn subscriptions(&self) -> [&str; 6] {
        [
            &self.operation_mode,
            &self.auto_start,
            &self.auto_stop,
            &self.auto_status,
            &self.basic_mode,
            &self.threshold_config,
        ]
    }
}

/// Mode lifecycle owner and control message handler.
pub struct OperationManager {
    location: String,
    auto_mode_enabled: bool,
    mode: RwLock<OperationMode>,
    controller: Arc<AutoModeController>,
    recovery: Option<Arc<AutoRecoveryManager>>,
    handlers: HashMap<String, Arc<DeviceHandler>>,
    transport: Arc<MqttTransport>,
    topics: ControlTopics,
    stop_rx: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    weak_self: Weak<Self>,
}

impl OperationManager {
    /// Creates the manager. The recovery watchdog is enabled only when both
    /// a BMS and a PCS are configured.
    pub fn new(
        config: &Config,
        handlers: HashMap<String, Arc<DeviceHandler>>,
        controller: Arc<AutoModeController>,
        transport: Arc<MqttTransport>,
        stop_rx: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let find = |kind: DeviceKind| {
            handlers
                .values()
                .find(|handler| handler.kind() == kind)
                .cloned()
        };

        let recovery = match (find(DeviceKind::Bms), find(DeviceKind::Pcs)) {
            (Some(bms), Some(pcs)) => {
                info!("auto-recovery watchdog enabled");
                Some(Arc::new(AutoRecoveryManager::new(bms, pcs)))
            }
            _ => {
                warn!("BMS or PCS missing, auto-recovery disabled");
                None
            }
        };

        let location = config.location().to_string();
        let topics = ControlTopics::new(transport.base_topic(), &location);

        Arc::new_cyclic(|weak: &Weak<Self>| Self {
            location,
            auto_mode_enabled: config.auto_mode.enabled,
            mode: RwLock::new(OperationMode::Basic),
            controller,
            recovery,
            handlers,
            transport,
            topics,
            stop_rx,
            tasks: Mutex::new(Vec::new()),
            weak_self: weak.clone(),
        })
    }

    /// The control topic set.
    pub fn topics(&self) -> &ControlTopics {
        &self.topics
    }

    /// The current operating mode.
    pub async fn mode(&self) -> OperationMode {
        *self.mode.read().await
    }

    /// Subscribes the control topics, publishes the initial status and
    /// starts the periodic status and recovery tasks.
    pub async fn initialize(&self) -> Result<()> {
        for topic in self.topics.subscriptions() {
            self.transport.subscribe(topic).await?;
        }

        self.transport.log_status().await;
        self.publish_status().await;
        self.publish_threshold_status().await;

        let Some(manager) = self.weak_self.upgrade() else {
            return Ok(());
        };

        let mut tasks = self.tasks.lock().await;
        let status_manager = Arc::clone(&manager);
        tasks.push(tokio::spawn(async move {
            status_manager.periodic_status_loop().await;
        }));

        if self.recovery.is_some() {
            tasks.push(tokio::spawn(async move {
                manager.recovery_monitor_loop().await;
            }));
        }

        info!(location = %self.location, "operation manager initialised");
        Ok(())
    }

    /// Dispatches a control message by topic.
    pub async fn handle_message(&self, topic: &str, payload: Value) {
        if !self.location_matches(&payload) {
            return;
        }

        if topic == self.topics.operation_mode {
            self.handle_operation_mode(payload).await;
        } else if topic == self.topics.auto_start {
            self.handle_auto_start().await;
        } else if topic == self.topics.auto_stop {
            self.handle_auto_stop().await;
        } else if topic == self.topics.auto_status {
            let status = self.status().await;
            self.publish_response(status).await;
        } else if topic == self.topics.basic_mode {
            self.handle_basic_mode(payload).await;
        } else if topic == self.topics.threshold_config {
            self.handle_threshold_config(payload).await;
        } else {
            debug!(topic, "unrecognised control topic");
        }
    }

    /// Location filter: mismatching messages are ignored, missing locations
    /// are accepted.
    fn location_matches(&self, payload: &Value) -> bool {
        match payload.get("location").and_then(Value::as_str) {
            Some(location) if location != self.location => {
                debug!(
                    message_location = location,
                    site = %self.location,
                    "message for another site ignored"
                );
                false
            }
            _ => true,
        }
    }

    async fn handle_operation_mode(&self, payload: Value) {
        let Some(mode) = payload.get("mode").and_then(Value::as_str) else {
            self.publish_error("missing 'mode' field").await;
            return;
        };

        match mode.parse::<OperationMode>() {
            Ok(OperationMode::Basic) => self.set_basic_mode().await,
            Ok(OperationMode::Auto) => self.set_auto_mode().await,
            Err(e) => {
                error!(mode, "unsupported operation mode");
                self.publish_error(&e.to_string()).await;
            }
        }

        self.publish_status().await;
        self.publish_threshold_status().await;
    }

    async fn handle_auto_start(&self) {
        info!("auto mode start requested");

        if self.mode().await != OperationMode::Auto {
            self.set_auto_mode().await;
        }
        if self.mode().await != OperationMode::Auto {
            // set_auto_mode refused (disabled in configuration).
            return;
        }

        let result = self.controller.start_auto_mode().await;
        let success = result.is_ok();
        let message = match result {
            Ok(()) => "auto mode started".to_string(),
            Err(ref e) => format!("auto mode start failed: {e}"),
        };

        self.publish_response(json!({
            "command": "auto_start",
            "success": success,
            "message": message,
            "timestamp": Utc::now().to_rfc3339(),
            "auto_mode_status": self.controller.status().await,
        }))
        .await;
        self.publish_status().await;
    }

    async fn handle_auto_stop(&self) {
        info!("auto mode stop requested");
        let result = self.controller.stop_auto_mode().await;

        self.publish_response(json!({
            "command": "auto_stop",
            "success": result.is_ok(),
            "message": match result {
                Ok(()) => "auto mode stopped".to_string(),
                Err(e) => format!("auto mode stop failed: {e}"),
            },
            "timestamp": Utc::now().to_rfc3339(),
            "auto_mode_status": self.controller.status().await,
        }))
        .await;
        self.publish_status().await;
    }

    /// Basic-mode device commands are only honoured in basic mode and are
    /// forwarded to the named handler's control dispatcher.
    async fn handle_basic_mode(&self, payload: Value) {
        if self.mode().await == OperationMode::Auto {
            warn!("basic-mode command refused while in auto mode");
            self.publish_error("cannot perform manual control in auto mode")
                .await;
            return;
        }

        let Some(device_name) = payload.get("device_name").and_then(Value::as_str) else {
            self.publish_error("missing 'device_name' field").await;
            return;
        };
        let Some(command) = payload.get("command").and_then(Value::as_str) else {
            self.publish_error("missing 'command' field").await;
            return;
        };

        let Some(handler) = self.handlers.get(device_name) else {
            self.publish_error(&format!("device '{device_name}' not found"))
                .await;
            return;
        };

        let mut forwarded = json!({ "command": command });
        if let Some(params) = payload.get("params").and_then(Value::as_object) {
            for (key, value) in params {
                forwarded[key.clone()] = value.clone();
            }
        }

        if let Err(e) = handler.handle_control_message(&forwarded).await {
            error!(device = device_name, error = %e, "basic-mode command failed");
            self.publish_error(&e.to_string()).await;
        }
    }

    async fn handle_threshold_config(&self, payload: Value) {
        let update: ThresholdUpdate = match serde_json::from_value(payload) {
            Ok(update) => update,
            Err(e) => {
                self.publish_error(&format!("invalid threshold payload: {e}"))
                    .await;
                return;
            }
        };

        let result = self.controller.machine().update_thresholds(update).await;
        self.publish_response(json!({
            "command": "threshold_config",
            "success": result.is_ok(),
            "message": match result {
                Ok(message) => message,
                Err(e) => e.to_string(),
            },
            "timestamp": Utc::now().to_rfc3339(),
        }))
        .await;

        self.publish_threshold_status().await;
    }

    /// Switches to basic mode, stopping the state machine first if needed.
    pub async fn set_basic_mode(&self) {
        info!("switching to basic mode");

        let mut message = "switched to basic mode".to_string();
        if *self.mode.read().await == OperationMode::Auto {
            if let Err(e) = self.controller.stop_auto_mode().await {
                warn!(error = %e, "auto mode stop failed, forcing basic mode");
                message = "auto mode stop failed, basic mode forced".to_string();
            }
        }

        *self.mode.write().await = OperationMode::Basic;
        self.publish_status().await;
        self.publish_response(json!({
            "command": "set_mode_basic",
            "success": true,
            "message": message,
            "current_mode": OperationMode::Basic.as_str(),
            "timestamp": Utc::now().to_rfc3339(),
        }))
        .await;
    }

    /// Switches to auto mode. Entering the mode does not start the sequence.
    pub async fn set_auto_mode(&self) {
        if !self.auto_mode_enabled {
            warn!("auto mode disabled in configuration");
            self.publish_error("auto mode is disabled in the configuration")
                .await;
            return;
        }

        info!("switching to auto mode");
        *self.mode.write().await = OperationMode::Auto;
        self.publish_status().await;
        self.publish_response(json!({
            "command": "set_mode_auto",
            "success": true,
            "message": "switched to auto mode",
            "current_mode": OperationMode::Auto.as_str(),
            "timestamp": Utc::now().to_rfc3339(),
        }))
        .await;
    }

    /// The full status payload.
    pub async fn status(&self) -> Value {
        let mode = self.mode().await;
        let controller_status = self.controller.status().await;

        // Per-handler connection snapshots for status consumers.
        let mut devices = serde_json::Map::new();
        for (name, handler) in &self.handlers {
            let snapshot =
                serde_json::to_value(handler.status().await).unwrap_or(Value::Null);
            devices.insert(name.clone(), snapshot);
        }

        json!({
            "current_mode": mode.as_str(),
            "timestamp": Utc::now().to_rfc3339(),
            "manual_mode": {
                "active": mode == OperationMode::Basic,
                "available_devices": self.handlers.keys().collect::<Vec<_>>(),
            },
            "auto_mode": {
                "active": controller_status.auto_mode.is_active,
                "available": self.auto_mode_enabled,
                "current_state": controller_status.auto_mode.current_state,
                "state_duration_seconds": controller_status.auto_mode.state_duration_seconds,
                "config": controller_status.auto_mode.config,
                "last_soc": controller_status.last_soc,
                "devices": controller_status.devices,
            },
            "devices": devices,
            "mqtt": {
                "connected": self.transport.is_connected(),
                "publisher": self.transport.stats().await,
            },
            "location": self.location,
        })
    }

    async fn publish_status(&self) {
        if self.transport.is_connected() {
            let status = self.status().await;
            self.transport.enqueue(&self.topics.status, status).await;
        }
    }

    async fn publish_threshold_status(&self) {
        let machine = self.controller.machine();
        let thresholds = machine.thresholds().await;
        let mode = self.mode().await;
        let machine_state = match mode {
            OperationMode::Auto => machine.current_state().await.as_str(),
            OperationMode::Basic => "idle",
        };

        let payload = json!({
            "type": "threshold_config",
            "timestamp": Utc::now().to_rfc3339(),
            "soc_high_threshold": thresholds.soc_high_threshold,
            "soc_low_threshold": thresholds.soc_low_threshold,
            "soc_charge_stop_threshold": thresholds.soc_charge_stop_threshold,
            "dcdc_standby_time": thresholds.dcdc_standby_time,
            "charging_power": thresholds.charging_power,
            "operation_mode": mode.as_str(),
            "auto_mode_status": machine_state,
            "location": self.location,
        });

        if self.transport.is_connected() {
            self.transport
                .enqueue(&self.topics.threshold_status, payload)
                .await;
        }
    }

    async fn publish_response(&self, mut response: Value) {
        if let Some(map) = response.as_object_mut() {
            map.insert("location".to_string(), json!(self.location));
        }
        let topic = format!("{}/response", self.topics.status);
        if self.transport.is_connected() {
            self.transport.enqueue(&topic, response).await;
        }
    }

    async fn publish_error(&self, message: &str) {
        error!(message, "control error");
        self.publish_response(json!({
            "error": true,
            "message": message,
            "timestamp": Utc::now().to_rfc3339(),
        }))
        .await;
    }

    /// Publishes the threshold status every 30 seconds.
    async fn periodic_status_loop(self: Arc<Self>) {
        let mut stop_rx = self.stop_rx.clone();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(STATUS_PERIOD_SECS)) => {
                    self.publish_threshold_status().await;
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Recovery watchdog: reads the BMS live every 30 seconds after a 10
    /// second warm-up, and gives the system 60 seconds to stabilise after
    /// an attempted recovery.
    async fn recovery_monitor_loop(self: Arc<Self>) {
        let Some(recovery) = self.recovery.clone() else {
            return;
        };
        let mut stop_rx = self.stop_rx.clone();

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(RECOVERY_WARMUP_SECS)) => {}
            changed = stop_rx.changed() => { if changed.is_err() || *stop_rx.borrow() { return; } }
        }

        loop {
            let bms = recovery.bms();
            let mut next_wait = RECOVERY_PERIOD_SECS;

            if bms.is_connected().await {
                match bms.read_data().await {
                    Ok(raw) => match recovery.check_and_recover(&raw).await {
                        Ok(true) => {
                            info!("recovery attempted, stabilising");
                            next_wait = RECOVERY_STABILISE_SECS;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            // An aborted script is re-evaluated on the next tick.
                            error!(error = %e, "recovery attempt failed");
                        }
                    },
                    Err(e) => {
                        debug!(error = %e, "BMS unreadable, recovery check skipped");
                    }
                }
            } else {
                debug!("BMS disconnected, recovery check skipped");
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(next_wait)) => {}
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Stops the periodic tasks, stops auto mode and unsubscribes the
    /// control topics.
    pub async fn shutdown(&self) {
        info!("operation manager shutting down");

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        drop(tasks);

        if self.controller.is_active().await {
            if let Err(e) = self.controller.stop_auto_mode().await {
                warn!(error = %e, "auto mode stop failed during shutdown");
            }
        }
        self.controller.shutdown().await;

        for topic in self.topics.subscriptions() {
            let _ = self.transport.unsubscribe(topic).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_layout() {
        let topics = ControlTopics::new("pms", "site-a");
        assert_eq!(topics.operation_mode, "pms/control/site-a/operation_mode");
        assert_eq!(topics.auto_start, "pms/control/site-a/auto_mode/start");
        assert_eq!(topics.auto_stop, "pms/control/site-a/auto_mode/stop");
        assert_eq!(topics.threshold_config, "pms/control/site-a/threshold_config");
        assert_eq!(topics.status, "pms/status/site-a/operation_mode");
        assert_eq!(topics.threshold_status, "pms/status/site-a/threshold_config");
        assert_eq!(topics.subscriptions().len(), 6);
    }

    #[test]
    fn test_operation_mode_parsing() {
        assert_eq!("basic".parse::<OperationMode>().unwrap(), OperationMode::Basic);
        assert_eq!("AUTO".parse::<OperationMode>().unwrap(), OperationMode::Auto);
        assert!("turbo".parse::<OperationMode>().is_err());
    }
}

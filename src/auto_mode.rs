//! Auto-mode controller: device side effects for the state machine.
//!
//! The controller owns the [`AutoModeStateMachine`] and translates its
//! transitions into device commands. It also runs the SOC monitor, which
//! feeds cached BMS readings back into the machine, and the charge sequence
//! spawned on entry to `soc_low_charging`.
//!
//! PCS and BMS are required for the sequence; the DCDC is optional and its
//! steps are skipped when it is absent.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::{SharedDataCache, DEFAULT_FRESHNESS_SECS};
use crate::config::AutoModeConfig;
use crate::device::{DeviceHandler, DeviceKind};
use crate::error::{Error, Result};
use crate::process::FieldValue;
use crate::state_machine::{AutoModeState, AutoModeStateMachine, MachineStatus};

/// The "execute" token understood by the sequenced control registers.
///
/// Opaque per the device documentation; it is not a bit field.
const EXECUTE: u16 = 85;

/// Consecutive SOC read misses before a diagnostic is logged.
const MAX_SOC_FAILURES: u32 = 5;

/// Seconds between cached-SOC checks while charging.
const CHARGE_POLL_SECS: u64 = 2;

/// Seconds between the PCS commands of the charge sequence.
const CHARGE_STEP_DELAY_SECS: u64 = 5;

/// Which devices the controller found at startup.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceAvailability {
    /// A PCS handler is configured.
    pub pcs_available: bool,
    /// A DCDC handler is configured.
    pub dcdc_available: bool,
    /// A BMS handler is configured.
    pub bms_available: bool,
}

/// Controller status, embedded in the operation manager's status payload.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    /// State machine status.
    pub auto_mode: MachineStatus,
    /// Last SOC value seen by the monitor.
    pub last_soc: f64,
    /// Device availability.
    pub devices: DeviceAvailability,
}

/// Drives the device fleet according to the state machine.
pub struct AutoModeController {
    machine: AutoModeStateMachine,
    cache: Arc<SharedDataCache>,
    pcs: Option<Arc<DeviceHandler>>,
    dcdc: Option<Arc<DeviceHandler>>,
    bms: Option<Arc<DeviceHandler>>,
    last_soc: RwLock<f64>,
    soc_monitor: Mutex<Option<JoinHandle<()>>>,
    stop_rx: watch::Receiver<bool>,
    weak_self: Weak<Self>,
}

impl AutoModeController {
    /// Creates the controller and wires it to the state machine.
    pub fn new(
        config: &AutoModeConfig,
        handlers: &HashMap<String, Arc<DeviceHandler>>,
        cache: Arc<SharedDataCache>,
        stop_rx: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let find = |kind: DeviceKind| {
            handlers
                .values()
                .find(|handler| handler.kind() == kind)
                .cloned()
        };

        let controller = Arc::new_cyclic(|weak: &Weak<Self>| Self {
            machine: AutoModeStateMachine::new(config),
            cache,
            pcs: find(DeviceKind::Pcs),
            dcdc: find(DeviceKind::Dcdc),
            bms: find(DeviceKind::Bms),
            last_soc: RwLock::new(0.0),
            soc_monitor: Mutex::new(None),
            stop_rx,
            weak_self: weak.clone(),
        });

        // Callbacks hold a weak reference so the machine never keeps the
        // controller alive on its own.
        let weak = Arc::downgrade(&controller);
        controller
            .machine
            .add_state_change_callback(Arc::new(move |previous, current, trigger| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(controller) = weak.upgrade() {
                        controller.on_state_change(previous, current, trigger).await;
                    }
                })
            }));

        info!(
            pcs = controller.pcs.is_some(),
            dcdc = controller.dcdc.is_some(),
            bms = controller.bms.is_some(),
            "auto-mode controller initialised"
        );
        controller
    }

    /// The underlying state machine.
    pub fn machine(&self) -> &AutoModeStateMachine {
        &self.machine
    }

    /// Whether the sequence is currently running.
    pub async fn is_active(&self) -> bool {
        self.machine.is_active().await
    }

    /// Starts auto mode: verifies the required devices, starts the SOC
    /// monitor, then starts the state machine.
    pub async fn start_auto_mode(&self) -> Result<()> {
        if self.pcs.is_none() || self.bms.is_none() {
            let mut missing = Vec::new();
            if self.pcs.is_none() {
                missing.push("PCS");
            }
            if self.bms.is_none() {
                missing.push("BMS");
            }
            return Err(Error::StateMachine(format!(
                "required devices missing: {}",
                missing.join(", ")
            )));
        }

        self.start_soc_monitor().await;

        if let Err(e) = self.machine.start_auto_mode().await {
            self.stop_soc_monitor().await;
            return Err(e);
        }
        info!("auto mode started");
        Ok(())
    }

    /// Stops auto mode and the SOC monitor.
    pub async fn stop_auto_mode(&self) -> Result<()> {
        self.stop_soc_monitor().await;
        self.machine.stop_auto_mode().await?;
        info!("auto mode stopped");
        Ok(())
    }

    /// Status snapshot for publication.
    pub async fn status(&self) -> ControllerStatus {
        ControllerStatus {
            auto_mode: self.machine.status().await,
            last_soc: *self.last_soc.read().await,
            devices: DeviceAvailability {
                pcs_available: self.pcs.is_some(),
                dcdc_available: self.dcdc.is_some(),
                bms_available: self.bms.is_some(),
            },
        }
    }

    /// Cancels the monitor and any pending machine timer. Used at shutdown.
    pub async fn shutdown(&self) {
        self.stop_soc_monitor().await;
        self.machine.cancel_pending().await;
    }

    async fn start_soc_monitor(&self) {
        let mut slot = self.soc_monitor.lock().await;
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let Some(controller) = self.weak_self.upgrade() else {
            return;
        };
        info!("SOC monitor started");
        *slot = Some(tokio::spawn(async move {
            controller.soc_monitor_loop().await;
        }));
    }

    async fn stop_soc_monitor(&self) {
        if let Some(task) = self.soc_monitor.lock().await.take() {
            task.abort();
            info!("SOC monitor stopped");
        }
    }

    /// Reads the cached BMS SOC at the configured interval and feeds changes
    /// of more than 0.1 % into the state machine.
    async fn soc_monitor_loop(self: Arc<Self>) {
        let mut stop_rx = self.stop_rx.clone();
        let mut failures: u32 = 0;

        loop {
            let interval = self.machine.thresholds().await.soc_monitor_interval;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs_f64(interval.max(0.1))) => {}
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        return;
                    }
                    continue;
                }
            }

            match self.read_cached_soc().await {
                Some(soc) if (0.0..=100.0).contains(&soc) => {
                    failures = 0;
                    let previous = *self.last_soc.read().await;
                    if (soc - previous).abs() > 0.1 {
                        info!(previous, soc, "SOC update");
                        self.machine.handle_soc_update(soc).await;
                        *self.last_soc.write().await = soc;
                    }
                }
                Some(soc) => {
                    failures += 1;
                    warn!(soc, "SOC outside 0-100% range");
                }
                None => {
                    failures += 1;
                    debug!(failures, "no usable BMS SOC in cache");
                }
            }

            // Missing data is diagnosed but never faults the machine.
            if failures >= MAX_SOC_FAILURES {
                error!(
                    failures,
                    "SOC unavailable for several cycles, check BMS polling"
                );
                failures = 0;
            }
        }
    }

    /// Extracts the processed SOC value from the cached BMS reading.
    ///
    /// The scale was applied once by the processor; the value is consumed
    /// as-is here.
    async fn read_cached_soc(&self) -> Option<f64> {
        let bms = self.bms.as_ref()?;
        if !self.cache.is_fresh(bms.name(), DEFAULT_FRESHNESS_SECS).await {
            return None;
        }
        let reading = self.cache.reading(bms.name()).await?;
        match &reading.processed.get("battery_soc")?.value {
            FieldValue::Number(soc) => Some(*soc),
            FieldValue::Text(_) => None,
        }
    }

    /// State-machine callback: issues the device commands for each state.
    async fn on_state_change(
        &self,
        previous: AutoModeState,
        current: AutoModeState,
        trigger: &'static str,
    ) {
        debug!(from = %previous, to = %current, trigger, "applying state side effects");

        let result = match current {
            AutoModeState::Initializing => self.handle_initializing().await,
            AutoModeState::PcsStandby => self.handle_pcs_standby().await,
            AutoModeState::PcsInverter => self.handle_pcs_inverter().await,
            AutoModeState::DcdcReset => self.handle_dcdc_reset().await,
            AutoModeState::DcdcSolar => self.handle_dcdc_solar().await,
            AutoModeState::SocHighWait => self.handle_soc_high_wait().await,
            AutoModeState::SocLowCharging => {
                self.spawn_charge_sequence();
                Ok(())
            }
            AutoModeState::NormalOperation => self.handle_normal_operation(previous).await,
            AutoModeState::Stopping => self.handle_stopping().await,
            AutoModeState::Idle | AutoModeState::Error => Ok(()),
        };

        if let Err(e) = result {
            error!(state = %current, error = %e, "state side effect failed");
            self.machine.trigger_event("error").await;
        }
    }

    async fn handle_initializing(&self) -> Result<()> {
        if self.pcs.is_some() && self.bms.is_some() {
            if self.dcdc.is_none() {
                info!("no DCDC configured, its steps will be skipped");
            }
            self.machine.trigger_event("init_complete").await;
            Ok(())
        } else {
            Err(Error::StateMachine("required device handlers missing".into()))
        }
    }

    async fn handle_pcs_standby(&self) -> Result<()> {
        let pcs = self.require_pcs()?;
        pcs.write_register("pcs_standby_start", EXECUTE).await?;
        info!("PCS standby commanded");
        // The machine's timer edge advances to pcs_inverter.
        Ok(())
    }

    async fn handle_pcs_inverter(&self) -> Result<()> {
        let pcs = self.require_pcs()?;
        pcs.write_register("inv_start_mode", EXECUTE).await?;
        info!("PCS inverter operation commanded");
        self.machine.trigger_event("pcs_ready").await;
        Ok(())
    }

    async fn handle_dcdc_reset(&self) -> Result<()> {
        match &self.dcdc {
            Some(dcdc) => {
                dcdc.write_register("reset_command", EXECUTE).await?;
                info!("DCDC reset commanded");
                // The machine's timer edge advances to dcdc_solar.
                Ok(())
            }
            None => {
                self.machine.trigger_event("dcdc_skip").await;
                Ok(())
            }
        }
    }

    async fn handle_dcdc_solar(&self) -> Result<()> {
        if let Some(dcdc) = &self.dcdc {
            dcdc.write_register("solar_command", EXECUTE).await?;
            info!("DCDC solar generation commanded");
        }
        self.machine.trigger_event("dcdc_ready").await;
        Ok(())
    }

    async fn handle_normal_operation(&self, previous: AutoModeState) -> Result<()> {
        // Returning from the high-SOC standby window resumes generation.
        if previous == AutoModeState::SocHighWait {
            if let Some(dcdc) = &self.dcdc {
                dcdc.write_register("solar_command", EXECUTE).await?;
                info!("DCDC solar generation resumed");
            }
        }
        info!("normal operation, monitoring SOC");
        Ok(())
    }

    async fn handle_soc_high_wait(&self) -> Result<()> {
        if let Some(dcdc) = &self.dcdc {
            // A failure here is logged but not fatal: the timer returns the
            // machine to normal operation either way.
            if let Err(e) = dcdc.write_register("ready_standby_command", EXECUTE).await {
                error!(error = %e, "DCDC standby command failed");
            } else {
                info!("DCDC standby commanded, waiting out the high-SOC window");
            }
        }
        Ok(())
    }

    async fn handle_stopping(&self) -> Result<()> {
        if let Some(pcs) = &self.pcs {
            if let Err(e) = pcs.write_register("inv_start_mode", EXECUTE).await {
                error!(error = %e, "PCS manual fallback failed");
            }
        }
        if let Some(dcdc) = &self.dcdc {
            if let Err(e) = dcdc.write_register("solar_command", EXECUTE).await {
                error!(error = %e, "DCDC manual fallback failed");
            }
        }
        info!("devices returned to manual defaults");
        self.machine.trigger_event("stop_complete").await;
        Ok(())
    }

    fn require_pcs(&self) -> Result<&Arc<DeviceHandler>> {
        self.pcs
            .as_ref()
            .ok_or_else(|| Error::StateMachine("no PCS handler".into()))
    }

    /// Runs the charge sequence in its own task so stop requests stay
    /// responsive while the sequence sleeps between commands.
    fn spawn_charge_sequence(&self) {
        let Some(controller) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = controller.charge_sequence().await {
                error!(error = %e, "charge sequence failed");
                controller.machine.trigger_event("error").await;
            }
        });
    }

    /// The charge sequence: stop, standby, charge, set power, then poll the
    /// cached SOC until the charge-stop threshold is reached.
    async fn charge_sequence(&self) -> Result<()> {
        let pcs = self.require_pcs()?.clone();
        info!("SOC low, starting charge sequence");

        pcs.write_register("pcs_stop", EXECUTE).await?;
        tokio::time::sleep(Duration::from_secs(CHARGE_STEP_DELAY_SECS)).await;

        pcs.write_register("pcs_standby_start", EXECUTE).await?;
        tokio::time::sleep(Duration::from_secs(CHARGE_STEP_DELAY_SECS)).await;

        pcs.write_register("pcs_charge_start", EXECUTE).await?;

        let charging_power = self.machine.thresholds().await.charging_power;
        // The power register uses a 0.1 kW scale.
        let scaled = (charging_power * 10.0).round() as u16;
        pcs.write_register("battery_charge_power", scaled).await?;
        info!(charging_power, "charging power set");

        loop {
            if self.machine.current_state().await != AutoModeState::SocLowCharging {
                debug!("charge sequence superseded by state change");
                return Ok(());
            }

            let soc = *self.last_soc.read().await;
            let stop_at = self.machine.thresholds().await.soc_charge_stop_threshold;
            if soc >= stop_at {
                info!(soc, stop_at, "charge complete");
                pcs.write_register("pcs_stop", EXECUTE).await?;
                tokio::time::sleep(Duration::from_secs(CHARGE_STEP_DELAY_SECS)).await;
                pcs.write_register("inv_start_mode", EXECUTE).await?;
                self.machine.trigger_event("charge_complete").await;
                return Ok(());
            }

            tokio::time::sleep(Duration::from_secs(CHARGE_POLL_SECS)).await;
        }
    }
}

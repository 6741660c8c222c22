//! Auto-mode state machine.
//!
//! The machine sequences the PCS and DCDC into normal operation and reacts
//! to SOC events once there. Transitions are driven by named trigger events;
//! delayed transitions are armed automatically when a state with an outgoing
//! `timer` edge is entered, and at most one delayed transition is pending at
//! any moment. Thresholds and delays are hot-reloadable: updates apply to
//! subsequent transitions and never disturb an in-flight timer.
//!
//! [`AutoModeStateMachine`] is a cheap clonable handle over shared state, so
//! timer tasks and callbacks can hold their own copy.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::AutoModeConfig;
use crate::error::{Error, Result};

/// States of the auto-mode sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AutoModeState {
    /// Nothing running; the only state at startup.
    Idle,
    /// Verifying the required device handlers.
    Initializing,
    /// PCS commanded into standby.
    PcsStandby,
    /// PCS commanded into inverter (independent) operation.
    PcsInverter,
    /// DCDC commanded to reset.
    DcdcReset,
    /// DCDC commanded into solar generation.
    DcdcSolar,
    /// Sequence complete; watching SOC.
    NormalOperation,
    /// SOC reached the high threshold; DCDC parked in standby.
    SocHighWait,
    /// SOC reached the low threshold; charge sequence running.
    SocLowCharging,
    /// Stop requested; returning devices to manual defaults.
    Stopping,
    /// A device command failed; operator reset required.
    Error,
}

impl AutoModeState {
    /// Returns the lower-case state name used in status payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            AutoModeState::Idle => "idle",
            AutoModeState::Initializing => "initializing",
            AutoModeState::PcsStandby => "pcs_standby",
            AutoModeState::PcsInverter => "pcs_inverter",
            AutoModeState::DcdcReset => "dcdc_reset",
            AutoModeState::DcdcSolar => "dcdc_solar",
            AutoModeState::NormalOperation => "normal_operation",
            AutoModeState::SocHighWait => "soc_high_wait",
            AutoModeState::SocLowCharging => "soc_low_charging",
            AutoModeState::Stopping => "stopping",
            AutoModeState::Error => "error",
        }
    }

    /// Returns true while the sequence is running.
    ///
    /// `idle`, `error` and `stopping` count as inactive.
    pub fn is_active(&self) -> bool {
        !matches!(
            self,
            AutoModeState::Idle | AutoModeState::Error | AutoModeState::Stopping
        )
    }
}

impl std::fmt::Display for AutoModeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AutoModeState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(AutoModeState::Idle),
            "initializing" => Ok(AutoModeState::Initializing),
            "pcs_standby" => Ok(AutoModeState::PcsStandby),
            "pcs_inverter" => Ok(AutoModeState::PcsInverter),
            "dcdc_reset" => Ok(AutoModeState::DcdcReset),
            "dcdc_solar" => Ok(AutoModeState::DcdcSolar),
            "normal_operation" => Ok(AutoModeState::NormalOperation),
            "soc_high_wait" => Ok(AutoModeState::SocHighWait),
            "soc_low_charging" => Ok(AutoModeState::SocLowCharging),
            "stopping" => Ok(AutoModeState::Stopping),
            "error" => Ok(AutoModeState::Error),
            other => Err(Error::StateMachine(format!("unknown state '{other}'"))),
        }
    }
}

/// Where a delayed transition takes its delay from.
///
/// Delays reference the live threshold configuration rather than a value
/// captured at build time, so threshold updates affect the next arming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransitionDelay {
    Immediate,
    CommandInterval,
    DcdcStandbyTime,
}

/// One edge of the transition table.
#[derive(Debug, Clone)]
struct StateTransition {
    /// Source state; `None` matches any state.
    from: Option<AutoModeState>,
    to: AutoModeState,
    trigger: &'static str,
    delay: TransitionDelay,
}

/// Auto-mode thresholds and timing, hot-reloadable as a unit.
#[derive(Debug, Clone, Serialize)]
pub struct Thresholds {
    /// SOC percentage that pauses generation into DCDC standby.
    pub soc_high_threshold: f64,
    /// SOC percentage that starts the charge sequence.
    pub soc_low_threshold: f64,
    /// SOC percentage that ends the charge sequence.
    pub soc_charge_stop_threshold: f64,
    /// Seconds to hold DCDC standby after the high threshold.
    pub dcdc_standby_time: u64,
    /// Seconds between sequenced device commands.
    pub command_interval: u64,
    /// Charging power in kW.
    pub charging_power: f64,
    /// SOC monitor polling interval in seconds.
    pub soc_monitor_interval: f64,
}

impl Thresholds {
    fn from_config(config: &AutoModeConfig) -> Self {
        Self {
            soc_high_threshold: config.soc_high_threshold,
            soc_low_threshold: config.soc_low_threshold,
            soc_charge_stop_threshold: config.soc_charge_stop_threshold,
            dcdc_standby_time: config.dcdc_standby_time,
            command_interval: config.command_interval,
            charging_power: config.charging_power,
            soc_monitor_interval: config.soc_monitor_interval,
        }
    }
}

/// Threshold update request, as carried by `threshold_config` messages.
///
/// The three SOC thresholds are required; the timing fields are optional and
/// keep their current values when absent.
#[derive(Debug, Clone, Deserialize)]
pub struct ThresholdUpdate {
    /// New SOC high threshold.
    pub soc_high_threshold: f64,
    /// New SOC low threshold.
    pub soc_low_threshold: f64,
    /// New charge stop threshold.
    pub soc_charge_stop_threshold: f64,
    /// New DCDC standby time, if present.
    #[serde(default)]
    pub dcdc_standby_time: Option<u64>,
    /// New command interval, if present.
    #[serde(default)]
    pub command_interval: Option<u64>,
    /// New charging power, if present.
    #[serde(default)]
    pub charging_power: Option<f64>,
}

/// Callback invoked after every transition with `(previous, next, trigger)`.
pub type StateChangeCallback = Arc<
    dyn Fn(AutoModeState, AutoModeState, &'static str) -> Pin<Box<dyn Future<Output = ()> + Send>>
        + Send
        + Sync,
>;

struct MachineInner {
    current: AutoModeState,
    previous: AutoModeState,
    state_started: Instant,
    pending_timer: Option<JoinHandle<()>>,
}

struct MachineCore {
    thresholds: RwLock<Thresholds>,
    transitions: Vec<StateTransition>,
    inner: Mutex<MachineInner>,
    callbacks: std::sync::RwLock<Vec<StateChangeCallback>>,
}

/// Status payload for the state machine.
#[derive(Debug, Clone, Serialize)]
pub struct MachineStatus {
    /// Current state name.
    pub current_state: String,
    /// Previous state name.
    pub previous_state: String,
    /// Seconds spent in the current state.
    pub state_duration_seconds: f64,
    /// Whether the sequence is running.
    pub is_active: bool,
    /// Current thresholds and timing.
    pub config: Thresholds,
}

/// Clonable handle to the auto-mode state machine.
#[derive(Clone)]
pub struct AutoModeStateMachine {
    core: Arc<MachineCore>,
}

impl AutoModeStateMachine {
    /// Creates the machine in the `idle` state.
    pub fn new(config: &AutoModeConfig) -> Self {
        Self {
            core: Arc::new(MachineCore {
                thresholds: RwLock::new(Thresholds::from_config(config)),
                transitions: Self::transition_table(),
                inner: Mutex::new(MachineInner {
                    current: AutoModeState::Idle,
                    previous: AutoModeState::Idle,
                    state_started: Instant::now(),
                    pending_timer: None,
                }),
                callbacks: std::sync::RwLock::new(Vec::new()),
            }),
        }
    }

    fn transition_table() -> Vec<StateTransition> {
        use AutoModeState::*;
        use TransitionDelay::*;

        vec![
            StateTransition { from: Some(Idle), to: Initializing, trigger: "start_auto", delay: Immediate },
            StateTransition { from: Some(Initializing), to: PcsStandby, trigger: "init_complete", delay: Immediate },
            StateTransition { from: Some(PcsStandby), to: PcsInverter, trigger: "timer", delay: CommandInterval },
            StateTransition { from: Some(PcsInverter), to: DcdcReset, trigger: "pcs_ready", delay: Immediate },
            StateTransition { from: Some(DcdcReset), to: DcdcSolar, trigger: "timer", delay: CommandInterval },
            // Direct skip when no DCDC is configured.
            StateTransition { from: Some(DcdcReset), to: DcdcSolar, trigger: "dcdc_skip", delay: Immediate },
            StateTransition { from: Some(DcdcSolar), to: NormalOperation, trigger: "dcdc_ready", delay: Immediate },
            StateTransition { from: Some(NormalOperation), to: SocHighWait, trigger: "soc_high", delay: Immediate },
            StateTransition { from: Some(SocHighWait), to: NormalOperation, trigger: "timer", delay: DcdcStandbyTime },
            StateTransition { from: Some(NormalOperation), to: SocLowCharging, trigger: "soc_low", delay: Immediate },
            StateTransition { from: Some(SocLowCharging), to: NormalOperation, trigger: "charge_complete", delay: Immediate },
            StateTransition { from: None, to: Stopping, trigger: "stop_auto", delay: Immediate },
            StateTransition { from: Some(Stopping), to: Idle, trigger: "stop_complete", delay: Immediate },
            StateTransition { from: None, to: Error, trigger: "error", delay: Immediate },
            StateTransition { from: Some(Error), to: Idle, trigger: "reset_error", delay: Immediate },
        ]
    }

    /// Registers a state-change callback. Callbacks fire in registration
    /// order after every transition.
    pub fn add_state_change_callback(&self, callback: StateChangeCallback) {
        if let Ok(mut callbacks) = self.core.callbacks.write() {
            callbacks.push(callback);
        }
    }

    /// The current state.
    pub async fn current_state(&self) -> AutoModeState {
        self.core.inner.lock().await.current
    }

    /// Whether the sequence is currently running.
    pub async fn is_active(&self) -> bool {
        self.current_state().await.is_active()
    }

    /// A snapshot of the current thresholds.
    pub async fn thresholds(&self) -> Thresholds {
        self.core.thresholds.read().await.clone()
    }

    /// Starts the auto-mode sequence.
    ///
    /// Only `idle` can start. `error` and `stopping` are force-reset to
    /// `idle` first; any other state refuses.
    pub async fn start_auto_mode(&self) -> Result<()> {
        let current = self.current_state().await;
        match current {
            AutoModeState::Idle => {
                self.transition_to(AutoModeState::Initializing, "start_auto")
                    .await;
                Ok(())
            }
            AutoModeState::Error | AutoModeState::Stopping => {
                warn!(state = %current, "force-resetting before restart");
                self.transition_to(AutoModeState::Idle, "force_reset").await;
                tokio::time::sleep(Duration::from_millis(100)).await;
                self.transition_to(AutoModeState::Initializing, "start_auto")
                    .await;
                Ok(())
            }
            other => Err(Error::StateMachine(format!(
                "cannot start auto mode from state '{other}'"
            ))),
        }
    }

    /// Stops the auto-mode sequence. A stop while already `idle` is a no-op.
    pub async fn stop_auto_mode(&self) -> Result<()> {
        if self.current_state().await == AutoModeState::Idle {
            debug!("auto mode already idle");
            return Ok(());
        }
        self.transition_to(AutoModeState::Stopping, "stop_auto").await;
        Ok(())
    }

    /// Acknowledges an `error` state, returning to `idle`.
    pub async fn reset_error(&self) -> Result<()> {
        self.trigger_event("reset_error").await;
        Ok(())
    }

    /// Fires a trigger event against the transition table.
    ///
    /// Events that match no transition from the current state are ignored.
    pub async fn trigger_event(&self, event: &str) {
        let current = self.current_state().await;
        debug!(event, state = %current, "event");

        let matched = self
            .core
            .transitions
            .iter()
            .find(|t| t.trigger == event && (t.from.is_none() || t.from == Some(current)))
            .cloned();

        let Some(transition) = matched else {
            debug!(event, state = %current, "no matching transition");
            return;
        };

        match transition.delay {
            TransitionDelay::Immediate => {
                self.transition_to(transition.to, transition.trigger).await;
            }
            delay => {
                let secs = self.resolve_delay(delay).await;
                self.schedule_transition(transition.to, secs).await;
            }
        }
    }

    /// Handles a SOC sample. Only `normal_operation` reacts.
    pub async fn handle_soc_update(&self, soc: f64) {
        if self.current_state().await != AutoModeState::NormalOperation {
            return;
        }
        let (high, low) = {
            let thresholds = self.core.thresholds.read().await;
            (thresholds.soc_high_threshold, thresholds.soc_low_threshold)
        };
        if soc >= high {
            info!(soc, high, "SOC high threshold reached");
            self.transition_to(AutoModeState::SocHighWait, "soc_high").await;
        } else if soc <= low {
            info!(soc, low, "SOC low threshold reached");
            self.transition_to(AutoModeState::SocLowCharging, "soc_low").await;
        }
    }

    async fn resolve_delay(&self, delay: TransitionDelay) -> u64 {
        let thresholds = self.core.thresholds.read().await;
        match delay {
            TransitionDelay::Immediate => 0,
            TransitionDelay::CommandInterval => thresholds.command_interval,
            TransitionDelay::DcdcStandbyTime => thresholds.dcdc_standby_time,
        }
    }

    /// Executes a transition: updates the state, cancels any pending timer,
    /// arms the new state's timer edge if it has one, then runs the
    /// callbacks in order.
    // `transition_to` and `schedule_transition` call each other (directly,
    // and via the task spawned inside `schedule_transition`). rustc cannot
    // prove Send for a pair of async fns that recurse into each other like
    // this, so both are written as plain fns returning an explicitly boxed
    // `dyn Future + Send`, which breaks the cyclic auto-trait inference.
    fn transition_to(
        &self,
        new_state: AutoModeState,
        trigger: &'static str,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let previous = {
                let mut inner = self.core.inner.lock().await;
                if inner.current == new_state {
                    return;
                }
                if let Some(timer) = inner.pending_timer.take() {
                    timer.abort();
                }
                inner.previous = inner.current;
                inner.current = new_state;
                inner.state_started = Instant::now();
                inner.previous
            };

            info!(from = %previous, to = %new_state, trigger, "state transition");

            // Arm the outgoing timer edge of the new state, if any.
            let timer_edge = self
                .core
                .transitions
                .iter()
                .find(|t| t.from == Some(new_state) && t.trigger == "timer")
                .cloned();
            if let Some(edge) = timer_edge {
                let secs = self.resolve_delay(edge.delay).await;
                self.schedule_transition(edge.to, secs).await;
            }

            let callbacks = match self.core.callbacks.read() {
                Ok(callbacks) => callbacks.clone(),
                Err(_) => Vec::new(),
            };
            for callback in callbacks {
                callback(previous, new_state, trigger).await;
            }
        })
    }

    /// Arms a delayed transition, replacing any pending one.
    fn schedule_transition(
        &self,
        to: AutoModeState,
        delay_secs: u64,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let machine = self.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(delay_secs)).await;
                // Clear the slot first so the transition does not abort the
                // task that is executing it.
                machine.core.inner.lock().await.pending_timer = None;
                machine.transition_to(to, "timer").await;
            });

            let mut inner = self.core.inner.lock().await;
            if let Some(previous) = inner.pending_timer.replace(handle) {
                previous.abort();
            }
            debug!(to = %to, delay_secs, "delayed transition armed");
        })
    }

    /// Applies a threshold update.
    ///
    /// The full SOC ordering `low < charge_stop < high` is enforced; timing
    /// fields are optional. Changes apply to subsequent transitions only.
    pub async fn update_thresholds(&self, update: ThresholdUpdate) -> Result<String> {
        if update.soc_low_threshold >= update.soc_high_threshold {
            return Err(Error::InvalidThresholds(format!(
                "SOC low ({}) must be below SOC high ({})",
                update.soc_low_threshold, update.soc_high_threshold
            )));
        }
        if update.soc_charge_stop_threshold <= update.soc_low_threshold
            || update.soc_charge_stop_threshold >= update.soc_high_threshold
        {
            return Err(Error::InvalidThresholds(format!(
                "charge stop ({}) must lie between low ({}) and high ({})",
                update.soc_charge_stop_threshold,
                update.soc_low_threshold,
                update.soc_high_threshold
            )));
        }

        let mut thresholds = self.core.thresholds.write().await;
        thresholds.soc_high_threshold = update.soc_high_threshold;
        thresholds.soc_low_threshold = update.soc_low_threshold;
        thresholds.soc_charge_stop_threshold = update.soc_charge_stop_threshold;

        let mut applied = vec![
            format!("SOC high: {}%", update.soc_high_threshold),
            format!("SOC low: {}%", update.soc_low_threshold),
            format!("charge stop: {}%", update.soc_charge_stop_threshold),
        ];
        if let Some(standby) = update.dcdc_standby_time {
            thresholds.dcdc_standby_time = standby;
            applied.push(format!("DCDC standby: {standby}s"));
        }
        if let Some(interval) = update.command_interval {
            thresholds.command_interval = interval;
            applied.push(format!("command interval: {interval}s"));
        }
        if let Some(power) = update.charging_power {
            thresholds.charging_power = power;
            applied.push(format!("charging power: {power}kW"));
        }

        let message = format!("thresholds updated: {}", applied.join(", "));
        info!("{message}");
        Ok(message)
    }

    /// Status snapshot for publication.
    pub async fn status(&self) -> MachineStatus {
        let (current, previous, duration) = {
            let inner = self.core.inner.lock().await;
            (
                inner.current,
                inner.previous,
                inner.state_started.elapsed(),
            )
        };
        MachineStatus {
            current_state: current.as_str().to_string(),
            previous_state: previous.as_str().to_string(),
            state_duration_seconds: duration.as_secs_f64(),
            is_active: current.is_active(),
            config: self.thresholds().await,
        }
    }

    /// Cancels any pending delayed transition. Used at shutdown.
    pub async fn cancel_pending(&self) {
        let mut inner = self.core.inner.lock().await;
        if let Some(timer) = inner.pending_timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AutoModeConfig {
        AutoModeConfig {
            enabled: true,
            soc_high_threshold: 90.0,
            soc_low_threshold: 10.0,
            soc_charge_stop_threshold: 25.0,
            dcdc_standby_time: 5,
            command_interval: 2,
            charging_power: 10.0,
            soc_monitor_interval: 2.0,
        }
    }

    #[tokio::test]
    async fn test_starts_idle() {
        let machine = AutoModeStateMachine::new(&config());
        assert_eq!(machine.current_state().await, AutoModeState::Idle);
        assert!(!machine.is_active().await);
    }

    #[tokio::test]
    async fn test_start_refused_while_running() {
        let machine = AutoModeStateMachine::new(&config());
        machine.start_auto_mode().await.unwrap();
        assert_eq!(machine.current_state().await, AutoModeState::Initializing);
        assert!(machine.start_auto_mode().await.is_err());
    }

    #[tokio::test]
    async fn test_stop_in_idle_is_noop() {
        let machine = AutoModeStateMachine::new(&config());
        machine.stop_auto_mode().await.unwrap();
        machine.stop_auto_mode().await.unwrap();
        assert_eq!(machine.current_state().await, AutoModeState::Idle);
    }

    #[tokio::test]
    async fn test_error_resets_then_restarts() {
        let machine = AutoModeStateMachine::new(&config());
        machine.trigger_event("error").await;
        assert_eq!(machine.current_state().await, AutoModeState::Error);

        // A start from error force-resets and proceeds.
        machine.start_auto_mode().await.unwrap();
        assert_eq!(machine.current_state().await, AutoModeState::Initializing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_edge_armed_on_entry() {
        let machine = AutoModeStateMachine::new(&config());
        machine.start_auto_mode().await.unwrap();
        machine.trigger_event("init_complete").await;
        assert_eq!(machine.current_state().await, AutoModeState::PcsStandby);

        // command_interval is 2s; after 2s the timer fires into pcs_inverter.
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(machine.current_state().await, AutoModeState::PcsInverter);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_timer() {
        let machine = AutoModeStateMachine::new(&config());
        machine.start_auto_mode().await.unwrap();
        machine.trigger_event("init_complete").await;
        machine.stop_auto_mode().await.unwrap();
        assert_eq!(machine.current_state().await, AutoModeState::Stopping);

        // The pcs_standby timer must not fire after the stop.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(machine.current_state().await, AutoModeState::Stopping);
    }

    #[tokio::test]
    async fn test_soc_boundaries() {
        let machine = AutoModeStateMachine::new(&config());

        machine.start_auto_mode().await.unwrap();
        machine.trigger_event("init_complete").await;
        machine.cancel_pending().await;
        machine.transition_to(AutoModeState::NormalOperation, "test").await;
        assert_eq!(machine.current_state().await, AutoModeState::NormalOperation);

        // Exactly at the high threshold transitions.
        machine.handle_soc_update(90.0).await;
        assert_eq!(machine.current_state().await, AutoModeState::SocHighWait);

        machine.cancel_pending().await;
        machine.transition_to(AutoModeState::NormalOperation, "test").await;

        // Exactly at the low threshold transitions.
        machine.handle_soc_update(10.0).await;
        assert_eq!(machine.current_state().await, AutoModeState::SocLowCharging);

        // SOC events outside normal_operation are ignored.
        machine.handle_soc_update(90.0).await;
        assert_eq!(machine.current_state().await, AutoModeState::SocLowCharging);
    }

    #[tokio::test]
    async fn test_threshold_update_validation() {
        let machine = AutoModeStateMachine::new(&config());

        let bad = ThresholdUpdate {
            soc_high_threshold: 50.0,
            soc_low_threshold: 60.0,
            soc_charge_stop_threshold: 55.0,
            dcdc_standby_time: None,
            command_interval: None,
            charging_power: None,
        };
        assert!(machine.update_thresholds(bad).await.is_err());

        let outside = ThresholdUpdate {
            soc_high_threshold: 80.0,
            soc_low_threshold: 20.0,
            soc_charge_stop_threshold: 90.0,
            dcdc_standby_time: None,
            command_interval: None,
            charging_power: None,
        };
        assert!(machine.update_thresholds(outside).await.is_err());

        let good = ThresholdUpdate {
            soc_high_threshold: 85.0,
            soc_low_threshold: 15.0,
            soc_charge_stop_threshold: 30.0,
            dcdc_standby_time: Some(10),
            command_interval: Some(3),
            charging_power: Some(12.5),
        };
        machine.update_thresholds(good).await.unwrap();

        let thresholds = machine.thresholds().await;
        assert_eq!(thresholds.soc_high_threshold, 85.0);
        assert_eq!(thresholds.dcdc_standby_time, 10);
        assert_eq!(thresholds.charging_power, 12.5);
    }

    #[tokio::test]
    async fn test_callbacks_observe_transitions() {
        let machine = AutoModeStateMachine::new(&config());
        let seen: Arc<std::sync::Mutex<Vec<(AutoModeState, AutoModeState)>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        machine.add_state_change_callback(Arc::new(move |prev, next, _trigger| {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                if let Ok(mut log) = sink.lock() {
                    log.push((prev, next));
                }
            })
        }));

        machine.start_auto_mode().await.unwrap();
        machine.trigger_event("error").await;

        let log = seen.lock().unwrap().clone();
        assert_eq!(
            log,
            vec![
                (AutoModeState::Idle, AutoModeState::Initializing),
                (AutoModeState::Initializing, AutoModeState::Error),
            ]
        );
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            AutoModeState::Idle,
            AutoModeState::SocLowCharging,
            AutoModeState::NormalOperation,
        ] {
            assert_eq!(state.as_str().parse::<AutoModeState>().unwrap(), state);
        }
        assert!("warp_speed".parse::<AutoModeState>().is_err());
    }
}

//! Power Management System supervisor.
//!
//! This library orchestrates a small fleet of industrial power devices
//! connected over Modbus/TCP: a Battery Management System (BMS), a DC/DC
//! converter and a Power Conversion System (PCS). It periodically polls each
//! device, normalises raw register values into engineering units and status
//! flags, publishes them over MQTT, accepts control commands over MQTT and
//! runs the SOC-driven auto-mode state machine that coordinates the three
//! devices.
//!
//! # Architecture
//!
//! - [`register_map`]: static per-register metadata loaded from JSON maps
//! - [`device`]: one Modbus/TCP connection and handler per device
//! - [`process`]: scaling, bit decoding and derived-field computation
//! - [`cache`]: process-wide snapshot of the latest reading per device
//! - [`scheduler`]: per-device polling with non-overlap and coalescing
//! - [`mqtt`]: shared broker connection with a worker-pool publisher
//! - [`router`]: topic-routed dispatch of inbound commands
//! - [`state_machine`] and [`auto_mode`]: the auto-mode sequence
//! - [`operation`]: mode lifecycle, threshold configuration, status
//! - [`recovery`]: the BMS communication-error watchdog
//!
//! Data flows from the scheduler through the handler and processor into the
//! cache and out over MQTT. Control flows in over MQTT through the router,
//! which either writes device registers directly or forwards to the
//! operation manager, which may drive the state machine.
//!
//! # Example
//!
//! ```no_run
//! use pms_supervisor::config::Config;
//! use pms_supervisor::supervisor::Supervisor;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::load("config/config.yaml")?;
//! let supervisor = Supervisor::start(config).await?;
//! supervisor.run_until_shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod auto_mode;
pub mod cache;
pub mod config;
pub mod device;
pub mod error;
pub mod mqtt;
pub mod operation;
pub mod process;
pub mod recovery;
pub mod register_map;
pub mod router;
pub mod scheduler;
pub mod state_machine;
pub mod supervisor;

pub use cache::{Reading, SharedDataCache};
pub use config::Config;
pub use device::{DeviceHandler, DeviceKind};
pub use error::{Error, Result};
pub use mqtt::MqttTransport;
pub use operation::{OperationManager, OperationMode};
pub use register_map::{RegisterMap, RegisterSpec};
pub use state_machine::{AutoModeState, AutoModeStateMachine};
pub use supervisor::Supervisor;

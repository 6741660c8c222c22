//! Modbus/TCP device handlers.
//!
//! One [`DeviceHandler`] owns exactly one Modbus/TCP connection and a lock
//! serialising every operation on it. The connection is lazy: it is opened on
//! first use and torn down whenever the transport fails, so the next
//! scheduler tick starts from a clean connect.
//!
//! The three device kinds share the same read/write machinery and differ only
//! in their register maps and command verbs, so they are modelled as a single
//! data-driven type dispatching on [`DeviceKind`] rather than a type
//! hierarchy.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_modbus::client::{tcp, Context, Reader, Writer};
use tokio_modbus::Slave;
use tracing::{debug, info, warn};

use crate::config::DeviceConfig;
use crate::error::{Error, Result};
use crate::register_map::{FunctionCode, RegisterMap};

/// The three supervised device kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Battery Management System.
    #[serde(rename = "BMS")]
    Bms,
    /// DC/DC converter.
    #[serde(rename = "DCDC")]
    Dcdc,
    /// Power Conversion System.
    #[serde(rename = "PCS")]
    Pcs,
}

impl DeviceKind {
    /// Returns the canonical upper-case name used in topics and maps.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Bms => "BMS",
            DeviceKind::Dcdc => "DCDC",
            DeviceKind::Pcs => "PCS",
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DeviceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BMS" => Ok(DeviceKind::Bms),
            "DCDC" => Ok(DeviceKind::Dcdc),
            "PCS" => Ok(DeviceKind::Pcs),
            other => Err(Error::Config(format!("unknown device type '{other}'"))),
        }
    }
}

/// PCS operating modes accepted by `set_operation_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcsMode {
    /// Stop conversion.
    Stop,
    /// Charge the battery from the grid.
    Charge,
    /// Discharge the battery to the grid.
    Discharge,
    /// Hot standby.
    Standby,
    /// Grid-independent (islanded) operation.
    Independent,
}

impl PcsMode {
    /// The register value written for this mode.
    pub fn register_value(&self) -> u16 {
        match self {
            PcsMode::Stop => 0,
            PcsMode::Charge => 1,
            PcsMode::Discharge => 2,
            PcsMode::Standby => 3,
            PcsMode::Independent => 4,
        }
    }
}

impl std::str::FromStr for PcsMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stop" => Ok(PcsMode::Stop),
            "charge" => Ok(PcsMode::Charge),
            "discharge" => Ok(PcsMode::Discharge),
            "standby" => Ok(PcsMode::Standby),
            "independent" => Ok(PcsMode::Independent),
            other => Err(Error::UnsupportedCommand {
                command: format!("operation_mode '{other}'"),
                device_type: "PCS".to_string(),
            }),
        }
    }
}

/// DCDC operating modes accepted by `set_operation_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DcdcMode {
    /// Stop conversion.
    Stop,
    /// Hot standby.
    Standby,
    /// Charge direction.
    Charge,
    /// Discharge direction.
    Discharge,
    /// Independent operation.
    Independent,
}

impl DcdcMode {
    /// The register value written for this mode.
    pub fn register_value(&self) -> u16 {
        match self {
            DcdcMode::Stop => 0,
            DcdcMode::Standby => 1,
            DcdcMode::Charge => 2,
            DcdcMode::Discharge => 3,
            DcdcMode::Independent => 4,
        }
    }
}

impl std::str::FromStr for DcdcMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stop" => Ok(DcdcMode::Stop),
            "standby" => Ok(DcdcMode::Standby),
            "charge" => Ok(DcdcMode::Charge),
            "discharge" => Ok(DcdcMode::Discharge),
            "independent" => Ok(DcdcMode::Independent),
            other => Err(Error::UnsupportedCommand {
                command: format!("operation_mode '{other}'"),
                device_type: "DCDC".to_string(),
            }),
        }
    }
}

/// Magic value written to the error-reset registers of the BMS.
const BMS_RESET_MAGIC: u16 = 0x0050;

/// Connection state guarded by the device lock.
struct Connection {
    ctx: Option<Context>,
    connected: bool,
    last_successful_read: Option<DateTime<Utc>>,
}

/// Point-in-time handler status, serialised for status consumers.
#[derive(Debug, Clone, Serialize)]
pub struct HandlerStatus {
    /// Configured device name.
    pub name: String,
    /// Device kind.
    #[serde(rename = "type")]
    pub device_type: DeviceKind,
    /// Device IP address.
    pub ip: String,
    /// Modbus TCP port.
    pub port: u16,
    /// Whether a Modbus connection is currently established.
    pub connected: bool,
    /// When the device last delivered a full reading.
    pub last_successful_read: Option<DateTime<Utc>>,
    /// Polling interval in seconds.
    pub poll_interval: u64,
}

/// Runtime handler for one configured Modbus/TCP device.
pub struct DeviceHandler {
    name: String,
    kind: DeviceKind,
    ip: String,
    port: u16,
    slave_id: u8,
    poll_interval: Duration,
    connect_timeout: Duration,
    map: RegisterMap,
    conn: Mutex<Connection>,
}

impl DeviceHandler {
    /// Creates a handler from its configuration and register map.
    ///
    /// The Modbus connection is not opened here; it is established lazily on
    /// the first read or write.
    pub fn new(config: &DeviceConfig, map: RegisterMap, connect_timeout: Duration) -> Self {
        info!(
            device = %config.name,
            kind = %config.device_type,
            registers = map.len(),
            "device handler initialised"
        );
        Self {
            name: config.name.clone(),
            kind: config.device_type,
            ip: config.ip.clone(),
            port: config.port,
            slave_id: config.slave_id,
            poll_interval: Duration::from_secs(config.poll_interval),
            connect_timeout,
            map,
            conn: Mutex::new(Connection {
                ctx: None,
                connected: false,
                last_successful_read: None,
            }),
        }
    }

    /// The configured device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The device kind.
    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// The device IP address.
    pub fn ip(&self) -> &str {
        &self.ip
    }

    /// The configured polling interval.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// The register map for this device.
    pub fn map(&self) -> &RegisterMap {
        &self.map
    }

    /// Whether a Modbus connection is currently established.
    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.connected
    }

    /// Point-in-time status snapshot.
    pub async fn status(&self) -> HandlerStatus {
        let conn = self.conn.lock().await;
        HandlerStatus {
            name: self.name.clone(),
            device_type: self.kind,
            ip: self.ip.clone(),
            port: self.port,
            connected: conn.connected,
            last_successful_read: conn.last_successful_read,
            poll_interval: self.poll_interval.as_secs(),
        }
    }

    /// Opens the Modbus connection if it is not already open.
    async fn ensure_connected(&self, conn: &mut Connection) -> Result<()> {
        if conn.ctx.is_some() {
            return Ok(());
        }

        let addr: SocketAddr = format!("{}:{}", self.ip, self.port).parse().map_err(|e| {
            Error::ModbusTransport {
                device: self.name.clone(),
                details: format!("invalid address: {e}"),
            }
        })?;

        debug!(device = %self.name, %addr, "opening modbus connection");
        let ctx = timeout(
            self.connect_timeout,
            tcp::connect_slave(addr, Slave(self.slave_id)),
        )
        .await
        .map_err(|_| {
            conn.connected = false;
            Error::ModbusTransport {
                device: self.name.clone(),
                details: format!("connect timed out after {:?}", self.connect_timeout),
            }
        })?
        .map_err(|e| {
            conn.connected = false;
            Error::ModbusTransport {
                device: self.name.clone(),
                details: format!("connect failed: {e}"),
            }
        })?;

        conn.ctx = Some(ctx);
        conn.connected = true;
        debug!(device = %self.name, "modbus connection established");
        Ok(())
    }

    /// Drops the connection after a transport failure.
    fn teardown(&self, conn: &mut Connection) {
        conn.ctx = None;
        conn.connected = false;
        debug!(device = %self.name, "modbus connection torn down");
    }

    /// Sweeps every readable register in the map and returns the raw values.
    ///
    /// The sweep is best-effort per register: a Modbus exception response
    /// skips that register and continues. A transport error tears down the
    /// connection and fails the whole sweep; the next scheduler tick
    /// reconnects.
    pub async fn read_data(&self) -> Result<BTreeMap<String, i64>> {
        let mut conn = self.conn.lock().await;
        self.ensure_connected(&mut conn).await?;

        let mut raw = BTreeMap::new();
        for (name, spec) in self.map.iter() {
            if !spec.function_code.is_readable() {
                continue;
            }

            let ctx = conn.ctx.as_mut().ok_or_else(|| Error::ModbusTransport {
                device: self.name.clone(),
                details: "connection lost mid-sweep".to_string(),
            })?;

            let response = match spec.function_code {
                FunctionCode::ReadHolding => {
                    ctx.read_holding_registers(spec.address, spec.register_count)
                        .await
                }
                FunctionCode::ReadInput => {
                    ctx.read_input_registers(spec.address, spec.register_count)
                        .await
                }
                FunctionCode::WriteSingle => continue,
            };

            match response {
                Ok(Ok(words)) if !words.is_empty() => {
                    raw.insert(name.to_string(), spec.data_type.decode(&words));
                }
                Ok(Ok(_)) => {
                    debug!(device = %self.name, register = name, "empty register response");
                }
                Ok(Err(exception)) => {
                    debug!(
                        device = %self.name,
                        register = name,
                        %exception,
                        "register read rejected"
                    );
                }
                Err(e) => {
                    self.teardown(&mut conn);
                    return Err(Error::ModbusTransport {
                        device: self.name.clone(),
                        details: format!("read of '{name}' failed: {e}"),
                    });
                }
            }
        }

        if raw.is_empty() {
            return Err(Error::ModbusTransport {
                device: self.name.clone(),
                details: "no registers could be read".to_string(),
            });
        }

        conn.last_successful_read = Some(Utc::now());
        debug!(device = %self.name, registers = raw.len(), "sweep complete");
        Ok(raw)
    }

    /// Writes a single register by name.
    ///
    /// Unknown names and registers whose function code is not 0x06 are
    /// rejected without touching the connection. A transport failure tears
    /// the connection down.
    pub async fn write_register(&self, register: &str, value: u16) -> Result<()> {
        let spec = self
            .map
            .lookup(register)
            .ok_or_else(|| Error::UnknownRegister {
                device: self.name.clone(),
                register: register.to_string(),
            })?;

        if !spec.function_code.is_writable() {
            return Err(Error::ReadOnlyRegister {
                device: self.name.clone(),
                register: register.to_string(),
            });
        }

        let mut conn = self.conn.lock().await;
        self.ensure_connected(&mut conn).await?;

        let ctx = conn.ctx.as_mut().ok_or_else(|| Error::ModbusTransport {
            device: self.name.clone(),
            details: "connection lost before write".to_string(),
        })?;

        info!(
            device = %self.name,
            register,
            address = spec.address,
            value,
            "writing register"
        );

        match ctx.write_single_register(spec.address, value).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(exception)) => Err(Error::ModbusException {
                device: self.name.clone(),
                exception: exception.to_string(),
            }),
            Err(e) => {
                self.teardown(&mut conn);
                Err(Error::ModbusTransport {
                    device: self.name.clone(),
                    details: format!("write of '{register}' failed: {e}"),
                })
            }
        }
    }

    fn require_kind(&self, expected: DeviceKind, command: &str) -> Result<()> {
        if self.kind == expected {
            Ok(())
        } else {
            Err(Error::UnsupportedCommand {
                command: command.to_string(),
                device_type: self.kind.to_string(),
            })
        }
    }

    /// BMS: switches the DC contactor on or off.
    pub async fn control_dc_contactor(&self, enable: bool) -> Result<()> {
        self.require_kind(DeviceKind::Bms, "dc_contactor")?;
        self.write_register("dc_contactor_control", u16::from(enable))
            .await?;
        info!(device = %self.name, enable, "DC contactor command sent");
        Ok(())
    }

    /// BMS: clears latched errors.
    pub async fn reset_errors(&self) -> Result<()> {
        self.require_kind(DeviceKind::Bms, "reset_errors")?;
        self.write_register("error_reset", BMS_RESET_MAGIC).await
    }

    /// BMS: releases the system lock.
    pub async fn reset_system_lock(&self) -> Result<()> {
        self.require_kind(DeviceKind::Bms, "reset_system_lock")?;
        self.write_register("system_lock_reset", BMS_RESET_MAGIC).await
    }

    /// PCS: selects the operating mode.
    pub async fn set_pcs_mode(&self, mode: PcsMode) -> Result<()> {
        self.require_kind(DeviceKind::Pcs, "operation_mode")?;
        self.write_register("operation_mode_control", mode.register_value())
            .await
    }

    /// PCS: sets the power reference in kW, applying the register scale.
    pub async fn set_power_reference(&self, power_kw: f64) -> Result<()> {
        self.require_kind(DeviceKind::Pcs, "power_reference")?;
        let value = self.scaled_value("power_reference", power_kw)?;
        self.write_register("power_reference", value).await
    }

    /// DCDC: selects the operating mode.
    pub async fn set_dcdc_mode(&self, mode: DcdcMode) -> Result<()> {
        self.require_kind(DeviceKind::Dcdc, "operation_mode")?;
        self.write_register("operation_mode_control", mode.register_value())
            .await
    }

    /// DCDC: sets the current reference in amps, applying the register scale.
    pub async fn set_current_reference(&self, current_a: f64) -> Result<()> {
        self.require_kind(DeviceKind::Dcdc, "current_reference")?;
        let value = self.scaled_value("current_reference", current_a)?;
        self.write_register("current_reference", value).await
    }

    /// DCDC: sets the voltage reference in volts, applying the register scale.
    pub async fn set_voltage_reference(&self, voltage_v: f64) -> Result<()> {
        self.require_kind(DeviceKind::Dcdc, "voltage_reference")?;
        let value = self.scaled_value("voltage_reference", voltage_v)?;
        self.write_register("voltage_reference", value).await
    }

    /// DCDC and PCS: clears latched faults.
    pub async fn reset_faults(&self) -> Result<()> {
        match self.kind {
            DeviceKind::Dcdc | DeviceKind::Pcs => self.write_register("fault_reset", 1).await,
            DeviceKind::Bms => Err(Error::UnsupportedCommand {
                command: "reset_faults".to_string(),
                device_type: self.kind.to_string(),
            }),
        }
    }

    /// Converts an engineering value to a raw register value using the map
    /// scale of the named register.
    fn scaled_value(&self, register: &str, engineering: f64) -> Result<u16> {
        let spec = self
            .map
            .lookup(register)
            .ok_or_else(|| Error::UnknownRegister {
                device: self.name.clone(),
                register: register.to_string(),
            })?;
        let scale = if spec.scale == 0.0 { 1.0 } else { spec.scale };
        Ok((engineering / scale).round() as u16)
    }

    /// Dispatches a device-specific control message.
    ///
    /// The payload carries a `command` verb plus verb-specific fields; the
    /// accepted verbs depend on the device kind.
    pub async fn handle_control_message(&self, payload: &serde_json::Value) -> Result<()> {
        let command = payload
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::InvalidCommand("missing 'command' field".to_string()))?;

        match (self.kind, command) {
            (DeviceKind::Bms, "dc_contactor") => {
                let enable = payload.get("enable").and_then(|v| v.as_bool()).unwrap_or(true);
                self.control_dc_contactor(enable).await
            }
            (DeviceKind::Bms, "reset_errors") => self.reset_errors().await,
            (DeviceKind::Bms, "reset_system_lock") => self.reset_system_lock().await,

            (DeviceKind::Dcdc, "operation_mode") => {
                let mode = required_str(payload, "mode")?.parse()?;
                self.set_dcdc_mode(mode).await
            }
            (DeviceKind::Dcdc, "current_reference") => {
                let amps = required_f64(payload, "current_a")?;
                self.set_current_reference(amps).await
            }
            (DeviceKind::Dcdc, "voltage_reference") => {
                let volts = required_f64(payload, "voltage_v")?;
                self.set_voltage_reference(volts).await
            }
            (DeviceKind::Dcdc, "reset_faults") => self.reset_faults().await,

            (DeviceKind::Pcs, "operation_mode") => {
                let mode = required_str(payload, "mode")?.parse()?;
                self.set_pcs_mode(mode).await
            }
            (DeviceKind::Pcs, "power_reference") => {
                let kw = required_f64(payload, "power_kw")?;
                self.set_power_reference(kw).await
            }
            (DeviceKind::Pcs, "reset_faults") => self.reset_faults().await,

            (kind, other) => {
                warn!(device = %self.name, command = other, "unsupported control command");
                Err(Error::UnsupportedCommand {
                    command: other.to_string(),
                    device_type: kind.to_string(),
                })
            }
        }
    }
}

fn required_str<'a>(payload: &'a serde_json::Value, field: &str) -> Result<&'a str> {
    payload
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::InvalidCommand(format!("missing '{field}' field")))
}

fn required_f64(payload: &serde_json::Value, field: &str) -> Result<f64> {
    payload
        .get(field)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| Error::InvalidCommand(format!("missing '{field}' field")))
}

//! Error types for the PMS supervisor.

use thiserror::Error;

/// Result type alias for PMS operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur while supervising the device fleet.
///
/// The taxonomy mirrors how errors are recovered: configuration and register
/// map errors are fatal at startup, Modbus transport errors drop the device
/// connection and are retried on the next poll, device errors are returned to
/// the caller without touching the connection, and MQTT errors are absorbed
/// by the reconnect policy.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or unreadable configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid register map content.
    #[error("Register map error: {0}")]
    RegisterMap(String),

    /// A command referenced a device that is not configured.
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// A write referenced a register name absent from the device map.
    #[error("Unknown register '{register}' on device '{device}'")]
    UnknownRegister {
        /// The device whose map was consulted
        device: String,
        /// The register name that was requested
        register: String,
    },

    /// A write targeted a register whose function code is not 0x06.
    #[error("Register '{register}' on device '{device}' is not writable")]
    ReadOnlyRegister {
        /// The device whose map was consulted
        device: String,
        /// The register name that was requested
        register: String,
    },

    /// The Modbus TCP connection failed or dropped mid-operation.
    ///
    /// The device connection is torn down; the next scheduler tick retries.
    #[error("Modbus transport error on device '{device}': {details}")]
    ModbusTransport {
        /// The device whose connection failed
        device: String,
        /// Additional details about the failure
        details: String,
    },

    /// The device answered with a Modbus exception response.
    #[error("Modbus exception from device '{device}': {exception}")]
    ModbusException {
        /// The device that returned the exception
        device: String,
        /// The exception code reported by the device
        exception: String,
    },

    /// A command is not supported by the target device kind.
    #[error("Unsupported command '{command}' for {device_type} device")]
    UnsupportedCommand {
        /// The command verb that was requested
        command: String,
        /// The kind of device it was sent to
        device_type: String,
    },

    /// MQTT broker connection or protocol failure.
    #[error("MQTT error: {0}")]
    Mqtt(String),

    /// Threshold configuration violated the ordering invariant.
    #[error("Invalid thresholds: {0}")]
    InvalidThresholds(String),

    /// The auto-mode state machine refused a request or a transition failed.
    #[error("State machine error: {0}")]
    StateMachine(String),

    /// A step of the auto-recovery script failed.
    #[error("Recovery step failed: {0}")]
    RecoveryStep(&'static str),

    /// Malformed inbound command payload.
    #[error("Invalid command payload: {0}")]
    InvalidCommand(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration parsing error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

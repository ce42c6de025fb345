use std::time::Duration;
use thiserror::Error;

use crate::devices::motor::{Command, OperatingMode};
use crate::devices::registers::Register;
use crate::services::monitor::MonitorState;

/// Failures of the physical link.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout occurred after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A response arrived but does not validate against the request that produced it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Response too short: {0} bytes")]
    TooShort(usize),

    #[error("CRC checksum mismatch (expected 0x{expected:04x}, received 0x{received:04x})")]
    CrcMismatch { expected: u16, received: u16 },

    #[error("Response from slave {got}, expected slave {expected}")]
    SlaveMismatch { expected: u8, got: u8 },

    #[error("Unexpected function code 0x{got:02x}, expected 0x{expected:02x}")]
    FunctionMismatch { expected: u8, got: u8 },

    #[error("Byte count mismatch: expected {expected}, got {got}")]
    ByteCountMismatch { expected: usize, got: usize },

    #[error("Write echo does not match the request")]
    EchoMismatch,

    #[error("Device exception code 0x{0:02x}")]
    Exception(u8),
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    #[error("{operation} rejected by device with exception code 0x{code:02x}")]
    Exception { operation: String, code: u8 },

    #[error("Write to {register} could not be confirmed: {reason}")]
    UnconfirmedWrite { register: Register, reason: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("{command} is not allowed while the motor is {mode}")]
    InvalidTransition {
        command: Command,
        mode: OperatingMode,
    },

    #[error("Speed setpoint {value}% outside the allowed range ±{limit}%")]
    SetpointOutOfRange { value: f64, limit: f64 },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Monitor is not running")]
    MonitorNotRunning,
}

#[derive(Error, Debug)]
#[error("Anomaly scoring failed: {0}")]
pub struct ScoringError(pub String);

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Cannot {action} while monitor is {from}")]
    InvalidState { from: MonitorState, action: &'static str },

    #[error("Monitor failed after {consecutive_failures} consecutive failed ticks: {last_error}")]
    Fatal {
        consecutive_failures: u32,
        last_error: String,
    },

    #[error("Poll interval must be positive, got {0:?}")]
    InvalidInterval(Duration),

    #[error("Monitor task terminated unexpectedly")]
    TaskPanicked,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Sink {0} is full, record dropped")]
    Backpressure(String),

    #[error("Sink {0} is closed")]
    Closed(String),

    #[error("Failed to write to {destination}: {source}")]
    Write {
        destination: String,
        source: std::io::Error,
    },
}

#[cfg(feature = "sqlite")]
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage IO error: {0}")]
    Io(#[from] std::io::Error),
}

//! Error types for bleherd-core.
//!
//! Every failure the state machines can observe is a variant of [`Error`].
//! Most of them are recovered locally and only ever show up in logs:
//!
//! | Error Type | Handling |
//! |------------|----------|
//! | [`Error::Bluetooth`], [`Error::ConnectionFailed`], [`Error::Timeout`] | Retried by the session supervisor |
//! | [`Error::NotConnected`], [`Error::WriteFailed`] | Logged, the duty cycle proceeds |
//! | [`Error::Decode`] | Logged, the notification is dropped |
//! | [`Error::CalibrationData`] | Logged, `0.0` is published |
//! | [`Error::AlreadyInProgress`], [`Error::NotRunning`], [`Error::ConnectionExhausted`] | Returned to the caller of an actuation |
//! | [`Error::CalibrationLoad`], [`Error::InvalidConfig`] | Startup failures |

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use bleherd_types::{DeviceRole, ParseError, QuantityKind};

/// Errors that can occur while supervising peripherals.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Connection failed with specific reason.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// The device address that failed to connect.
        device_id: Option<String>,
        /// The structured reason for the failure.
        reason: ConnectionFailureReason,
    },

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// Operation attempted while not connected to device.
    #[error("Not connected to device")]
    NotConnected,

    /// Write operation failed.
    #[error("Write failed to handle 0x{handle:04x}: {reason}")]
    WriteFailed {
        /// Target attribute handle.
        handle: u16,
        /// The reason for the failure.
        reason: String,
    },

    /// No characteristic is known for an attribute handle.
    #[error("Characteristic not found for handle 0x{handle:04x}")]
    CharacteristicNotFound {
        /// The handle that could not be resolved.
        handle: u16,
    },

    /// Malformed attribute payload.
    #[error("Decode error: {0}")]
    Decode(#[from] ParseError),

    /// A clamped key is missing from a calibration table.
    #[error("Calibration table for {kind} has no entry for key {key}")]
    CalibrationData {
        /// Quantity whose table is incomplete.
        kind: QuantityKind,
        /// The missing key.
        key: u16,
    },

    /// An actuation is already running on this device.
    #[error("Actuation already in progress on {address}")]
    AlreadyInProgress {
        /// Target device address.
        address: String,
    },

    /// The driver is stopped.
    #[error("Driver is not running")]
    NotRunning,

    /// Every connect attempt of a bounded retry failed.
    #[error("Could not connect to {address} after {attempts} attempts")]
    ConnectionExhausted {
        /// Target device address.
        address: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// Operation was cancelled by shutdown.
    #[error("Operation cancelled")]
    Cancelled,

    /// No tracked device has this address.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The operation does not apply to the device's role.
    #[error("Operation '{operation}' is not supported by a {role}")]
    UnsupportedRole {
        /// The requested operation.
        operation: String,
        /// The device's role.
        role: DeviceRole,
    },

    /// A calibration table could not be loaded.
    #[error("Failed to load calibration table {path}: {reason}")]
    CalibrationLoad {
        /// Table file.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Structured reasons for connection failures.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionFailureReason {
    /// Bluetooth adapter not available or powered off.
    AdapterUnavailable,
    /// The radio has not reported this address.
    UnknownPeripheral,
    /// Other/unknown error.
    Other(String),
}

impl std::fmt::Display for ConnectionFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AdapterUnavailable => write!(f, "Bluetooth adapter unavailable"),
            Self::UnknownPeripheral => write!(f, "peripheral not seen by the adapter"),
            Self::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl Error {
    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a connection failure with structured reason.
    pub fn connection_failed(device_id: Option<String>, reason: ConnectionFailureReason) -> Self {
        Self::ConnectionFailed { device_id, reason }
    }

    /// Create a write failure.
    pub fn write_failed(handle: u16, reason: impl Into<String>) -> Self {
        Self::WriteFailed {
            handle,
            reason: reason.into(),
        }
    }

    /// Create a device not found error.
    pub fn device_not_found(address: impl Into<String>) -> Self {
        Self::DeviceNotFound(address.into())
    }

    /// Create a calibration load error.
    pub fn calibration_load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CalibrationLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}

/// Result type alias using bleherd-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, shared by the transport
//! layer, the protocol codecs, every instrument driver and the storage collaborator.
//! Using the `thiserror` crate, it provides a centralized and consistent way to
//! report the different ways a sampling cycle can go wrong.
//!
//! ## Error Hierarchy
//!
//! - **Connection-level** (`Io`, `Serial`, `SerialPortNotConnected`,
//!   `SerialUnexpectedEof`): the transport itself is broken. A driver that hits one
//!   of these during an operation moves to [`DeviceState::Failed`].
//! - **Cycle-level** (`Timeout`, `Protocol`, `ModbusException`, `NoMatch`): the
//!   device answered badly or not at all this time. The affected channels are blank
//!   for one cycle and the driver stays connected.
//! - **Caller-level** (`Unsupported`, `InvalidSetpoint`, `Config`,
//!   `FeatureNotEnabled`, `Storage`): the request itself cannot be honoured.
//!
//! Every driver operation returns [`DriverResult`], so the orchestrator can consume
//! failures uniformly.
//!
//! [`DeviceState::Failed`]: crate::instrument::DeviceState::Failed

use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Result of a single driver operation.
pub type DriverResult<T> = std::result::Result<T, DaqError>;

/// Every failure the library reports
#[derive(Error, Debug)]
pub enum DaqError {
    /// Settings could not be loaded or are invalid
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Operating system I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial driver failure
    #[cfg(feature = "instrument_serial")]
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// Operation on a port that is not open
    #[error("Serial port not connected")]
    SerialPortNotConnected,

    /// Port closed while a response was expected
    #[error("Unexpected EOF from serial port")]
    SerialUnexpectedEof,

    /// Crate built without serial support
    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    /// No complete response within the read timeout
    #[error("Timed out after {0:?} waiting for a response")]
    Timeout(Duration),

    /// Malformed frame: bad CRC, wrong length or echo mismatch
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Station answered with a Modbus exception code
    #[error("Modbus exception 0x{code:02X} from station {station}")]
    ModbusException {
        /// Station that answered
        station: u8,
        /// Exception code from the response
        code: u8,
    },

    /// Poll window elapsed without a matching line
    #[error("No line matched the expected pattern within {0:?}")]
    NoMatch(Duration),

    /// Driver does not implement the operation
    #[error("Device does not support operation: {0}")]
    Unsupported(String),

    /// Setpoint is NaN or infinite
    #[error("Invalid setpoint {0}: value must be finite")]
    InvalidSetpoint(f32),

    /// Operation not allowed in the current session state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Data log could not be written or read
    #[error("Storage error: {0}")]
    Storage(String),

    /// Operation needs a cargo feature that is off
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl DaqError {
    /// Returns true when the error means the transport is unusable, as opposed to a
    /// single bad or missing answer.
    pub fn is_transport_failure(&self) -> bool {
        match self {
            DaqError::Io(e) => !matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ),
            #[cfg(feature = "instrument_serial")]
            DaqError::Serial(_) => true,
            DaqError::SerialPortNotConnected
            | DaqError::SerialUnexpectedEof
            | DaqError::SerialFeatureDisabled => true,
            _ => false,
        }
    }
}

#[cfg(feature = "storage_csv")]
impl From<csv::Error> for DaqError {
    fn from(err: csv::Error) -> Self {
        DaqError::Storage(err.to_string())
    }
}

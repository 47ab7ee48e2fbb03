//! Custom error types for the relay.
//!
//! This module defines the crate-level error type, `DaqError`, together with the two
//! collaborator error types that cross the core's boundary:
//!
//! - **`DeviceError`**: anything the acquisition device reports (session setup, reads,
//!   re-arming). Device errors are terminal for the current session.
//! - **`SinkError`**: anything the telemetry sink reports (publish, upsert, subscribe,
//!   timeouts). Sink errors are contained in the publisher and never touch the
//!   acquisition state.
//!
//! `DaqError` consolidates these with the control-surface failures (`InvalidParameter`,
//! `AlreadyRunning`, `InconsistentState`) and the ambient configuration and I/O errors.
//! Every `DaqError` maps onto an [`ErrorKind`], which is what error events carry.
//!
//! By using `#[from]`, `DaqError` can be created from the underlying error types with
//! the `?` operator.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::AcquisitionState;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Coarse error category carried by error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Bad start arguments; rejected before any device interaction.
    InvalidParameter,
    /// Start called while the engine was not stopped.
    AlreadyRunning,
    /// Device session setup, read or re-arm failure.
    Device,
    /// Publish or upsert failure.
    Sink,
    /// Engine reported running without a backing session.
    InconsistentState,
    /// Configuration could not be loaded or failed validation.
    Config,
    /// Operating-system I/O failure.
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidParameter => "InvalidParameter",
            Self::AlreadyRunning => "AlreadyRunning",
            Self::Device => "DeviceError",
            Self::Sink => "SinkError",
            Self::InconsistentState => "InconsistentState",
            Self::Config => "ConfigError",
            Self::Io => "IoError",
        };
        f.write_str(name)
    }
}

/// Crate-level error.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Start argument out of range
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Start while not stopped; carries the state found
    #[error("Acquisition already active (state: {0})")]
    AlreadyRunning(AcquisitionState),

    /// Device failure
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Telemetry sink failure
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// Engine bookkeeping disagrees with the device session
    #[error("Inconsistent engine state: {0}")]
    InconsistentState(String),

    /// Configuration could not be extracted
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Configuration loaded but failed validation
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DaqError {
    /// Category used when this error is reported as an event.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidParameter(_) => ErrorKind::InvalidParameter,
            Self::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            Self::Device(_) => ErrorKind::Device,
            Self::Sink(_) => ErrorKind::Sink,
            Self::InconsistentState(_) => ErrorKind::InconsistentState,
            Self::Config(_) | Self::Configuration(_) => ErrorKind::Config,
            Self::Io(_) => ErrorKind::Io,
        }
    }
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

/// Errors reported by an acquisition device.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// No device answered to the configured name
    #[error("Device '{device}' not found")]
    NotFound {
        /// Requested device name
        device: String,
    },

    /// The device rejected the session configuration
    #[error("Invalid session configuration: {message}")]
    Configuration {
        /// Driver message
        message: String,
    },

    /// A read could not be issued
    #[error("Failed to arm read: {message}")]
    ReadArm {
        /// Driver message
        message: String,
    },

    /// A completed read could not be collected
    #[error("Failed to complete read: {message}")]
    ReadComplete {
        /// Driver message
        message: String,
    },

    /// A read was requested while another was still pending
    #[error("Read already pending on session {session}")]
    ReadPending {
        /// Session identifier
        session: u64,
    },

    /// The session was stopped or disposed underneath the caller
    #[error("Session {session} is closed")]
    SessionClosed {
        /// Session identifier
        session: u64,
    },

    /// Hardware fault reported by the device
    #[error("Hardware error: {message}")]
    Hardware {
        /// Driver message
        message: String,
    },
}

impl DeviceError {
    /// Check if the device could not be found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if the failure came from a closed session.
    pub fn is_session_closed(&self) -> bool {
        matches!(self, Self::SessionClosed { .. })
    }
}

/// Errors reported by a telemetry sink.
#[derive(Error, Debug)]
pub enum SinkError {
    /// The sink could not be reached
    #[error("Sink connection error: {message}")]
    Connection {
        /// Client message
        message: String,
    },

    /// Publishing a message failed
    #[error("Publish to '{channel}' failed: {message}")]
    Publish {
        /// Target channel
        channel: String,
        /// Client message
        message: String,
    },

    /// Writing a key failed
    #[error("Upsert of '{key}' failed: {message}")]
    Upsert {
        /// Target key
        key: String,
        /// Client message
        message: String,
    },

    /// Subscribing or unsubscribing failed
    #[error("Subscription to '{channel}' failed: {message}")]
    Subscribe {
        /// Channel subscribed to
        channel: String,
        /// Client message
        message: String,
    },

    /// A sink call did not finish in time
    #[error("Sink {operation} timed out after {timeout:?}")]
    Timeout {
        /// `publish` or `upsert`
        operation: &'static str,
        /// Bound that was exceeded
        timeout: Duration,
    },

    /// Encoding or decoding a payload failed
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl SinkError {
    /// Check if this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_error_maps_to_device_kind() {
        let err: DaqError = DeviceError::Hardware {
            message: "ADC saturated".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Device);
        assert!(err.to_string().contains("ADC saturated"));
    }

    #[test]
    fn already_running_reports_state() {
        let err = DaqError::AlreadyRunning(AcquisitionState::Running);
        assert_eq!(err.kind(), ErrorKind::AlreadyRunning);
        assert!(err.to_string().contains("Running"));
    }

    #[test]
    fn sink_timeout_display() {
        let err = SinkError::Timeout {
            operation: "publish",
            timeout: Duration::from_millis(250),
        };
        assert!(err.is_timeout());
        assert!(err.to_string().contains("publish"));
        assert_eq!(DaqError::from(err).kind(), ErrorKind::Sink);
    }

    #[test]
    fn error_kind_display_names() {
        assert_eq!(ErrorKind::Device.to_string(), "DeviceError");
        assert_eq!(ErrorKind::InconsistentState.to_string(), "InconsistentState");
    }
}

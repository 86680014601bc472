//! Custom error types for the gateway.
//!
//! Each layer has its own `thiserror` enum so that a caller can tell a transient
//! hardware fault apart from a failure that is terminal for the current call:
//!
//! - **`DeviceError`**: opening a device failed (path missing, already held by this
//!   process, or the driver refused it).
//! - **`LinkError`**: a single read or write on an open link failed. `Io` is transient,
//!   `Disconnected` is a fatal disconnect signal, `Timeout` is never fatal.
//! - **`FrameError`**: a frame could not be encoded for the device.
//! - **`SessionError`**: a lease over a device could not be granted.
//! - **`GatewayError`**: the top-level error returned by the dispatcher and surfaced to
//!   network clients through [`ErrorKind`].
//!
//! `LinkError::Io` never crosses the session layer as-is: the session manager counts it
//! towards a reconnect cycle and reports the device as unavailable instead.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the gateway error type.
pub type AppResult<T> = std::result::Result<T, GatewayError>;

/// Failure to open a serial endpoint.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("device path '{0}' does not exist")]
    NotFound(String),

    #[error("device path '{0}' is already held by this gateway")]
    Busy(String),

    #[error("device '{0}' is unavailable")]
    Unavailable(String),

    #[error("failed to open '{path}': {reason}")]
    Open { path: String, reason: String },
}

/// Failure of a single read or write on an open link.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("serial operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial device disconnected")]
    Disconnected,
}

impl LinkError {
    /// Classify an I/O error raised by the underlying stream.
    ///
    /// Errors that mean the other end is gone become [`LinkError::Disconnected`];
    /// `TimedOut` becomes [`LinkError::Timeout`]; everything else is transient.
    pub fn from_io(err: std::io::Error, timeout: Duration) -> Self {
        use std::io::ErrorKind as Kind;
        match err.kind() {
            Kind::BrokenPipe
            | Kind::NotConnected
            | Kind::ConnectionReset
            | Kind::ConnectionAborted
            | Kind::UnexpectedEof => LinkError::Disconnected,
            Kind::TimedOut => LinkError::Timeout(timeout),
            _ => LinkError::Io(err),
        }
    }
}

/// Failure to encode a frame for the device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds the maximum of {max}")]
    TooLarge { len: usize, max: usize },

    #[error("payload contains the frame delimiter before its end")]
    EmbeddedDelimiter,
}

/// Failure to obtain a session lease.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("unknown device '{0}'")]
    NotFound(String),

    #[error("device '{device}' stayed busy for {waited:?}")]
    Busy { device: String, waited: Duration },

    #[error("device '{0}' is reconnecting")]
    Unavailable(String),

    #[error("device '{0}' is closed")]
    Closed(String),
}

/// Error category visible to network clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DeviceNotFound,
    Busy,
    Unavailable,
    Timeout,
    DeviceTimeout,
    MalformedFrame,
    Protocol,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::DeviceNotFound => "device_not_found",
            Self::Busy => "busy",
            Self::Unavailable => "unavailable",
            Self::Timeout => "timeout",
            Self::DeviceTimeout => "device_timeout",
            Self::MalformedFrame => "malformed_frame",
            Self::Protocol => "protocol",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Error returned by the dispatcher for one request.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("unknown device '{0}'")]
    DeviceNotFound(String),

    #[error("request queue for device '{0}' is full")]
    Busy(String),

    #[error("device '{device}' is unavailable: {reason}")]
    Unavailable { device: String, reason: String },

    #[error("no session for device '{0}' before the deadline")]
    Timeout(String),

    #[error("device '{device}' did not complete the exchange within {elapsed:?}")]
    DeviceTimeout { device: String, elapsed: Duration },

    #[error("malformed frame from device '{device}': {reason}")]
    MalformedFrame { device: String, reason: String },

    #[error("invalid request frame: {0}")]
    Frame(#[from] FrameError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// The category reported to network clients.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DeviceNotFound(_) => ErrorKind::DeviceNotFound,
            Self::Busy(_) => ErrorKind::Busy,
            Self::Unavailable { .. } => ErrorKind::Unavailable,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::DeviceTimeout { .. } => ErrorKind::DeviceTimeout,
            Self::MalformedFrame { .. } => ErrorKind::MalformedFrame,
            Self::Frame(_) | Self::Protocol(_) => ErrorKind::Protocol,
            Self::Config(_) | Self::Io(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn unavailable(device: &str, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            device: device.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<SessionError> for GatewayError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(device) => Self::DeviceNotFound(device),
            // Waiting out the deadline on a held lease is a caller-visible timeout.
            SessionError::Busy { device, .. } => Self::Timeout(device),
            SessionError::Unavailable(device) => Self::unavailable(&device, "reconnecting"),
            SessionError::Closed(device) => Self::unavailable(&device, "closed"),
        }
    }
}

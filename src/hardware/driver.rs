//! Device drivers: turn a [`DeviceConfig`] into an open [`SerialLink`].
//!
//! [`SystemDriver`] is the production driver. It opens real ports through
//! `tokio-serial` (feature `tokio_serial`) and starts in-process echo devices for
//! `kind = "loopback"`. Every driver keeps its own bookkeeping of the paths it
//! currently holds, so opening the same path twice fails with
//! [`DeviceError::Busy`] instead of interleaving two owners on one line.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::link::{SerialLink, StreamLink};
use super::simulated::SimulatedDevice;
use crate::codec::FrameCodec;
use crate::config::{DeviceConfig, DeviceKind};
use crate::error::DeviceError;

/// Buffer size of the in-process pipe backing virtual devices
pub(crate) const VIRTUAL_PIPE_BYTES: usize = 8 * 1024;

/// Opens device links
#[async_trait]
pub trait SerialDriver: Send + Sync {
    /// Open the device described by `config`
    ///
    /// # Errors
    /// - [`DeviceError::NotFound`] if the path does not exist
    /// - [`DeviceError::Busy`] if this driver already holds the path
    /// - [`DeviceError::Open`] for any other driver failure
    async fn open(&self, config: &DeviceConfig) -> Result<Box<dyn SerialLink>, DeviceError>;
}

/// Paths currently held open by one driver
#[derive(Debug, Clone, Default)]
pub struct PathRegistry {
    held: Arc<Mutex<HashSet<String>>>,
}

impl PathRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `path` as held, failing if it already is
    pub fn claim(&self, path: &str) -> Result<PathClaim, DeviceError> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(path.to_string()) {
            return Err(DeviceError::Busy(path.to_string()));
        }
        Ok(PathClaim {
            path: path.to_string(),
            registry: self.held.clone(),
        })
    }

    /// Whether `path` is currently held
    pub fn is_held(&self, path: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(path)
    }
}

/// Proof of holding a path; released on drop
#[derive(Debug)]
pub struct PathClaim {
    path: String,
    registry: Arc<Mutex<HashSet<String>>>,
}

impl Drop for PathClaim {
    fn drop(&mut self) {
        let mut held = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.path);
    }
}

/// Production driver for serial ports and loopback devices
#[derive(Debug, Default)]
pub struct SystemDriver {
    claims: PathRegistry,
}

impl SystemDriver {
    /// Create a driver with no open paths
    pub fn new() -> Self {
        Self::default()
    }

    fn open_loopback(&self, config: &DeviceConfig) -> Result<Box<dyn SerialLink>, DeviceError> {
        let claim = self.claims.claim(&config.path)?;
        let (near, far) = tokio::io::duplex(VIRTUAL_PIPE_BYTES);
        SimulatedDevice::echo(FrameCodec::from_config(&config.framing)).spawn(far);

        debug!(device = %config.id, path = %config.path, "Loopback device started");
        Ok(Box::new(
            StreamLink::new(config.path.clone(), near).with_claim(claim),
        ))
    }

    #[cfg(feature = "tokio_serial")]
    fn open_serial(&self, config: &DeviceConfig) -> Result<Box<dyn SerialLink>, DeviceError> {
        use tokio_serial::SerialPortBuilderExt;

        if serial_settings::path_missing(&config.path) {
            return Err(DeviceError::NotFound(config.path.clone()));
        }

        let claim = self.claims.claim(&config.path)?;

        let stream = tokio_serial::new(&config.path, config.baud_rate)
            .data_bits(serial_settings::data_bits(config.data_bits))
            .parity(serial_settings::parity(config.parity))
            .stop_bits(serial_settings::stop_bits(config.stop_bits))
            .flow_control(serial_settings::flow_control(config.flow_control))
            .timeout(config.read_timeout())
            .open_native_async()
            .map_err(|e| serial_settings::open_error(&config.path, e))?;

        #[cfg(unix)]
        let stream = {
            let mut stream = stream;
            if let Err(e) = stream.set_exclusive(true) {
                tracing::warn!(path = %config.path, error = %e, "Could not set exclusive mode");
            }
            stream
        };

        tracing::info!(
            device = %config.id,
            path = %config.path,
            baud_rate = config.baud_rate,
            "Serial port opened"
        );
        Ok(Box::new(
            StreamLink::new(config.path.clone(), stream).with_claim(claim),
        ))
    }

    #[cfg(not(feature = "tokio_serial"))]
    fn open_serial(&self, config: &DeviceConfig) -> Result<Box<dyn SerialLink>, DeviceError> {
        Err(DeviceError::Open {
            path: config.path.clone(),
            reason: "Serial support not enabled. Rebuild with --features tokio_serial"
                .to_string(),
        })
    }
}

#[async_trait]
impl SerialDriver for SystemDriver {
    async fn open(&self, config: &DeviceConfig) -> Result<Box<dyn SerialLink>, DeviceError> {
        match config.kind {
            DeviceKind::Loopback => self.open_loopback(config),
            DeviceKind::Serial => self.open_serial(config),
        }
    }
}

#[cfg(feature = "tokio_serial")]
mod serial_settings {
    use crate::config::{FlowControl, Parity};
    use crate::error::DeviceError;

    /// Device nodes exist as files on unix; COM ports on Windows do not.
    pub(super) fn path_missing(path: &str) -> bool {
        cfg!(unix) && !std::path::Path::new(path).exists()
    }

    pub(super) fn data_bits(bits: u8) -> tokio_serial::DataBits {
        match bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }

    pub(super) fn parity(parity: Parity) -> tokio_serial::Parity {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }

    pub(super) fn stop_bits(bits: u8) -> tokio_serial::StopBits {
        match bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        }
    }

    pub(super) fn flow_control(flow: FlowControl) -> tokio_serial::FlowControl {
        match flow {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::Software => tokio_serial::FlowControl::Software,
            FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
        }
    }

    pub(super) fn open_error(path: &str, err: tokio_serial::Error) -> DeviceError {
        match err.kind() {
            tokio_serial::ErrorKind::NoDevice => DeviceError::NotFound(path.to_string()),
            tokio_serial::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
                DeviceError::NotFound(path.to_string())
            }
            _ => DeviceError::Open {
                path: path.to_string(),
                reason: err.to_string(),
            },
        }
    }
}

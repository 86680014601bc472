//! Mock Driver
//!
//! Provides a [`SerialDriver`] backed by simulated devices for testing without
//! physical hardware. Every open starts a fresh [`SimulatedDevice`] on an in-process
//! pipe, and faults can be injected at runtime:
//!
//! - `fail_next_io(n)` - the next `n` link reads/writes fail with a transient I/O error
//! - `disconnect_next_io()` - the next link operation reports a disconnect
//! - `fail_next_opens(n)` / `block_opens(true)` - opens fail until released
//! - `set_silent(true)` - devices stop answering
//! - `set_close_delay(d)` - closing a link takes `d`
//!
//! # Example
//!
//! ```rust,ignore
//! let driver = MockDriver::echo();
//! driver.fail_next_io(2);          // two consecutive exchanges fail
//! driver.block_opens(true);        // keep the device reopening
//! // ... assert the device reports Unavailable ...
//! driver.block_opens(false);       // next reopen attempt succeeds
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::driver::{PathRegistry, SerialDriver, VIRTUAL_PIPE_BYTES};
use super::link::{SerialLink, StreamLink};
use super::simulated::{Responder, SimulatedDevice};
use crate::codec::{Frame, FrameCodec};
use crate::config::DeviceConfig;
use crate::error::{DeviceError, LinkError};

/// Driver producing simulated devices with injectable faults
#[derive(Clone)]
pub struct MockDriver {
    responder: Responder,
    faults: Arc<Faults>,
    claims: PathRegistry,
}

#[derive(Default)]
struct Faults {
    opens: AtomicU32,
    failing_opens: AtomicU32,
    opens_blocked: AtomicBool,
    failing_io: AtomicU32,
    disconnect_pending: AtomicBool,
    silent: Arc<AtomicBool>,
    response_delay_ms: AtomicU64,
    close_delay_ms: AtomicU64,
    heartbeat: Mutex<Option<(Bytes, Duration)>>,
}

/// Decrement `counter` if positive; true when a unit was taken
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl MockDriver {
    /// Devices answer each frame through `responder`
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&Frame) -> Option<Bytes> + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            faults: Arc::new(Faults::default()),
            claims: PathRegistry::new(),
        }
    }

    /// Devices echo every frame back
    pub fn echo() -> Self {
        Self::new(|frame| Some(frame.payload.clone()))
    }

    /// Delay applied by devices opened after this call
    pub fn set_response_delay(&self, delay: Duration) {
        self.faults
            .response_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Unsolicited frame emitted by devices opened after this call
    pub fn set_heartbeat(&self, payload: impl Into<Bytes>, interval: Duration) {
        let mut heartbeat = self
            .faults
            .heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *heartbeat = Some((payload.into(), interval));
    }

    /// Fail the next `count` link operations with a transient I/O error
    pub fn fail_next_io(&self, count: u32) {
        self.faults.failing_io.store(count, Ordering::SeqCst);
    }

    /// Report a disconnect on the next link operation
    pub fn disconnect_next_io(&self) {
        self.faults.disconnect_pending.store(true, Ordering::SeqCst);
    }

    /// Fail the next `count` opens
    pub fn fail_next_opens(&self, count: u32) {
        self.faults.failing_opens.store(count, Ordering::SeqCst);
    }

    /// Fail every open while `blocked` is set
    pub fn block_opens(&self, blocked: bool) {
        self.faults.opens_blocked.store(blocked, Ordering::SeqCst);
    }

    /// Stop (or resume) answering requests
    pub fn set_silent(&self, silent: bool) {
        self.faults.silent.store(silent, Ordering::SeqCst);
    }

    /// Make every link close take `delay`
    pub fn set_close_delay(&self, delay: Duration) {
        self.faults
            .close_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of open attempts so far
    pub fn open_count(&self) -> u32 {
        self.faults.opens.load(Ordering::SeqCst)
    }

    fn device_for(&self, config: &DeviceConfig) -> SimulatedDevice {
        let responder = self.responder.clone();
        let silent = self.faults.silent.clone();
        let gated: Responder = Arc::new(move |frame: &Frame| {
            if silent.load(Ordering::SeqCst) {
                None
            } else {
                responder(frame)
            }
        });

        let delay = Duration::from_millis(self.faults.response_delay_ms.load(Ordering::SeqCst));
        let mut device =
            SimulatedDevice::with_responder(FrameCodec::from_config(&config.framing), gated)
                .with_response_delay(delay);

        let heartbeat = self
            .faults
            .heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some((payload, interval)) = heartbeat {
            device = device.with_heartbeat(payload, interval);
        }
        device
    }
}

#[async_trait]
impl SerialDriver for MockDriver {
    async fn open(&self, config: &DeviceConfig) -> Result<Box<dyn SerialLink>, DeviceError> {
        self.faults.opens.fetch_add(1, Ordering::SeqCst);

        if self.faults.opens_blocked.load(Ordering::SeqCst) || take_one(&self.faults.failing_opens)
        {
            return Err(DeviceError::Open {
                path: config.path.clone(),
                reason: "injected open failure".to_string(),
            });
        }

        let claim = self.claims.claim(&config.path)?;
        let (near, far) = tokio::io::duplex(VIRTUAL_PIPE_BYTES);
        self.device_for(config).spawn(far);

        Ok(Box::new(FaultyLink {
            inner: StreamLink::new(config.path.clone(), near).with_claim(claim),
            faults: self.faults.clone(),
        }))
    }
}

/// Link that consults the injected faults before each operation
struct FaultyLink<S> {
    inner: StreamLink<S>,
    faults: Arc<Faults>,
}

impl<S> FaultyLink<S> {
    fn injected(&self) -> Option<LinkError> {
        if self.faults.disconnect_pending.swap(false, Ordering::SeqCst) {
            return Some(LinkError::Disconnected);
        }
        if take_one(&self.faults.failing_io) {
            return Some(LinkError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected I/O fault",
            )));
        }
        None
    }
}

#[async_trait]
impl<S> SerialLink for FaultyLink<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    fn path(&self) -> &str {
        self.inner.path()
    }

    async fn read(&mut self, max_bytes: usize, timeout: Duration) -> Result<Bytes, LinkError> {
        if let Some(err) = self.injected() {
            return Err(err);
        }
        self.inner.read(max_bytes, timeout).await
    }

    async fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize, LinkError> {
        if let Some(err) = self.injected() {
            return Err(err);
        }
        self.inner.write(data, timeout).await
    }

    async fn close(&mut self) {
        let delay = self.faults.close_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.inner.close().await;
    }
}

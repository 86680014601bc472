//! Device Session Manager
//!
//! Owns the open link of every configured device and hands out exclusive
//! [`Session`] leases over it. Serial hardware is half-duplex at best, so at most
//! one session per device exists at any instant; later callers queue on the
//! device lock (FIFO) until their deadline.
//!
//! # Failure handling
//!
//! Link failures never reach callers raw:
//!
//! - `LinkError::Timeout` ends the current exchange with `DeviceTimeout` and primes
//!   the device for resynchronization before its next exchange
//! - two consecutive `LinkError::Io`, or a single `LinkError::Disconnected`, close the
//!   stale link and move the device to [`DeviceState::Reopening`]
//!
//! While reopening, a background task retries `open` with bounded exponential
//! backoff and every `acquire` fails immediately with `SessionError::Unavailable`.
//! Other devices keep serving throughout.
//!
//! # Example
//!
//! ```rust,ignore
//! let manager = DeviceSessionManager::start(devices, reconnect, driver).await;
//! let deadline = Instant::now() + Duration::from_secs(1);
//! let reply = manager
//!     .with_device("d1", "req-1", deadline, |session| {
//!         Box::pin(async move { session.exchange(&Frame::from_network("*IDN?")).await })
//!     })
//!     .await?;
//! ```

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::codec::{DecodeOutcome, Frame, FrameCodec, FrameDecoder};
use crate::config::{DeviceConfig, ReconnectConfig};
use crate::error::{GatewayError, LinkError, SessionError};
use crate::hardware::{SerialDriver, SerialLink};
use crate::telegram::{TelegramAssembler, TelegramOutcome};

/// Consecutive transient I/O errors that trigger a reopen
const IO_ERRORS_BEFORE_REOPEN: u32 = 2;

/// Bytes requested from the link per read
const READ_CHUNK_BYTES: usize = 1024;

/// A drain read returning nothing within this window ends the drain
const DRAIN_QUIET: Duration = Duration::from_millis(20);

/// Upper bound on time spent draining stale bytes
const DRAIN_LIMIT: Duration = Duration::from_millis(200);

// =============================================================================
// Device State
// =============================================================================

/// Lifecycle state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    /// Link open, sessions are granted
    Open,
    /// Link lost; a background task is reopening it
    Reopening,
    /// Shut down
    Closed,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Open => write!(f, "open"),
            DeviceState::Reopening => write!(f, "reopening"),
            DeviceState::Closed => write!(f, "closed"),
        }
    }
}

/// Point-in-time view of one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Device identifier
    pub id: String,
    /// Port path
    pub path: String,
    /// Current state
    pub state: DeviceState,
    /// Most recent link or open error
    pub last_error: Option<String>,
    /// When `last_error` happened
    pub last_error_at: Option<DateTime<Utc>>,
    /// Reopen attempts in the current reopening cycle
    pub reconnect_attempts: u32,
    /// Request currently holding the session, if any
    pub session_owner: Option<String>,
}

#[derive(Debug)]
struct SlotStatus {
    state: DeviceState,
    last_error: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
    reconnect_attempts: u32,
    owner: Option<String>,
}

/// Everything only the session holder may touch
struct DeviceIo {
    link: Option<Box<dyn SerialLink>>,
    decoder: FrameDecoder,
    telegram: Option<TelegramAssembler>,
    consecutive_io_errors: u32,
    resync_pending: bool,
}

impl DeviceIo {
    /// Drop every partially received frame and telegram
    fn clear_input(&mut self) {
        self.decoder.reset();
        if let Some(telegram) = self.telegram.as_mut() {
            telegram.reset();
        }
    }
}

struct DeviceSlot {
    config: DeviceConfig,
    codec: FrameCodec,
    io: Arc<AsyncMutex<DeviceIo>>,
    status: Mutex<SlotStatus>,
}

impl DeviceSlot {
    fn new(config: DeviceConfig, link: Option<Box<dyn SerialLink>>) -> Self {
        let codec = FrameCodec::from_config(&config.framing);
        let state = if link.is_some() {
            DeviceState::Open
        } else {
            DeviceState::Reopening
        };
        Self {
            io: Arc::new(AsyncMutex::new(DeviceIo {
                link,
                decoder: codec.decoder(),
                telegram: config.telegram.clone().map(TelegramAssembler::new),
                consecutive_io_errors: 0,
                resync_pending: false,
            })),
            codec,
            config,
            status: Mutex::new(SlotStatus {
                state,
                last_error: None,
                last_error_at: None,
                reconnect_attempts: 0,
                owner: None,
            }),
        }
    }

    fn status(&self) -> std::sync::MutexGuard<'_, SlotStatus> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> DeviceState {
        self.status().state
    }

    fn set_state(&self, state: DeviceState) {
        let mut status = self.status();
        if state == DeviceState::Open {
            status.reconnect_attempts = 0;
        }
        status.state = state;
    }

    fn record_error(&self, error: &str) {
        let mut status = self.status();
        status.last_error = Some(error.to_string());
        status.last_error_at = Some(Utc::now());
    }

    fn check_available(&self) -> Result<(), SessionError> {
        match self.state() {
            DeviceState::Open => Ok(()),
            DeviceState::Reopening => Err(SessionError::Unavailable(self.config.id.clone())),
            DeviceState::Closed => Err(SessionError::Closed(self.config.id.clone())),
        }
    }

    fn snapshot(&self) -> DeviceStatus {
        let status = self.status();
        DeviceStatus {
            id: self.config.id.clone(),
            path: self.config.path.clone(),
            state: status.state,
            last_error: status.last_error.clone(),
            last_error_at: status.last_error_at,
            reconnect_attempts: status.reconnect_attempts,
            session_owner: status.owner.clone(),
        }
    }
}

/// State shared with sessions and reconnect tasks
struct Shared {
    driver: Arc<dyn SerialDriver>,
    reconnect: ReconnectConfig,
    shutdown_tx: broadcast::Sender<()>,
    closing: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

// =============================================================================
// Session Manager
// =============================================================================

/// Owns every device link and grants exclusive sessions over them
pub struct DeviceSessionManager {
    devices: HashMap<String, Arc<DeviceSlot>>,
    shared: Arc<Shared>,
}

impl DeviceSessionManager {
    /// Open all `devices` and start managing them
    ///
    /// A device that fails to open is logged and enters `Reopening`; startup
    /// itself never fails because of a single device.
    pub async fn start(
        devices: Vec<DeviceConfig>,
        reconnect: ReconnectConfig,
        driver: Arc<dyn SerialDriver>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let shared = Arc::new(Shared {
            driver,
            reconnect,
            shutdown_tx,
            closing: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let mut slots = HashMap::with_capacity(devices.len());
        for config in devices {
            let slot = match shared.driver.open(&config).await {
                Ok(link) => {
                    info!(
                        device = %config.id,
                        path = %config.path,
                        state = %DeviceState::Open,
                        "Device opened"
                    );
                    Arc::new(DeviceSlot::new(config, Some(link)))
                }
                Err(e) => {
                    warn!(
                        device = %config.id,
                        path = %config.path,
                        error = %e,
                        state = %DeviceState::Reopening,
                        "Device unavailable at startup"
                    );
                    let slot = Arc::new(DeviceSlot::new(config, None));
                    slot.record_error(&e.to_string());
                    spawn_reconnect(&slot, &shared);
                    slot
                }
            };
            slots.insert(slot.config.id.clone(), slot);
        }

        Self {
            devices: slots,
            shared,
        }
    }

    /// Identifiers of all managed devices, sorted
    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Current state of one device
    pub fn state(&self, device_id: &str) -> Option<DeviceState> {
        self.devices.get(device_id).map(|slot| slot.state())
    }

    /// Status of every device, sorted by id
    pub fn statuses(&self) -> Vec<DeviceStatus> {
        let mut statuses: Vec<DeviceStatus> =
            self.devices.values().map(|slot| slot.snapshot()).collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Obtain the exclusive session over `device_id`
    ///
    /// Waits while another session is outstanding, at most until `deadline`.
    ///
    /// # Errors
    /// - `NotFound` for an unknown device
    /// - `Unavailable` while the device is reopening (returned without waiting)
    /// - `Busy` if the lease was not granted before `deadline`
    /// - `Closed` after shutdown
    pub async fn acquire(
        &self,
        device_id: &str,
        request_id: &str,
        deadline: Instant,
    ) -> Result<Session, SessionError> {
        let slot = self
            .devices
            .get(device_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(device_id.to_string()))?;
        slot.check_available()?;

        let waiting_since = Instant::now();
        let io = tokio::time::timeout_at(deadline, slot.io.clone().lock_owned())
            .await
            .map_err(|_| {
                debug!(device = %device_id, request_id, "Session not granted before deadline");
                SessionError::Busy {
                    device: device_id.to_string(),
                    waited: waiting_since.elapsed(),
                }
            })?;

        // The device may have been lost while this caller was queued.
        slot.check_available()?;
        if io.link.is_none() {
            return Err(SessionError::Unavailable(device_id.to_string()));
        }

        slot.status().owner = Some(request_id.to_string());
        let acquired_at = Instant::now();
        debug!(
            device = %device_id,
            request_id,
            waited_ms = (acquired_at - waiting_since).as_millis() as u64,
            "Session acquired"
        );

        Ok(Session {
            request_id: request_id.to_string(),
            acquired_at,
            deadline,
            slot,
            shared: self.shared.clone(),
            io,
        })
    }

    /// Give a session back
    pub fn release(&self, session: Session) {
        drop(session);
    }

    /// Run `f` inside a session over `device_id`
    ///
    /// The session is released on every exit path. If `deadline` elapses while
    /// `f` runs, the exchange is abandoned, the device is primed for
    /// resynchronization and `DeviceTimeout` is returned.
    pub async fn with_device<T, F>(
        &self,
        device_id: &str,
        request_id: &str,
        deadline: Instant,
        f: F,
    ) -> Result<T, GatewayError>
    where
        F: for<'s> FnOnce(&'s mut Session) -> BoxFuture<'s, Result<T, GatewayError>>,
    {
        let mut session = self.acquire(device_id, request_id, deadline).await?;

        let outcome = tokio::time::timeout_at(deadline, f(&mut session)).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                session.mark_desynchronized("deadline elapsed during exchange");
                Err(GatewayError::DeviceTimeout {
                    device: device_id.to_string(),
                    elapsed: session.acquired_at.elapsed(),
                })
            }
        }
    }

    /// Stop reconnecting, wait for outstanding sessions up to `grace`, close every link
    pub async fn shutdown(&self, grace: Duration) {
        self.shared.closing.store(true, Ordering::SeqCst);
        let _ = self.shared.shutdown_tx.send(());
        let deadline = Instant::now() + grace;

        for id in self.device_ids() {
            let Some(slot) = self.devices.get(&id) else {
                continue;
            };
            match tokio::time::timeout_at(deadline, slot.io.lock()).await {
                Ok(mut io) => {
                    if let Some(mut link) = io.link.take() {
                        link.close().await;
                    }
                    io.clear_input();
                    slot.set_state(DeviceState::Closed);
                    info!(device = %id, state = %DeviceState::Closed, "Device closed");
                }
                Err(_) => {
                    slot.set_state(DeviceState::Closed);
                    warn!(device = %id, "Session still active after shutdown grace period");
                }
            }
        }

        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.shared.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for task in tasks {
            if tokio::time::timeout_at(deadline, task).await.is_err() {
                debug!("Reconnect task did not stop in time");
            }
        }
    }
}

// =============================================================================
// Session
// =============================================================================

/// Exclusive lease over one device
///
/// Dropping the session releases the device.
pub struct Session {
    request_id: String,
    acquired_at: Instant,
    deadline: Instant,
    slot: Arc<DeviceSlot>,
    shared: Arc<Shared>,
    io: OwnedMutexGuard<DeviceIo>,
}

impl Session {
    /// Request holding the lease
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Device the lease covers
    pub fn device_id(&self) -> &str {
        &self.slot.config.id
    }

    /// When the lease was granted
    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    /// Deadline of the owning request
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Write `request` and read the device's response frame
    pub async fn exchange(&mut self, request: &Frame) -> Result<Frame, GatewayError> {
        let bytes = self.slot.codec.encode(request)?;
        self.prepare_exchange().await?;
        self.write_bytes(&bytes).await?;
        self.read_frame().await
    }

    /// Write one frame without waiting for an answer
    pub async fn send(&mut self, frame: &Frame) -> Result<(), GatewayError> {
        let bytes = self.slot.codec.encode(frame)?;
        self.prepare_exchange().await?;
        self.write_bytes(&bytes).await
    }

    /// Read the next frame the device emits on its own
    ///
    /// On a device configured with a telegram, this is the next complete
    /// telegram; one failing its checksum is returned as `MalformedFrame`.
    pub async fn receive(&mut self) -> Result<Frame, GatewayError> {
        if self.io.resync_pending {
            self.io.clear_input();
            self.io.resync_pending = false;
        }
        if self.io.telegram.is_none() {
            return self.read_frame().await;
        }

        loop {
            let line = self.read_frame().await?;
            let outcome = match self.io.telegram.as_mut() {
                Some(telegram) => telegram.push(&line),
                None => return Ok(line),
            };
            match outcome {
                TelegramOutcome::Complete(frame) => {
                    debug!(
                        device = %self.slot.config.id,
                        bytes = frame.payload.len(),
                        "Telegram received"
                    );
                    return Ok(frame);
                }
                TelegramOutcome::Incomplete => {}
                TelegramOutcome::Rejected(reason) => {
                    warn!(device = %self.slot.config.id, %reason, "Telegram dropped");
                    return Err(GatewayError::MalformedFrame {
                        device: self.slot.config.id.clone(),
                        reason,
                    });
                }
            }
        }
    }

    /// Prime the device to resynchronize before its next exchange
    pub fn mark_desynchronized(&mut self, reason: &str) {
        self.io.resync_pending = true;
        warn!(
            device = %self.slot.config.id,
            request_id = %self.request_id,
            reason,
            "Exchange interrupted; device will be resynchronized"
        );
    }

    async fn prepare_exchange(&mut self) -> Result<(), GatewayError> {
        if self.io.resync_pending {
            self.io.clear_input();
            let drained = self.drain_link().await?;
            self.io.resync_pending = false;
            warn!(
                device = %self.slot.config.id,
                request_id = %self.request_id,
                drained_bytes = drained,
                "Device resynchronized"
            );
        } else if self.io.decoder.buffered() > 0 {
            debug!(
                device = %self.slot.config.id,
                bytes = self.io.decoder.buffered(),
                "Discarding unsolicited bytes before exchange"
            );
            self.io.clear_input();
        }
        Ok(())
    }

    /// Read and discard until the line goes quiet
    async fn drain_link(&mut self) -> Result<usize, GatewayError> {
        let until = self.deadline.min(Instant::now() + DRAIN_LIMIT);
        let mut drained = 0;
        loop {
            let now = Instant::now();
            if now >= until {
                return Ok(drained);
            }
            let quiet = DRAIN_QUIET.min(until - now);
            let link = self.link()?;
            let result = link.read(READ_CHUNK_BYTES, quiet).await;
            match result {
                Ok(bytes) => drained += bytes.len(),
                Err(LinkError::Timeout(_)) => return Ok(drained),
                Err(e) => return Err(self.on_link_error(e).await),
            }
        }
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), GatewayError> {
        let timeout = self.phase_timeout(self.slot.config.write_timeout())?;
        let link = self.link()?;
        let result = link.write(bytes, timeout).await;
        match result {
            Ok(written) => {
                self.io.consecutive_io_errors = 0;
                trace!(device = %self.slot.config.id, bytes = written, "Request frame written");
                Ok(())
            }
            Err(e) => Err(self.on_link_error(e).await),
        }
    }

    async fn read_frame(&mut self) -> Result<Frame, GatewayError> {
        let read_deadline = self
            .deadline
            .min(Instant::now() + self.slot.config.read_timeout());

        loop {
            match self.io.decoder.decode() {
                DecodeOutcome::Frame(frame) => {
                    trace!(
                        device = %self.slot.config.id,
                        bytes = frame.payload.len(),
                        "Response frame decoded"
                    );
                    return Ok(frame);
                }
                DecodeOutcome::Malformed(reason) => {
                    self.mark_desynchronized("malformed response frame");
                    return Err(GatewayError::MalformedFrame {
                        device: self.slot.config.id.clone(),
                        reason,
                    });
                }
                DecodeOutcome::Incomplete => {}
            }

            let now = Instant::now();
            if now >= read_deadline {
                let waited = read_deadline - self.acquired_at;
                return Err(self.on_link_error(LinkError::Timeout(waited)).await);
            }
            let link = self.link()?;
            let result = link.read(READ_CHUNK_BYTES, read_deadline - now).await;
            match result {
                Ok(bytes) => {
                    self.io.consecutive_io_errors = 0;
                    self.io.decoder.feed(&bytes);
                }
                Err(e) => return Err(self.on_link_error(e).await),
            }
        }
    }

    /// Remaining budget for one I/O phase, capped by the device timeout
    fn phase_timeout(&mut self, device_timeout: Duration) -> Result<Duration, GatewayError> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(GatewayError::DeviceTimeout {
                device: self.slot.config.id.clone(),
                elapsed: self.acquired_at.elapsed(),
            });
        }
        Ok(remaining.min(device_timeout))
    }

    fn link(&mut self) -> Result<&mut Box<dyn SerialLink>, GatewayError> {
        let device = &self.slot.config.id;
        self.io
            .link
            .as_mut()
            .ok_or_else(|| GatewayError::unavailable(device, "link closed"))
    }

    /// Translate a link failure into the caller-visible error
    async fn on_link_error(&mut self, err: LinkError) -> GatewayError {
        let device = self.slot.config.id.clone();
        self.slot.record_error(&err.to_string());

        match err {
            LinkError::Timeout(_) => {
                self.mark_desynchronized("device did not answer in time");
                GatewayError::DeviceTimeout {
                    device,
                    elapsed: self.acquired_at.elapsed(),
                }
            }
            LinkError::Io(e) => {
                self.io.consecutive_io_errors += 1;
                self.io.resync_pending = true;
                warn!(
                    device = %device,
                    error = %e,
                    consecutive = self.io.consecutive_io_errors,
                    "Serial I/O error"
                );
                if self.io.consecutive_io_errors >= IO_ERRORS_BEFORE_REOPEN {
                    self.begin_reopen("repeated I/O errors").await;
                }
                GatewayError::unavailable(&device, format!("I/O error: {}", e))
            }
            LinkError::Disconnected => {
                self.begin_reopen("device disconnected").await;
                GatewayError::unavailable(&device, "disconnected")
            }
        }
    }

    async fn begin_reopen(&mut self, reason: &str) {
        let stale = self.io.link.take();
        self.io.clear_input();
        self.io.consecutive_io_errors = 0;
        self.io.resync_pending = false;

        // Reopen is scheduled before awaiting `close`; a caller cancelled there
        // must not leave an open device without a link.
        if self.slot.state() != DeviceState::Closed {
            self.slot.set_state(DeviceState::Reopening);
            warn!(
                device = %self.slot.config.id,
                path = %self.slot.config.path,
                reason,
                state = %DeviceState::Reopening,
                "Device link lost"
            );
            spawn_reconnect(&self.slot, &self.shared);
        }

        if let Some(mut link) = stale {
            link.close().await;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.slot.status().owner = None;
        debug!(
            device = %self.slot.config.id,
            request_id = %self.request_id,
            held_ms = self.acquired_at.elapsed().as_millis() as u64,
            "Session released"
        );
    }
}

// =============================================================================
// Reconnection
// =============================================================================

fn spawn_reconnect(slot: &Arc<DeviceSlot>, shared: &Arc<Shared>) {
    if shared.closing.load(Ordering::SeqCst) {
        return;
    }
    let shutdown_rx = shared.shutdown_tx.subscribe();
    let handle = tokio::spawn(reconnect_loop(slot.clone(), shared.clone(), shutdown_rx));

    let mut tasks = shared.tasks.lock().unwrap_or_else(|e| e.into_inner());
    tasks.retain(|task| !task.is_finished());
    tasks.push(handle);
}

async fn reconnect_loop(
    slot: Arc<DeviceSlot>,
    shared: Arc<Shared>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let device = slot.config.id.clone();
    let mut attempt: u32 = 0;

    loop {
        let delay = shared.reconnect.delay_for(attempt);
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!(device = %device, "Reconnect cancelled by shutdown");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
        if shared.closing.load(Ordering::SeqCst) {
            return;
        }

        attempt = attempt.saturating_add(1);
        slot.status().reconnect_attempts = attempt;

        match shared.driver.open(&slot.config).await {
            Ok(mut link) => {
                let mut io = slot.io.lock().await;
                if slot.state() == DeviceState::Closed {
                    drop(io);
                    link.close().await;
                    return;
                }
                io.link = Some(link);
                io.clear_input();
                io.consecutive_io_errors = 0;
                io.resync_pending = false;
                slot.set_state(DeviceState::Open);
                info!(
                    device = %device,
                    attempts = attempt,
                    state = %DeviceState::Open,
                    "Device reconnected"
                );
                return;
            }
            Err(e) => {
                slot.record_error(&e.to_string());
                debug!(
                    device = %device,
                    attempt,
                    error = %e,
                    retry_in_ms = shared.reconnect.delay_for(attempt).as_millis() as u64,
                    "Reopen attempt failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::MockDriver;
    use tracing_test::traced_test;

    fn fast_reconnect() -> ReconnectConfig {
        ReconnectConfig {
            base_delay_ms: 10,
            max_delay_ms: 40,
        }
    }

    async fn manager_with(driver: MockDriver, ids: &[&str]) -> DeviceSessionManager {
        let devices = ids
            .iter()
            .map(|id| DeviceConfig::new(*id, format!("mock://{}", id)))
            .collect();
        DeviceSessionManager::start(devices, fast_reconnect(), Arc::new(driver)).await
    }

    fn in_ms(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[tokio::test]
    async fn test_exchange_round_trip() {
        let manager = manager_with(MockDriver::echo(), &["d1"]).await;
        let mut session = manager.acquire("d1", "r1", in_ms(500)).await.unwrap();
        assert_eq!(session.request_id(), "r1");

        let reply = session.exchange(&Frame::from_network("HELLO")).await.unwrap();
        assert_eq!(&reply.payload[..], b"HELLO\n");
        assert_eq!(manager.statuses()[0].session_owner.as_deref(), Some("r1"));

        manager.release(session);
        assert_eq!(manager.statuses()[0].session_owner, None);
    }

    #[tokio::test]
    async fn test_send_then_receive() {
        let manager = manager_with(MockDriver::echo(), &["d1"]).await;
        let mut session = manager.acquire("d1", "r1", in_ms(500)).await.unwrap();

        session.send(&Frame::from_network("TRIGGER")).await.unwrap();
        let frame = session.receive().await.unwrap();
        assert_eq!(&frame.payload[..], b"TRIGGER\n");
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let manager = manager_with(MockDriver::echo(), &["d1"]).await;
        let err = manager.acquire("nope", "r1", in_ms(50)).await.err().unwrap();
        assert_eq!(err, SessionError::NotFound("nope".to_string()));
    }

    #[tokio::test]
    async fn test_second_acquire_waits_then_busy() {
        let manager = manager_with(MockDriver::echo(), &["d1"]).await;
        let _held = manager.acquire("d1", "r1", in_ms(1000)).await.unwrap();

        let err = manager.acquire("d1", "r2", in_ms(30)).await.err().unwrap();
        assert!(matches!(err, SessionError::Busy { .. }));
    }

    #[tokio::test]
    async fn test_release_on_error_path() {
        let manager = manager_with(MockDriver::echo(), &["d1"]).await;
        let result: Result<(), GatewayError> = manager
            .with_device("d1", "r1", in_ms(200), |_session| {
                Box::pin(async { Err(GatewayError::Internal("boom".into())) })
            })
            .await;
        assert!(result.is_err());
        assert!(manager.acquire("d1", "r2", in_ms(50)).await.is_ok());
    }

    #[tokio::test]
    async fn test_silent_device_times_out_and_resyncs() {
        let driver = MockDriver::echo();
        driver.set_silent(true);
        let manager = manager_with(driver.clone(), &["d1"]).await;

        let err = manager
            .with_device("d1", "r1", in_ms(100), |session| {
                Box::pin(async move { session.exchange(&Frame::from_network("A")).await })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::DeviceTimeout { .. }));
        assert_eq!(manager.state("d1"), Some(DeviceState::Open));

        driver.set_silent(false);
        let reply = manager
            .with_device("d1", "r2", in_ms(500), |session| {
                Box::pin(async move { session.exchange(&Frame::from_network("B")).await })
            })
            .await
            .unwrap();
        assert_eq!(&reply.payload[..], b"B\n");
    }

    #[tokio::test]
    async fn test_disconnect_triggers_reopen() {
        let driver = MockDriver::echo();
        let manager = manager_with(driver.clone(), &["d1"]).await;
        driver.block_opens(true);
        driver.disconnect_next_io();

        let mut session = manager.acquire("d1", "r1", in_ms(500)).await.unwrap();
        let err = session.exchange(&Frame::from_network("A")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Unavailable { .. }));
        drop(session);

        assert_eq!(manager.state("d1"), Some(DeviceState::Reopening));
        let err = manager.acquire("d1", "r2", in_ms(500)).await.err().unwrap();
        assert_eq!(err, SessionError::Unavailable("d1".to_string()));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_reconnect_is_logged_as_transition() {
        let driver = MockDriver::echo();
        let manager = manager_with(driver.clone(), &["d1"]).await;
        driver.disconnect_next_io();

        let mut session = manager.acquire("d1", "r1", in_ms(500)).await.unwrap();
        assert!(session.exchange(&Frame::from_network("A")).await.is_err());
        drop(session);

        tokio::time::timeout(Duration::from_secs(2), async {
            while manager.state("d1") != Some(DeviceState::Open) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(logs_contain("Device link lost"));
        assert!(logs_contain("Device reconnected"));
    }

    #[tokio::test]
    async fn test_startup_failure_enters_reopening() {
        let driver = MockDriver::echo();
        driver.fail_next_opens(1);
        let manager = manager_with(driver.clone(), &["d1", "d2"]).await;

        let states: Vec<DeviceState> = manager.statuses().iter().map(|s| s.state).collect();
        assert!(states.contains(&DeviceState::Reopening));
        assert!(states.contains(&DeviceState::Open));

        tokio::time::timeout(Duration::from_secs(2), async {
            while manager.statuses().iter().any(|s| s.state != DeviceState::Open) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_devices() {
        let manager = manager_with(MockDriver::echo(), &["d1"]).await;
        manager.shutdown(Duration::from_millis(100)).await;

        assert_eq!(manager.state("d1"), Some(DeviceState::Closed));
        let err = manager.acquire("d1", "r1", in_ms(50)).await.err().unwrap();
        assert_eq!(err, SessionError::Closed("d1".to_string()));
    }
}

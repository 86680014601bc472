//! Request Dispatcher with per-device command queues
//!
//! Every device gets a bounded FIFO queue drained by a single worker task, so the
//! order in which [`Dispatcher::dispatch`] is called is the order in which
//! requests reach the device. The worker executes each job inside a session
//! obtained from the [`DeviceSessionManager`] and answers through a oneshot
//! channel.
//!
//! # Timeouts
//!
//! Every request carries an absolute deadline:
//!
//! - not started before the deadline (queued, or waiting for the session): `Timeout`
//! - started but the device did not finish in time: `DeviceTimeout`
//!
//! A timed-out request is never retried; a late device answer is discarded.

use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::codec::Frame;
use crate::error::GatewayError;
use crate::session::{DeviceSessionManager, DeviceStatus};

/// What to do with the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Write a frame and read the response frame
    Exchange(Bytes),
    /// Read the next frame the device emits, without writing
    Read,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Exchange(_) => write!(f, "request"),
            Operation::Read => write!(f, "read"),
        }
    }
}

/// A request bound for one device
#[derive(Debug, Clone)]
pub struct Request {
    /// Correlation id, also recorded as the session owner
    pub id: String,
    /// Target device identifier
    pub device: String,
    /// Operation to perform
    pub op: Operation,
    /// Absolute deadline for the whole request
    pub deadline: Instant,
}

impl Request {
    /// Exchange `payload` with `device` within `timeout`
    pub fn exchange(
        id: impl Into<String>,
        device: impl Into<String>,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            device: device.into(),
            op: Operation::Exchange(payload.into()),
            deadline: Instant::now() + timeout,
        }
    }

    /// Read the next unsolicited frame from `device` within `timeout`
    pub fn read(id: impl Into<String>, device: impl Into<String>, timeout: Duration) -> Self {
        Self {
            id: id.into(),
            device: device.into(),
            op: Operation::Read,
            deadline: Instant::now() + timeout,
        }
    }
}

/// Successful outcome of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Id of the originating request
    pub request_id: String,
    /// Device that answered
    pub device: String,
    /// Position of the request in the dispatcher's accept order
    pub sequence: u64,
    /// Response frame as read from the device
    pub payload: Bytes,
}

/// Job queued for a device worker
struct Job {
    request: Request,
    sequence: u64,
    accepted_at: Instant,
    started: Arc<AtomicBool>,
    reply_tx: oneshot::Sender<Result<Response, GatewayError>>,
}

/// Routes requests to per-device queues
pub struct Dispatcher {
    manager: Arc<DeviceSessionManager>,
    queues: HashMap<String, mpsc::Sender<Job>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
    next_sequence: AtomicU64,
}

impl Dispatcher {
    /// Start one worker per managed device
    ///
    /// `queue_capacity` bounds the number of requests waiting per device;
    /// beyond it `dispatch` fails fast with `Busy`.
    pub fn new(manager: Arc<DeviceSessionManager>, queue_capacity: usize) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut queues = HashMap::new();
        let mut workers = Vec::new();

        for device in manager.device_ids() {
            let (tx, rx) = mpsc::channel(queue_capacity.max(1));
            workers.push(tokio::spawn(run_worker(
                device.clone(),
                rx,
                manager.clone(),
                shutdown_tx.subscribe(),
            )));
            queues.insert(device, tx);
        }

        Self {
            manager,
            queues,
            workers: Mutex::new(workers),
            shutdown_tx,
            next_sequence: AtomicU64::new(0),
        }
    }

    /// Session manager behind this dispatcher
    pub fn manager(&self) -> &Arc<DeviceSessionManager> {
        &self.manager
    }

    /// Status snapshot of every device
    pub fn device_statuses(&self) -> Vec<DeviceStatus> {
        self.manager.statuses()
    }

    /// Run `request` against its device, in accept order
    ///
    /// Always returns by `request.deadline`.
    pub async fn dispatch(&self, request: Request) -> Result<Response, GatewayError> {
        let device = request.device.clone();
        let deadline = request.deadline;
        let tx = self
            .queues
            .get(&device)
            .ok_or_else(|| GatewayError::DeviceNotFound(device.clone()))?;

        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let started = Arc::new(AtomicBool::new(false));
        let accepted_at = Instant::now();
        let (reply_tx, reply_rx) = oneshot::channel();

        trace!(
            device = %device,
            request_id = %request.id,
            sequence,
            op = %request.op,
            "Request accepted"
        );

        let job = Job {
            request,
            sequence,
            accepted_at,
            started: started.clone(),
            reply_tx,
        };
        match tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                debug!(device = %device, request_id = %job.request.id, "Device queue full");
                return Err(GatewayError::Busy(device));
            }
            Err(TrySendError::Closed(_)) => {
                return Err(GatewayError::unavailable(&device, "shutting down"));
            }
        }

        match tokio::time::timeout_at(deadline, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::unavailable(&device, "shutting down")),
            Err(_) if started.load(Ordering::SeqCst) => Err(GatewayError::DeviceTimeout {
                device,
                elapsed: accepted_at.elapsed(),
            }),
            Err(_) => Err(GatewayError::Timeout(device)),
        }
    }

    /// Stop all workers, letting each finish its current job within `grace`
    pub async fn shutdown(&self, grace: Duration) {
        let _ = self.shutdown_tx.send(());
        let workers: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.drain(..).collect()
        };

        let deadline = Instant::now() + grace;
        for worker in workers {
            let abort = worker.abort_handle();
            if tokio::time::timeout_at(deadline, worker).await.is_err() {
                warn!("Dispatcher worker did not finish within grace period; aborting");
                abort.abort();
            }
        }
    }
}

async fn run_worker(
    device: String,
    mut rx: mpsc::Receiver<Job>,
    manager: Arc<DeviceSessionManager>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    debug!(device = %device, "Dispatcher worker started");

    loop {
        let job = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        if job.reply_tx.is_closed() {
            trace!(device = %device, request_id = %job.request.id, "Caller gone; job skipped");
            continue;
        }
        if Instant::now() >= job.request.deadline {
            let _ = job.reply_tx.send(Err(GatewayError::Timeout(device.clone())));
            continue;
        }

        let result = execute(&manager, &job).await;
        match &result {
            Ok(response) => debug!(
                device = %device,
                request_id = %response.request_id,
                sequence = response.sequence,
                bytes = response.payload.len(),
                elapsed_ms = job.accepted_at.elapsed().as_millis() as u64,
                "Request completed"
            ),
            Err(e) => debug!(
                device = %device,
                request_id = %job.request.id,
                kind = %e.kind(),
                error = %e,
                "Request failed"
            ),
        }
        let _ = job.reply_tx.send(result);
    }

    // Fail whatever is still queued so callers do not wait out their deadline.
    rx.close();
    while let Ok(job) = rx.try_recv() {
        let _ = job
            .reply_tx
            .send(Err(GatewayError::unavailable(&device, "shutting down")));
    }
    debug!(device = %device, "Dispatcher worker stopped");
}

async fn execute(manager: &DeviceSessionManager, job: &Job) -> Result<Response, GatewayError> {
    let request = &job.request;
    let op = request.op.clone();
    let sequence = job.sequence;
    let started = job.started.clone();

    let frame = manager
        .with_device(&request.device, &request.id, request.deadline, move |session| {
            started.store(true, Ordering::SeqCst);
            Box::pin(async move {
                match op {
                    Operation::Exchange(payload) => {
                        let frame = Frame::from_network(payload).with_sequence(sequence);
                        session.exchange(&frame).await
                    }
                    Operation::Read => session.receive().await,
                }
            })
        })
        .await?;

    Ok(Response {
        request_id: request.id.clone(),
        device: request.device.clone(),
        sequence,
        payload: frame.payload,
    })
}

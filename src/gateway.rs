//! Gateway assembly and process lifecycle.
//!
//! Wires the layers together at startup (session manager, dispatcher, listener)
//! and tears them down in the reverse order on shutdown:
//!
//! 1. stop accepting and drain client connections
//! 2. stop the dispatcher workers
//! 3. close every device
//!
//! All three steps share one grace budget (`server.shutdown_grace_ms`).

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::GatewayConfig;
use crate::dispatcher::Dispatcher;
use crate::error::AppResult;
use crate::hardware::SerialDriver;
use crate::server::Listener;
use crate::session::DeviceSessionManager;

/// A running gateway
pub struct Gateway {
    config: GatewayConfig,
    manager: Arc<DeviceSessionManager>,
    dispatcher: Arc<Dispatcher>,
    listener: Listener,
    local_addr: SocketAddr,
}

impl Gateway {
    /// Validate `config`, open devices and bind the listener
    ///
    /// Devices with invalid settings are skipped and logged; devices that fail to
    /// open start out reconnecting. Only a global configuration error or a failed
    /// bind aborts startup.
    pub async fn start(config: GatewayConfig, driver: Arc<dyn SerialDriver>) -> AppResult<Self> {
        config.validate()?;

        let (devices, rejected) = config.partition_devices();
        for (device, err) in &rejected {
            error!(device = %device, error = %err, "Device configuration rejected; skipping");
        }

        let manager =
            Arc::new(DeviceSessionManager::start(devices, config.reconnect.clone(), driver).await);
        let dispatcher = Arc::new(Dispatcher::new(
            manager.clone(),
            config.server.queue_capacity,
        ));
        let listener = Listener::bind(config.server.clone(), dispatcher.clone()).await?;
        let local_addr = listener.local_addr()?;

        info!(
            listen = %local_addr,
            devices = manager.device_ids().len(),
            rejected = rejected.len(),
            "Gateway started"
        );

        Ok(Self {
            config,
            manager,
            dispatcher,
            listener,
            local_addr,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Dispatcher serving this gateway
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// Serve until `signal` completes, then shut down gracefully
    pub async fn run_until<F>(self, signal: F) -> AppResult<()>
    where
        F: Future<Output = ()>,
    {
        let Gateway {
            config,
            manager,
            dispatcher,
            listener,
            ..
        } = self;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let listener_task = tokio::spawn(listener.run(shutdown_rx));

        signal.await;
        let grace = config.server.shutdown_grace();
        let started = Instant::now();
        info!(grace_ms = grace.as_millis() as u64, "Shutdown requested");
        let _ = shutdown_tx.send(());

        match listener_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Listener stopped with error"),
            Err(e) => error!(error = %e, "Listener task failed"),
        }

        dispatcher
            .shutdown(grace.saturating_sub(started.elapsed()))
            .await;
        manager
            .shutdown(grace.saturating_sub(started.elapsed()))
            .await;

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Gateway stopped"
        );
        Ok(())
    }
}

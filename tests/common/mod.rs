//! Shared helpers for gateway integration tests.
#![allow(dead_code)]

use serde_json::Value;
use serial_gateway::config::{DeviceConfig, GatewayConfig, ReconnectConfig};
use serial_gateway::error::AppResult;
use serial_gateway::gateway::Gateway;
use serial_gateway::hardware::MockDriver;
use serial_gateway::protocol::ClientResponse;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Mock-backed device with default line settings
pub fn mock_device(id: &str) -> DeviceConfig {
    DeviceConfig::new(id, format!("mock://{}", id))
}

/// Configuration listening on an ephemeral localhost port
pub fn test_config(devices: Vec<DeviceConfig>) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.server.listen = "127.0.0.1:0".to_string();
    config.server.shutdown_grace_ms = 500;
    config.reconnect = ReconnectConfig {
        base_delay_ms: 10,
        max_delay_ms: 50,
    };
    config.devices = devices;
    config
}

/// Gateway running in a background task
pub struct TestGateway {
    pub addr: SocketAddr,
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<AppResult<()>>,
}

impl TestGateway {
    pub async fn start(driver: MockDriver, config: GatewayConfig) -> Self {
        let gateway = Gateway::start(config, Arc::new(driver))
            .await
            .expect("gateway should start");
        let addr = gateway.local_addr();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(gateway.run_until(async {
            let _ = stop_rx.await;
        }));
        Self {
            addr,
            stop_tx: Some(stop_tx),
            task,
        }
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        tokio::time::timeout(Duration::from_secs(5), &mut self.task)
            .await
            .expect("gateway should stop within grace")
            .expect("gateway task panicked")
            .expect("gateway stopped with error");
    }
}

/// Line-protocol client
pub struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (reader, writer) = stream.into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    pub async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.expect("write");
        self.writer.write_all(b"\n").await.expect("write");
    }

    /// Next response line, `None` once the server closed the connection
    pub async fn next_response(&mut self) -> Option<ClientResponse> {
        let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("response within 5s")
            .ok()??;
        Some(serde_json::from_str(&line).expect("response is JSON"))
    }

    pub async fn call(&mut self, request: Value) -> ClientResponse {
        self.send_raw(&request.to_string()).await;
        self.next_response().await.expect("connection closed early")
    }
}

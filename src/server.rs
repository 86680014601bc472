//! Network Listener
//!
//! Accepts TCP connections and serves the line protocol from [`crate::protocol`].
//! Each connection runs in its own task and handles its requests one at a time;
//! connections never share state beyond the dispatcher's per-device queues.
//!
//! A malformed message (bad JSON, unknown op, missing fields, oversized line) is
//! answered with a `protocol` error and the connection is closed. Device
//! sessions belonging to other connections are not affected.

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, info, trace, warn};

use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{AppResult, GatewayError};
use crate::protocol::{ClientRequest, ClientResponse, Command};

/// How long a rejected client gets to stop sending before the socket is dropped
const LINGER: Duration = Duration::from_millis(200);

/// Bound TCP listener serving the gateway protocol
pub struct Listener {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    config: ServerConfig,
}

impl Listener {
    /// Bind to `config.listen`
    pub async fn bind(config: ServerConfig, dispatcher: Arc<Dispatcher>) -> AppResult<Self> {
        let listener = TcpListener::bind(&config.listen).await?;
        Ok(Self {
            listener,
            dispatcher,
            config,
        })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires, then drain them
    ///
    /// Open connections get `shutdown_grace` to finish their current request;
    /// whatever is left after that is aborted.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> AppResult<()> {
        let mut connections = JoinSet::new();
        info!(listen = %self.local_addr()?, "Listening for clients");

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Client connected");
                        connections.spawn(serve_connection(
                            stream,
                            peer,
                            self.dispatcher.clone(),
                            self.config.clone(),
                            shutdown.resubscribe(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        let open = connections.len();
        info!(open_connections = open, "Listener stopped accepting");
        let drained = tokio::time::timeout(self.config.shutdown_grace(), async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = connections.len(),
                "Connections still open after grace period; aborting"
            );
            connections.shutdown().await;
        }
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    config: ServerConfig,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut lines = Framed::new(
        stream,
        LinesCodec::new_with_max_length(config.max_request_bytes),
    );

    loop {
        let next = tokio::select! {
            _ = shutdown.recv() => {
                debug!(%peer, "Closing connection for shutdown");
                break;
            }
            next = tokio::time::timeout(config.idle_timeout(), lines.next()) => next,
        };

        let line = match next {
            Err(_) => {
                debug!(%peer, "Idle connection closed");
                break;
            }
            Ok(None) => break,
            Ok(Some(Ok(line))) => line,
            Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                let err = GatewayError::Protocol(format!(
                    "request exceeds {} bytes",
                    config.max_request_bytes
                ));
                warn!(%peer, error = %err, "Rejecting client");
                if send(&mut lines, &ClientResponse::error(None, &err)).await.is_ok() {
                    linger(lines.into_inner()).await;
                }
                return;
            }
            Ok(Some(Err(LinesCodecError::Io(e)))) => {
                debug!(%peer, error = %e, "Client read failed");
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let (response, close) = handle_line(&line, peer, &dispatcher, &config).await;
        if send(&mut lines, &response).await.is_err() {
            break;
        }
        if close {
            linger(lines.into_inner()).await;
            return;
        }
    }

    debug!(%peer, "Client disconnected");
}

/// Close after an error response without resetting the connection
///
/// Unread client input at close time makes the kernel send RST, which can
/// discard the response before the client reads it.
async fn linger(mut stream: TcpStream) {
    let _ = stream.shutdown().await;
    let mut scratch = [0u8; 1024];
    let _ = tokio::time::timeout(LINGER, async {
        while matches!(stream.read(&mut scratch).await, Ok(n) if n > 0) {}
    })
    .await;
    debug!("Client connection closed after protocol error");
}

/// Produce the response for one line, and whether to close afterwards
async fn handle_line(
    line: &str,
    peer: SocketAddr,
    dispatcher: &Dispatcher,
    config: &ServerConfig,
) -> (ClientResponse, bool) {
    let received_at = Instant::now();
    let request = match ClientRequest::parse(line) {
        Ok(request) => request,
        Err(err) => {
            warn!(%peer, error = %err, "Malformed client message");
            return (ClientResponse::error(None, &err), true);
        }
    };

    let client_id = request.id.clone();
    let request_id = request.request_id();
    let command = match request.into_command(request_id.clone(), config, received_at) {
        Ok(command) => command,
        Err(err) => {
            warn!(%peer, request_id = %request_id, error = %err, "Invalid client request");
            return (ClientResponse::error(client_id, &err), true);
        }
    };

    let response = match command {
        Command::Ping => ClientResponse::pong(client_id),
        Command::Devices => ClientResponse::devices(client_id, dispatcher.device_statuses()),
        Command::Dispatch(request) => {
            trace!(
                %peer,
                request_id = %request.id,
                device = %request.device,
                op = %request.op,
                "Dispatching request"
            );
            match dispatcher.dispatch(request).await {
                Ok(response) => ClientResponse::payload(client_id, &response.payload),
                Err(err) => ClientResponse::error(client_id, &err),
            }
        }
    };
    (response, false)
}

async fn send(
    lines: &mut Framed<TcpStream, LinesCodec>,
    response: &ClientResponse,
) -> Result<(), LinesCodecError> {
    let line = match response.to_line() {
        Ok(line) => line,
        Err(err) => ClientResponse::error(response.id.clone(), &err)
            .to_line()
            .unwrap_or_else(|_| r#"{"ok":false}"#.to_string()),
    };
    lines.send(line).await
}

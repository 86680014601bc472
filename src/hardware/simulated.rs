//! In-process simulated serial device.
//!
//! Sits on the far end of an async byte stream, decodes whatever the gateway
//! writes with the device's own framing, and answers through a responder
//! closure. Used for `kind = "loopback"` devices and by [`MockDriver`].
//!
//! [`MockDriver`]: super::mock::MockDriver

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::codec::{DecodeOutcome, Frame, FrameCodec};

/// Maps a received frame to the payload sent back, if any
pub type Responder = Arc<dyn Fn(&Frame) -> Option<Bytes> + Send + Sync>;

/// A device simulated by a background task
pub struct SimulatedDevice {
    codec: FrameCodec,
    responder: Responder,
    response_delay: Duration,
    heartbeat: Option<(Bytes, Duration)>,
}

impl SimulatedDevice {
    /// Device answering each frame through `responder`
    pub fn new<F>(codec: FrameCodec, responder: F) -> Self
    where
        F: Fn(&Frame) -> Option<Bytes> + Send + Sync + 'static,
    {
        Self::with_responder(codec, Arc::new(responder))
    }

    /// Device answering through a shared responder
    pub fn with_responder(codec: FrameCodec, responder: Responder) -> Self {
        Self {
            codec,
            responder,
            response_delay: Duration::ZERO,
            heartbeat: None,
        }
    }

    /// Device that sends every frame straight back
    pub fn echo(codec: FrameCodec) -> Self {
        Self::new(codec, |frame| Some(frame.payload.clone()))
    }

    /// Wait `delay` before each answer
    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    /// Emit `payload` unprompted every `interval`
    pub fn with_heartbeat(mut self, payload: impl Into<Bytes>, interval: Duration) -> Self {
        self.heartbeat = Some((payload.into(), interval));
        self
    }

    /// Run the device on `stream` until the other end goes away
    pub fn spawn<S>(self, stream: S) -> JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        tokio::spawn(self.run(stream))
    }

    async fn run<S>(self, mut stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut decoder = self.codec.decoder();
        let mut buf = vec![0u8; 1024];
        let heartbeat_every = self
            .heartbeat
            .as_ref()
            .map(|(_, every)| *every)
            .unwrap_or(Duration::from_secs(3600));
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + heartbeat_every,
            heartbeat_every,
        );

        loop {
            tokio::select! {
                read = stream.read(&mut buf) => {
                    let n = match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    decoder.feed(&buf[..n]);
                }
                _ = heartbeat.tick(), if self.heartbeat.is_some() => {
                    if let Some((payload, _)) = &self.heartbeat {
                        if self.send(&mut stream, payload.clone()).await.is_err() {
                            break;
                        }
                    }
                    continue;
                }
            }

            loop {
                match decoder.decode() {
                    DecodeOutcome::Frame(frame) => {
                        trace!(bytes = frame.payload.len(), "Simulated device received frame");
                        if let Some(reply) = (self.responder)(&frame) {
                            if !self.response_delay.is_zero() {
                                tokio::time::sleep(self.response_delay).await;
                            }
                            if self.send(&mut stream, reply).await.is_err() {
                                return;
                            }
                        }
                    }
                    DecodeOutcome::Malformed(reason) => {
                        trace!(%reason, "Simulated device dropped malformed input");
                    }
                    DecodeOutcome::Incomplete => break,
                }
            }
        }
    }

    async fn send<S>(&self, stream: &mut S, payload: Bytes) -> std::io::Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        // Replies the codec refuses are written as-is, like a misbehaving device.
        let bytes = self
            .codec
            .encode(&Frame::from_device(payload.clone()))
            .unwrap_or(payload);
        stream.write_all(&bytes).await?;
        stream.flush().await
    }
}

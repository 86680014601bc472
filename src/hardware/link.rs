//! Serial link abstraction.
//!
//! A [`SerialLink`] is one open device handle. Every read and write carries a
//! timeout; a missed deadline is reported as [`LinkError::Timeout`] and leaves the
//! link usable, so the caller decides whether to try again.
//!
//! [`StreamLink`] implements the trait over any async byte stream. The system
//! driver wraps a `tokio_serial::SerialStream` in it, and loopback/mock devices
//! wrap one end of a `tokio::io::duplex` pipe.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use super::driver::PathClaim;
use crate::error::LinkError;

/// Raw byte access to one open device
#[async_trait]
pub trait SerialLink: Send {
    /// Path or identifier the link was opened from
    fn path(&self) -> &str;

    /// Read up to `max_bytes`, waiting at most `timeout` for the first byte
    async fn read(&mut self, max_bytes: usize, timeout: Duration) -> Result<Bytes, LinkError>;

    /// Write all of `data` within `timeout`, returning the number of bytes written
    async fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize, LinkError>;

    /// Release the handle; later reads and writes report `Disconnected`
    async fn close(&mut self);
}

/// [`SerialLink`] over an async byte stream
pub struct StreamLink<S> {
    path: String,
    stream: Option<S>,
    claim: Option<PathClaim>,
}

impl<S> StreamLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an already-open stream
    pub fn new(path: impl Into<String>, stream: S) -> Self {
        Self {
            path: path.into(),
            stream: Some(stream),
            claim: None,
        }
    }

    /// Keep `claim` alive for as long as the link is open
    pub(crate) fn with_claim(mut self, claim: PathClaim) -> Self {
        self.claim = Some(claim);
        self
    }
}

#[async_trait]
impl<S> SerialLink for StreamLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn path(&self) -> &str {
        &self.path
    }

    async fn read(&mut self, max_bytes: usize, timeout: Duration) -> Result<Bytes, LinkError> {
        let stream = self.stream.as_mut().ok_or(LinkError::Disconnected)?;
        let mut buf = vec![0u8; max_bytes.max(1)];

        match tokio::time::timeout(timeout, stream.read(&mut buf)).await {
            Err(_) => Err(LinkError::Timeout(timeout)),
            // EOF on a serial line means the device went away.
            Ok(Ok(0)) => Err(LinkError::Disconnected),
            Ok(Ok(n)) => {
                buf.truncate(n);
                trace!(path = %self.path, bytes = n, "Read from serial link");
                Ok(Bytes::from(buf))
            }
            Ok(Err(e)) => Err(LinkError::from_io(e, timeout)),
        }
    }

    async fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize, LinkError> {
        let stream = self.stream.as_mut().ok_or(LinkError::Disconnected)?;

        let io = async {
            stream.write_all(data).await?;
            stream.flush().await
        };
        match tokio::time::timeout(timeout, io).await {
            Err(_) => Err(LinkError::Timeout(timeout)),
            Ok(Ok(())) => {
                trace!(path = %self.path, bytes = data.len(), "Wrote to serial link");
                Ok(data.len())
            }
            Ok(Err(e)) => Err(LinkError::from_io(e, timeout)),
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!(path = %self.path, "Serial link closed");
        }
        self.claim = None;
    }
}

//! Client wire protocol: one JSON object per line in each direction.
//!
//! ```text
//! -> {"id": 7, "op": "request", "device": "d1", "payload": "PING\n", "deadline_ms": 1000}
//! <- {"id": 7, "ok": true, "payload": "PING\n", "encoding": "utf8"}
//! <- {"id": 7, "ok": false, "error": {"kind": "device_timeout", "message": "..."}}
//! ```
//!
//! Payloads are UTF-8 text unless `"encoding": "hex"` is given. Device output that
//! is not valid UTF-8 is always returned hex-encoded.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::config::ServerConfig;
use crate::dispatcher::{Operation, Request};
use crate::error::{ErrorKind, GatewayError};
use crate::session::DeviceStatus;

/// Operation requested by a client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    /// Write the payload, return the device's response frame
    #[default]
    Request,
    /// Return the next frame the device emits
    Read,
    /// Liveness check
    Ping,
    /// Device status snapshot
    Devices,
}

/// How a payload string is encoded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadEncoding {
    /// Payload is the text itself
    #[default]
    Utf8,
    /// Payload is hex digits
    Hex,
}

impl PayloadEncoding {
    /// Decode a client payload into raw bytes
    pub fn decode(self, payload: &str) -> Result<Bytes, GatewayError> {
        match self {
            PayloadEncoding::Utf8 => Ok(Bytes::copy_from_slice(payload.as_bytes())),
            PayloadEncoding::Hex => hex::decode(payload)
                .map(Bytes::from)
                .map_err(|e| GatewayError::Protocol(format!("invalid hex payload: {}", e))),
        }
    }

    /// Encode device bytes for a client, falling back to hex for non-UTF-8 data
    pub fn encode(payload: &[u8]) -> (String, PayloadEncoding) {
        match std::str::from_utf8(payload) {
            Ok(text) => (text.to_string(), PayloadEncoding::Utf8),
            Err(_) => (hex::encode(payload), PayloadEncoding::Hex),
        }
    }
}

/// One client message
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientRequest {
    /// Client correlation id, echoed back verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    /// Operation, `request` when omitted
    #[serde(default)]
    pub op: Op,
    /// Target device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// Payload for `request`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    /// Payload encoding
    #[serde(default)]
    pub encoding: PayloadEncoding,
    /// Deadline in milliseconds from receipt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
}

/// What the listener should do with a parsed message
#[derive(Debug)]
pub enum Command {
    /// Answer `pong`
    Ping,
    /// Answer with the device table
    Devices,
    /// Hand to the dispatcher
    Dispatch(Request),
}

impl ClientRequest {
    /// Parse one line of client input
    pub fn parse(line: &str) -> Result<Self, GatewayError> {
        serde_json::from_str(line)
            .map_err(|e| GatewayError::Protocol(format!("invalid request: {}", e)))
    }

    /// Identifier used for logging and as session owner
    ///
    /// The client's `id` when it sent one, a fresh UUID otherwise.
    pub fn request_id(&self) -> String {
        match &self.id {
            Some(Value::String(id)) => id.clone(),
            Some(other) => other.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Validate the message and turn it into a command
    pub fn into_command(
        self,
        request_id: String,
        server: &ServerConfig,
        received_at: Instant,
    ) -> Result<Command, GatewayError> {
        if self.deadline_ms == Some(0) {
            return Err(GatewayError::Protocol(
                "deadline_ms must be greater than zero".to_string(),
            ));
        }
        let deadline = received_at + server.deadline_for(self.deadline_ms);

        let op = match self.op {
            Op::Ping => return Ok(Command::Ping),
            Op::Devices => return Ok(Command::Devices),
            Op::Read => Operation::Read,
            Op::Request => {
                let payload = self.payload.as_deref().ok_or_else(|| {
                    GatewayError::Protocol("'payload' is required for request".to_string())
                })?;
                Operation::Exchange(self.encoding.decode(payload)?)
            }
        };
        let device = self
            .device
            .filter(|device| !device.is_empty())
            .ok_or_else(|| GatewayError::Protocol("'device' is required".to_string()))?;

        Ok(Command::Dispatch(Request {
            id: request_id,
            device,
            op,
            deadline,
        }))
    }
}

/// Error body of a failed response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    /// Error category
    pub kind: ErrorKind,
    /// Human-readable detail
    pub message: String,
}

/// One response line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientResponse {
    /// Echo of the request id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    /// Whether the request succeeded
    pub ok: bool,
    /// Response payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    /// Encoding of `payload`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<PayloadEncoding>,
    /// Device table for `devices`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devices: Option<Vec<DeviceStatus>>,
    /// Failure detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl ClientResponse {
    fn empty(id: Option<Value>, ok: bool) -> Self {
        Self {
            id,
            ok,
            payload: None,
            encoding: None,
            devices: None,
            error: None,
        }
    }

    /// Successful response carrying device bytes
    pub fn payload(id: Option<Value>, payload: &[u8]) -> Self {
        let (text, encoding) = PayloadEncoding::encode(payload);
        Self {
            payload: Some(text),
            encoding: Some(encoding),
            ..Self::empty(id, true)
        }
    }

    /// Answer to `ping`
    pub fn pong(id: Option<Value>) -> Self {
        Self {
            payload: Some("pong".to_string()),
            encoding: Some(PayloadEncoding::Utf8),
            ..Self::empty(id, true)
        }
    }

    /// Answer to `devices`
    pub fn devices(id: Option<Value>, devices: Vec<DeviceStatus>) -> Self {
        Self {
            devices: Some(devices),
            ..Self::empty(id, true)
        }
    }

    /// Failed response
    pub fn error(id: Option<Value>, err: &GatewayError) -> Self {
        Self {
            error: Some(WireError {
                kind: err.kind(),
                message: err.to_string(),
            }),
            ..Self::empty(id, false)
        }
    }

    /// Serialize as one protocol line (without the trailing newline)
    pub fn to_line(&self) -> Result<String, GatewayError> {
        serde_json::to_string(self)
            .map_err(|e| GatewayError::Internal(format!("failed to encode response: {}", e)))
    }
}

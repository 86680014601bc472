//! Gateway Configuration using Figment
//!
//! This module provides strongly-typed configuration loading for the gateway.
//! Configuration is loaded from:
//! 1. gateway.toml file (base configuration)
//! 2. Environment variables (prefixed with SERIAL_GATEWAY_)
//!
//! Configuration is read-only after startup; the gateway shares it behind an `Arc`.
//!
//! # Example
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8000"
//!
//! [[devices]]
//! id = "meter"
//! path = "/dev/ttyUSB0"
//! baud_rate = 115200
//! flow_control = "software"
//!
//! [devices.framing]
//! type = "delimiter"
//! delimiter = "\n"
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Network listener settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Reconnect backoff for devices that lost their link
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Device definitions
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Network listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address to listen on
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Deadline applied when a request carries none
    #[serde(default = "default_deadline")]
    pub default_deadline_ms: u64,
    /// Upper bound for client-supplied deadlines
    #[serde(default = "default_max_deadline")]
    pub max_deadline_ms: u64,
    /// Time allowed for in-flight requests to finish on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
    /// Maximum length of one client message line
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
    /// Connections silent for longer than this are closed
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,
    /// Pending requests queued per device; a request arriving at a full queue fails with `busy`
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Log output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

/// Log line format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable output
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// Bounded exponential backoff used while a device is reopening
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first reopen attempt
    #[serde(default = "default_backoff_base")]
    pub base_delay_ms: u64,
    /// Upper bound for the delay between attempts
    #[serde(default = "default_backoff_cap")]
    pub max_delay_ms: u64,
}

/// Device definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier used by clients
    pub id: String,
    /// Serial device path (e.g., "/dev/ttyUSB0", "COM3")
    pub path: String,
    /// Physical serial port or in-process loopback
    #[serde(default)]
    pub kind: DeviceKind,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Data bits (5-8)
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// Parity setting
    #[serde(default)]
    pub parity: Parity,
    /// Stop bits (1 or 2)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Flow control
    #[serde(default)]
    pub flow_control: FlowControl,
    /// How bytes on the line are split into frames
    #[serde(default)]
    pub framing: FramingConfig,
    /// Multi-line telegram assembly for `read` (delimiter framing only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram: Option<TelegramConfig>,
    /// Time the device has to answer once a request is written
    #[serde(default = "default_io_timeout")]
    pub read_timeout_ms: u64,
    /// Time allowed to push a request onto the line
    #[serde(default = "default_io_timeout")]
    pub write_timeout_ms: u64,
    /// Whether this device is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Kind of endpoint behind a device path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// A serial port opened through the OS
    #[default]
    Serial,
    /// A virtual device that echoes every frame it receives
    Loopback,
}

/// Parity modes for serial communication
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Flow control modes for serial communication
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowControl {
    #[default]
    None,
    /// XON/XOFF
    Software,
    /// RTS/CTS
    Hardware,
}

/// Framing strategy for one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FramingConfig {
    /// Frames end with a delimiter byte sequence
    Delimiter {
        /// Delimiter (e.g., "\n" or "\r\n")
        #[serde(default = "default_delimiter")]
        delimiter: String,
        /// Maximum frame size including the delimiter
        #[serde(default = "default_max_frame_bytes")]
        max_frame_bytes: usize,
    },
    /// Frames start with a big-endian length prefix
    LengthPrefixed {
        /// Width of the prefix in bytes (1, 2 or 4)
        #[serde(default = "default_prefix_bytes")]
        prefix_bytes: u8,
        /// Maximum payload size
        #[serde(default = "default_max_frame_bytes")]
        max_frame_bytes: usize,
    },
}

/// Telegram made of delimited lines, e.g. a DSMR P1 smart-meter readout
///
/// ```toml
/// [devices.telegram]
/// start = "/"
/// end = "!"
/// checksum = "crc16"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Prefix of the first line of a telegram
    #[serde(default = "default_telegram_start")]
    pub start: String,
    /// Prefix of the last line; the checksum follows it on that line
    #[serde(default = "default_telegram_end")]
    pub end: String,
    /// Checksum carried after the end marker
    #[serde(default)]
    pub checksum: TelegramChecksum,
    /// Largest accepted telegram, all lines included
    #[serde(default = "default_telegram_max_bytes")]
    pub max_bytes: usize,
}

/// Checksum verification for telegrams
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelegramChecksum {
    /// CRC-16/ARC over everything from the start marker up to and including
    /// the end marker, written as four hex digits
    #[default]
    Crc16,
    /// Telegrams carry no checksum
    None,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            start: default_telegram_start(),
            end: default_telegram_end(),
            checksum: TelegramChecksum::default(),
            max_bytes: default_telegram_max_bytes(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_listen() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_deadline() -> u64 {
    5000
}

fn default_max_deadline() -> u64 {
    60_000
}

fn default_shutdown_grace() -> u64 {
    5000
}

fn default_max_request_bytes() -> usize {
    64 * 1024
}

fn default_idle_timeout() -> u64 {
    300_000
}

fn default_queue_capacity() -> usize {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_backoff_base() -> u64 {
    200
}

fn default_backoff_cap() -> u64 {
    5000
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_io_timeout() -> u64 {
    1000
}

fn default_enabled() -> bool {
    true
}

fn default_delimiter() -> String {
    "\n".to_string()
}

fn default_max_frame_bytes() -> usize {
    4096
}

fn default_prefix_bytes() -> u8 {
    2
}

fn default_telegram_start() -> String {
    "/".to_string()
}

fn default_telegram_end() -> String {
    "!".to_string()
}

fn default_telegram_max_bytes() -> usize {
    8192
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            default_deadline_ms: default_deadline(),
            max_deadline_ms: default_max_deadline(),
            shutdown_grace_ms: default_shutdown_grace(),
            max_request_bytes: default_max_request_bytes(),
            idle_timeout_ms: default_idle_timeout(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_backoff_base(),
            max_delay_ms: default_backoff_cap(),
        }
    }
}

impl Default for FramingConfig {
    fn default() -> Self {
        FramingConfig::Delimiter {
            delimiter: default_delimiter(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl GatewayConfig {
    /// Load configuration from config/gateway.toml and environment variables
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be parsed or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/gateway.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// Values are layered: built-in defaults, then the TOML file, then
    /// `SERIAL_GATEWAY_` environment variables. A missing file leaves the
    /// defaults in place.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SERIAL_GATEWAY_").split("__"))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the gateway-wide settings
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Listen address parses as a socket address
    /// - Deadlines, limits and backoff bounds are non-zero and ordered
    /// - Device IDs are unique
    ///
    /// Per-device settings are checked by [`DeviceConfig::validate`]; a bad device
    /// is skipped at startup rather than failing the whole gateway.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        if self.server.listen.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::ValidationError(format!(
                "Invalid listen address '{}'",
                self.server.listen
            )));
        }

        let server = &self.server;
        if server.default_deadline_ms == 0 || server.default_deadline_ms > server.max_deadline_ms
        {
            return Err(ConfigError::ValidationError(format!(
                "default_deadline_ms must be between 1 and max_deadline_ms ({}), got {}",
                server.max_deadline_ms, server.default_deadline_ms
            )));
        }
        if server.max_request_bytes < 64 {
            return Err(ConfigError::ValidationError(format!(
                "max_request_bytes must be at least 64, got {}",
                server.max_request_bytes
            )));
        }
        if server.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "queue_capacity must be > 0".to_string(),
            ));
        }
        if server.idle_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "idle_timeout_ms must be > 0".to_string(),
            ));
        }

        if self.reconnect.base_delay_ms == 0
            || self.reconnect.max_delay_ms < self.reconnect.base_delay_ms
        {
            return Err(ConfigError::ValidationError(format!(
                "reconnect delays must satisfy 0 < base_delay_ms ({}) <= max_delay_ms ({})",
                self.reconnect.base_delay_ms, self.reconnect.max_delay_ms
            )));
        }

        let mut ids = HashSet::new();
        for device in &self.devices {
            if !ids.insert(&device.id) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate device ID: '{}'",
                    device.id
                )));
            }
        }

        Ok(())
    }

    /// Get all enabled devices
    pub fn enabled_devices(&self) -> Vec<&DeviceConfig> {
        self.devices.iter().filter(|dev| dev.enabled).collect()
    }

    /// Split enabled devices into usable ones and ones rejected by validation
    pub fn partition_devices(&self) -> (Vec<DeviceConfig>, Vec<(String, ConfigError)>) {
        let mut usable = Vec::new();
        let mut rejected = Vec::new();
        for device in self.enabled_devices() {
            match device.validate() {
                Ok(()) => usable.push(device.clone()),
                Err(e) => rejected.push((device.id.clone(), e)),
            }
        }
        (usable, rejected)
    }
}

impl ServerConfig {
    /// Resolve the deadline for a request, clamped to the configured maximum
    pub fn deadline_for(&self, requested_ms: Option<u64>) -> Duration {
        let ms = requested_ms
            .unwrap_or(self.default_deadline_ms)
            .clamp(1, self.max_deadline_ms);
        Duration::from_millis(ms)
    }

    /// Grace period for draining connections on shutdown
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Idle timeout for client connections
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl ReconnectConfig {
    /// Delay before reopen attempt number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

impl DeviceConfig {
    /// Create a device definition with default line settings
    pub fn new(id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            kind: DeviceKind::default(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: Parity::default(),
            stop_bits: default_stop_bits(),
            flow_control: FlowControl::default(),
            framing: FramingConfig::default(),
            telegram: None,
            read_timeout_ms: default_io_timeout(),
            write_timeout_ms: default_io_timeout(),
            enabled: default_enabled(),
        }
    }

    /// Read timeout as a duration
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Write timeout as a duration
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Validate a single device definition
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.is_empty() {
            return Err(ConfigError::ValidationError(
                "device 'id' cannot be empty".to_string(),
            ));
        }
        if self.path.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "device '{}': 'path' cannot be empty",
                self.id
            )));
        }
        if self.baud_rate == 0 {
            return Err(ConfigError::ValidationError(format!(
                "device '{}': 'baud_rate' must be > 0",
                self.id
            )));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(ConfigError::ValidationError(format!(
                "device '{}': 'data_bits' must be 5-8, got {}",
                self.id, self.data_bits
            )));
        }
        if !matches!(self.stop_bits, 1 | 2) {
            return Err(ConfigError::ValidationError(format!(
                "device '{}': 'stop_bits' must be 1 or 2, got {}",
                self.id, self.stop_bits
            )));
        }
        if self.read_timeout_ms == 0 || self.write_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(format!(
                "device '{}': read/write timeouts must be > 0",
                self.id
            )));
        }

        match &self.framing {
            FramingConfig::Delimiter {
                delimiter,
                max_frame_bytes,
            } => {
                if delimiter.is_empty() {
                    return Err(ConfigError::ValidationError(format!(
                        "device '{}': 'delimiter' cannot be empty",
                        self.id
                    )));
                }
                if *max_frame_bytes <= delimiter.len() {
                    return Err(ConfigError::ValidationError(format!(
                        "device '{}': 'max_frame_bytes' must exceed the delimiter length",
                        self.id
                    )));
                }
            }
            FramingConfig::LengthPrefixed {
                prefix_bytes,
                max_frame_bytes,
            } => {
                let capacity = match prefix_bytes {
                    1 => u8::MAX as usize,
                    2 => u16::MAX as usize,
                    4 => u32::MAX as usize,
                    other => {
                        return Err(ConfigError::ValidationError(format!(
                            "device '{}': 'prefix_bytes' must be 1, 2 or 4, got {}",
                            self.id, other
                        )))
                    }
                };
                if *max_frame_bytes == 0 || *max_frame_bytes > capacity {
                    return Err(ConfigError::ValidationError(format!(
                        "device '{}': 'max_frame_bytes' must be 1-{} for a {}-byte prefix",
                        self.id, capacity, prefix_bytes
                    )));
                }
            }
        }

        if let Some(telegram) = &self.telegram {
            if !matches!(self.framing, FramingConfig::Delimiter { .. }) {
                return Err(ConfigError::ValidationError(format!(
                    "device '{}': 'telegram' requires delimiter framing",
                    self.id
                )));
            }
            if telegram.start.is_empty() || telegram.end.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "device '{}': telegram 'start' and 'end' cannot be empty",
                    self.id
                )));
            }
            if telegram.max_bytes == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "device '{}': telegram 'max_bytes' must be > 0",
                    self.id
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback(id: &str) -> DeviceConfig {
        DeviceConfig {
            kind: DeviceKind::Loopback,
            ..DeviceConfig::new(id, format!("loop://{id}"))
        }
    }

    #[test]
    fn test_config_validation_valid() {
        let config = GatewayConfig {
            devices: vec![loopback("d1"), loopback("d2")],
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = GatewayConfig::default();
        config.logging.level = "verbose".to_string();

        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid log level"));
    }

    #[test]
    fn test_invalid_listen_address() {
        let mut config = GatewayConfig::default();
        config.server.listen = "port 8000".to_string();

        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid listen address"));
    }

    #[test]
    fn test_default_deadline_above_max() {
        let mut config = GatewayConfig::default();
        config.server.default_deadline_ms = 10_000;
        config.server.max_deadline_ms = 1000;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_device_ids() {
        let config = GatewayConfig {
            devices: vec![loopback("d1"), loopback("d1")],
            ..Default::default()
        };

        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Duplicate device ID"));
    }

    #[test]
    fn test_invalid_device_is_rejected_alone() {
        let mut broken = DeviceConfig::new("broken", "");
        broken.baud_rate = 0;
        let mut disabled = loopback("off");
        disabled.enabled = false;

        let config = GatewayConfig {
            devices: vec![loopback("d1"), broken, disabled],
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        let (usable, rejected) = config.partition_devices();
        assert_eq!(usable.len(), 1);
        assert_eq!(usable[0].id, "d1");
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].0, "broken");
        assert!(rejected[0].1.to_string().contains("'path' cannot be empty"));
    }

    #[test]
    fn test_prefix_width_limits_frame_size() {
        let mut device = loopback("d1");
        device.framing = FramingConfig::LengthPrefixed {
            prefix_bytes: 1,
            max_frame_bytes: 1024,
        };
        assert!(device.validate().is_err());

        device.framing = FramingConfig::LengthPrefixed {
            prefix_bytes: 3,
            max_frame_bytes: 16,
        };
        assert!(device
            .validate()
            .unwrap_err()
            .to_string()
            .contains("'prefix_bytes' must be 1, 2 or 4"));

        device.framing = FramingConfig::LengthPrefixed {
            prefix_bytes: 2,
            max_frame_bytes: 1024,
        };
        assert!(device.validate().is_ok());
    }

    #[test]
    fn test_empty_delimiter_rejected() {
        let mut device = loopback("d1");
        device.framing = FramingConfig::Delimiter {
            delimiter: String::new(),
            max_frame_bytes: 128,
        };
        assert!(device.validate().is_err());
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let reconnect = ReconnectConfig::default();
        assert_eq!(reconnect.delay_for(0), Duration::from_millis(200));
        assert_eq!(reconnect.delay_for(1), Duration::from_millis(400));
        assert_eq!(reconnect.delay_for(4), Duration::from_millis(3200));
        assert_eq!(reconnect.delay_for(5), Duration::from_millis(5000));
        assert_eq!(reconnect.delay_for(200), Duration::from_millis(5000));
    }

    #[test]
    fn test_deadline_clamped() {
        let server = ServerConfig::default();
        assert_eq!(server.deadline_for(None), Duration::from_millis(5000));
        assert_eq!(server.deadline_for(Some(250)), Duration::from_millis(250));
        assert_eq!(
            server.deadline_for(Some(10_000_000)),
            Duration::from_millis(60_000)
        );
    }

    #[test]
    fn test_framing_deserializes_from_toml() {
        let device: DeviceConfig = toml::from_str(
            r#"
            id = "plc"
            path = "/dev/ttyS1"
            baud_rate = 19200
            parity = "even"

            [framing]
            type = "length_prefixed"
            prefix_bytes = 4
            "#,
        )
        .unwrap();

        assert_eq!(device.parity, Parity::Even);
        assert_eq!(
            device.framing,
            FramingConfig::LengthPrefixed {
                prefix_bytes: 4,
                max_frame_bytes: 4096
            }
        );
        assert_eq!(device.kind, DeviceKind::Serial);
        assert!(device.enabled);
        assert_eq!(device.telegram, None);
    }

    #[test]
    fn test_telegram_section_defaults() {
        let device: DeviceConfig = toml::from_str(
            r#"
            id = "meter"
            path = "/dev/ttyUSB0"

            [framing]
            type = "delimiter"
            delimiter = "\r\n"

            [telegram]
            "#,
        )
        .unwrap();

        assert_eq!(device.telegram, Some(TelegramConfig::default()));
        let telegram = device.telegram.as_ref().unwrap();
        assert_eq!(telegram.start, "/");
        assert_eq!(telegram.end, "!");
        assert_eq!(telegram.checksum, TelegramChecksum::Crc16);
        assert!(device.validate().is_ok());
    }

    #[test]
    fn test_telegram_needs_delimiter_framing() {
        let mut device = loopback("meter");
        device.framing = FramingConfig::LengthPrefixed {
            prefix_bytes: 2,
            max_frame_bytes: 1024,
        };
        device.telegram = Some(TelegramConfig::default());
        assert!(device
            .validate()
            .unwrap_err()
            .to_string()
            .contains("requires delimiter framing"));
    }
}

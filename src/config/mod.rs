//! Gateway Configuration System
//!
//! This module provides configuration management for the gateway using Figment.
//!
//! # Configuration Sources
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Environment variables prefixed with `SERIAL_GATEWAY_`
//! 2. TOML configuration file (default: `config/gateway.toml`)
//!
//! # Example
//!
//! ```no_run
//! use serial_gateway::config::GatewayConfig;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load from default location
//!     let config = GatewayConfig::load()?;
//!
//!     // Or load from custom location
//!     let config = GatewayConfig::load_from("custom/path.toml")?;
//!
//!     println!("Listening on: {}", config.server.listen);
//!     println!("Enabled devices: {}", config.enabled_devices().len());
//!
//!     Ok(())
//! }
//! ```
//!
//! # Environment Variables
//!
//! Any configuration value can be overridden via environment variables with the
//! `SERIAL_GATEWAY_` prefix and key path separated by double underscores:
//!
//! ```text
//! # Listen on another port
//! SERIAL_GATEWAY_SERVER__LISTEN="127.0.0.1:9000"
//!
//! # Set log level
//! SERIAL_GATEWAY_LOGGING__LEVEL=debug
//! ```

pub mod gateway_config;

pub use gateway_config::{
    ConfigError, DeviceConfig, DeviceKind, FlowControl, FramingConfig, GatewayConfig, LogFormat,
    LoggingConfig, Parity, ReconnectConfig, ServerConfig, TelegramChecksum, TelegramConfig,
};

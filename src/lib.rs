//! Serial-to-network gateway.
//!
//! Exposes configured serial devices to TCP clients. Requests travel
//! listener → dispatcher → session manager → serial link and back, with every
//! device-side message passing through the device's framing codec.
//!
//! - [`hardware`] - serial links, drivers, simulated devices
//! - [`codec`] - delimiter and length-prefix framing
//! - [`session`] - exclusive per-device sessions and reconnection
//! - [`telegram`] - multi-line meter telegrams with CRC check
//! - [`dispatcher`] - per-device FIFO request queues
//! - [`protocol`] / [`server`] - client line protocol and TCP listener
//! - [`gateway`] - startup and graceful shutdown

pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod hardware;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod session;
pub mod telegram;

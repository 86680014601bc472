//! Hardware Communication
//!
//! Low-level serial link access, kept free of any network concern:
//!
//! - [`SerialLink`] - one open device handle with timeout-bounded read/write
//! - [`SerialDriver`] - opens links from device configuration
//! - [`SystemDriver`] - real serial ports (`tokio-serial`) and loopback devices
//! - [`MockDriver`] - simulated devices with fault injection for tests

pub mod driver;
pub mod link;
pub mod mock;
pub mod simulated;

pub use driver::{PathClaim, PathRegistry, SerialDriver, SystemDriver};
pub use link::{SerialLink, StreamLink};
pub use mock::MockDriver;
pub use simulated::{Responder, SimulatedDevice};

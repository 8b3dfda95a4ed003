//! # botcore port layer
//!
//! Hardware abstraction for one I2C port on a USB expansion module. The
//! controller exposes a pair of shared byte buffers per port (one for reads,
//! one for writes), an action flag that triggers the actual bus transaction,
//! and an asynchronous "port ready" notification delivered once per USB cycle.
//!
//! Everything above this seam (caching, causality) lives in `botcore-i2c`.
//! Everything below it (USB enumeration, wire format) is the module
//! firmware's problem and is out of scope here.

use thiserror::Error;

mod addr;
mod port;

#[cfg(feature = "mock")]
pub mod mock;

pub use addr::I2cAddress;
pub use port::{I2cPort, PortKind, PortReadyCallback, PortSessionCallback};

#[cfg(feature = "mock")]
pub use mock::SimulatedPort;

/// Port layer error type
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortError {
    /// 7-bit I2C addresses must fit in 7 bits
    #[error("invalid 7-bit I2C address 0x{0:02x}")]
    InvalidAddress(u8),
}

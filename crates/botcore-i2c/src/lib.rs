//! # botcore I2C synchronous engine
//!
//! A synchronous, cached read/write surface over the asynchronous buffer
//! protocol of an expansion-module I2C port ([`botcore_port::I2cPort`]).
//!
//! The engine keeps a [`ReadWindow`] of device registers continuously
//! refreshed so most reads are satisfied from cache, flushes writes through a
//! dirty/queued write cache, and guarantees causality: a read issued after an
//! accepted write observes device state no earlier than that write. When the
//! module is absent or mid-teardown the engine degrades instead of failing:
//! reads return zero-filled fake data, writes are dropped, and the device
//! health is marked [`HealthStatus::Unhealthy`].
//!
//! ```no_run
//! use botcore_i2c::{I2cEngineBuilder, ReadMode, ReadWindow, WaitControl};
//! use botcore_port::{I2cAddress, PortKind, SimulatedPort};
//!
//! # fn main() -> Result<(), botcore_i2c::I2cError> {
//! let port = SimulatedPort::new(PortKind::Standard);
//! let engine = I2cEngineBuilder::new(port, I2cAddress::from_8bit(0x28)).build();
//! engine.engage();
//!
//! engine.set_read_window(&ReadWindow::new(0x04, 8, ReadMode::Repeat)?);
//! engine.write8_with_control(0x40, 0x01, WaitControl::Written)?;
//! let heading = engine.read8(0x04)?;
//! # let _ = heading;
//! # Ok(())
//! # }
//! ```

mod builder;
mod cache;
mod engine;
mod error;
mod heartbeat;
mod history;
mod types;
mod window;

pub use builder::I2cEngineBuilder;
pub use engine::I2cEngine;
pub use error::I2cError;
pub use heartbeat::HeartbeatAction;
pub use types::{HealthStatus, TimestampedData, WaitControl};
pub use window::{ReadMode, ReadWindow};

pub use botcore_port as port;

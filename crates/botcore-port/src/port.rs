//! The controller-port capability seam.
//!
//! `I2cPort` is everything the synchronous engine is allowed to ask of the
//! transport: stage header bytes, copy payload buffers in and out, arm the
//! action flag, and queue buffer movements toward the module. None of these
//! calls transact on the I2C bus by themselves; the module performs the
//! staged work on its next cycle and then reports back via the registered
//! port-ready callback.

use crate::I2cAddress;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How the port handles a switch from write mode to read mode.
///
/// Standard modules can begin a read in the same cycle the read segment is
/// staged. Switching (legacy) modules need an extra cycle to change modes,
/// which the engine models with an explicit SWITCHING_TO_READ_MODE state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    Standard,
    Switching,
}

/// Receiver for port-ready notifications.
///
/// Invoked by the transport on its single callback thread whenever the
/// previously requested buffer work has completed and new work may be issued.
pub trait PortReadyCallback: Send + Sync {
    fn port_is_ready(&self);
}

/// Receiver for the begin/end of a run of port-ready callbacks.
///
/// `callbacks_begin` is delivered when the module starts servicing the port
/// (`armed` is false when the module is only pretending, e.g. hardware is
/// absent); `callbacks_end` when no further ready notifications will come.
pub trait PortSessionCallback: Send + Sync {
    fn callbacks_begin(&self, armed: bool);
    fn callbacks_end(&self);
}

/// One I2C port on an expansion module.
///
/// At most one ready callback and one session callback may be registered at a
/// time; registering replaces any previous receiver.
pub trait I2cPort: Send + Sync {
    fn kind(&self) -> PortKind;

    /// Whether the module behind this port is live (armed) right now.
    fn is_armed(&self) -> bool;

    /// Upper bound on the time between a payload being queued to the module
    /// and the bytes reaching the device. Sizes `Written`-mode write waits.
    fn max_write_latency(&self) -> Duration;

    /// Stages header bytes for a read of `count` registers starting at
    /// `first_register`. Does not transact.
    fn enable_read_segment(&self, addr: I2cAddress, first_register: u8, count: usize);

    /// Stages header bytes for a write of `count` registers starting at
    /// `first_register`. Does not transact.
    fn enable_write_segment(&self, addr: I2cAddress, first_register: u8, count: usize);

    /// Copy of the read payload buffer as of the last cache pull.
    fn read_cache(&self) -> Vec<u8>;

    /// Copy of the currently staged write payload.
    fn write_cache(&self) -> Vec<u8>;

    /// Replaces the staged write payload.
    fn set_write_cache(&self, data: &[u8]);

    /// Arms the "perform transaction now" flag for the next cache push.
    fn set_action_flag(&self);
    fn clear_action_flag(&self);

    /// Queues "send staged headers + payload + flag to the module".
    fn push_cache(&self);

    /// Queues "send the action flag only" (headers and payload unchanged).
    fn push_action_flag_only(&self);

    /// Queues "read the module's cache back into the read payload buffer".
    fn pull_cache(&self);

    /// Transport timestamp of the most recent cache pull, if any.
    fn last_read_timestamp(&self) -> Option<Instant>;

    fn register_ready_callback(&self, callback: Arc<dyn PortReadyCallback>);
    fn deregister_ready_callback(&self);

    fn register_session_callback(&self, callback: Arc<dyn PortSessionCallback>);
    fn deregister_session_callback(&self);
}

use crate::engine::I2cEngine;
use crate::heartbeat::HeartbeatAction;
use botcore_port::{I2cAddress, I2cPort};
use std::time::Duration;

/// Configuration for an [`I2cEngine`].
///
/// ```no_run
/// use botcore_i2c::{I2cEngineBuilder, HeartbeatAction};
/// use botcore_port::{I2cAddress, PortKind, SimulatedPort};
/// use std::time::Duration;
///
/// let port = SimulatedPort::new(PortKind::Standard);
/// let engine = I2cEngineBuilder::new(port, I2cAddress::from_8bit(0x28))
///     .tag("imu")
///     .heartbeat(Duration::from_millis(400), HeartbeatAction::refresh_last_transaction())
///     .write_coalescing(true)
///     .build();
/// engine.engage();
/// ```
pub struct I2cEngineBuilder<P> {
    pub(crate) port: P,
    pub(crate) address: I2cAddress,
    pub(crate) tag: String,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) heartbeat_action: HeartbeatAction,
    pub(crate) write_coalescing: bool,
    pub(crate) history_capacity: usize,
    pub(crate) abandonment_timeout: Duration,
}

impl<P: I2cPort + 'static> I2cEngineBuilder<P> {
    pub fn new(port: P, address: I2cAddress) -> Self {
        Self {
            port,
            address,
            tag: "i2c".to_owned(),
            heartbeat_interval: Duration::ZERO,
            heartbeat_action: HeartbeatAction::default(),
            write_coalescing: false,
            history_capacity: 0,
            abandonment_timeout: Duration::from_millis(500),
        }
    }

    /// Short name used in log output and thread names.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Enables heartbeats: when the port has been idle for `interval`,
    /// perform `action`. An interval of zero disables heartbeats.
    pub fn heartbeat(mut self, interval: Duration, action: HeartbeatAction) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_action = action;
        self
    }

    /// Merge adjacent pending writes into one transaction.
    pub fn write_coalescing(mut self, enabled: bool) -> Self {
        self.write_coalescing = enabled;
        self
    }

    /// Record the last `capacity` completed reads. Zero disables recording.
    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    /// How long a blocked read or write waits before giving up and going
    /// down the degraded path.
    pub fn abandonment_timeout(mut self, timeout: Duration) -> Self {
        self.abandonment_timeout = timeout;
        self
    }

    /// Builds the engine. The engine starts disengaged; call
    /// [`I2cEngine::engage`] to begin communicating.
    pub fn build(self) -> I2cEngine<P> {
        I2cEngine::from_builder(self)
    }
}

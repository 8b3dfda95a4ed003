use botcore_port::I2cAddress;
use smallvec::{smallvec, SmallVec};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

/// How long a write call waits before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitControl {
    /// Return as soon as the data is accepted into the write cache.
    #[default]
    None,
    /// Return once the data has been queued to the expansion module.
    Queued,
    /// Return once the data has, with high confidence, reached the device
    /// itself (queued, plus the port's worst-case write latency).
    Written,
}

/// Coarse device liveness as observed by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HealthStatus {
    Unknown = 0,
    Healthy = 1,
    /// A recent operation was degraded: fake data returned or a write
    /// silently dropped.
    Unhealthy = 2,
    Closed = 3,
}

/// Lock-free cell holding a [`HealthStatus`].
pub(crate) struct AtomicHealthStatus(AtomicU8);

impl AtomicHealthStatus {
    pub(crate) fn new(status: HealthStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub(crate) fn load(&self) -> HealthStatus {
        match self.0.load(Ordering::Acquire) {
            1 => HealthStatus::Healthy,
            2 => HealthStatus::Unhealthy,
            3 => HealthStatus::Closed,
            _ => HealthStatus::Unknown,
        }
    }

    pub(crate) fn store(&self, status: HealthStatus) {
        self.0.store(status as u8, Ordering::Release);
    }

    /// Stores `status` unless the device has already been closed.
    pub(crate) fn store_unless_closed(&self, status: HealthStatus) {
        let _ = self.0.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            (current != HealthStatus::Closed as u8).then_some(status as u8)
        });
    }
}

/// Data returned from a read, stamped with when the underlying transaction
/// completed.
#[derive(Debug, Clone)]
pub struct TimestampedData {
    pub address: I2cAddress,
    pub register: u8,
    /// Payloads never exceed one controller transaction, so they live inline.
    pub data: SmallVec<[u8; 32]>,
    pub timestamp: Instant,
}

impl TimestampedData {
    /// Zero-filled stand-in returned when real data cannot be produced.
    pub(crate) fn fake(address: I2cAddress, register: u8, count: usize) -> Self {
        Self {
            address,
            register,
            data: smallvec![0; count],
            timestamp: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_health_round_trip() {
        let health = AtomicHealthStatus::new(HealthStatus::Unknown);
        assert_eq!(health.load(), HealthStatus::Unknown);
        health.store(HealthStatus::Healthy);
        assert_eq!(health.load(), HealthStatus::Healthy);
        health.store_unless_closed(HealthStatus::Unhealthy);
        assert_eq!(health.load(), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_closed_is_terminal() {
        let health = AtomicHealthStatus::new(HealthStatus::Healthy);
        health.store(HealthStatus::Closed);
        health.store_unless_closed(HealthStatus::Healthy);
        assert_eq!(health.load(), HealthStatus::Closed);
    }

    #[test]
    fn test_fake_data_is_zero_filled() {
        let fake = TimestampedData::fake(I2cAddress::zero(), 0x10, 4);
        assert_eq!(fake.register, 0x10);
        assert_eq!(fake.data.as_slice(), &[0, 0, 0, 0]);
    }
}

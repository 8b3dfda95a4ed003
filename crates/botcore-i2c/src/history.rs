use crate::types::TimestampedData;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Bounded queue of recently completed reads, oldest evicted first.
///
/// A capacity of zero disables recording entirely, which is the default:
/// most clients never look at the history and should not pay for it.
pub(crate) struct ReadHistory {
    inner: Mutex<Inner>,
}

struct Inner {
    queue: VecDeque<TimestampedData>,
    capacity: usize,
}

impl ReadHistory {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                capacity,
            }),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    pub(crate) fn set_capacity(&self, capacity: usize) {
        let mut inner = self.inner.lock();
        inner.capacity = capacity;
        while inner.queue.len() > capacity {
            inner.queue.pop_front();
        }
    }

    /// Records a completed read. `entry` is only evaluated when recording is
    /// enabled, so disabled histories do not copy payloads around.
    pub(crate) fn push_with(&self, entry: impl FnOnce() -> TimestampedData) {
        let mut inner = self.inner.lock();
        if inner.capacity == 0 {
            return;
        }
        while inner.queue.len() >= inner.capacity {
            inner.queue.pop_front();
        }
        let entry = entry();
        inner.queue.push_back(entry);
    }

    /// Snapshot of the recorded reads, oldest first.
    pub(crate) fn snapshot(&self) -> Vec<TimestampedData> {
        self.inner.lock().queue.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use botcore_port::I2cAddress;

    fn entry(register: u8) -> TimestampedData {
        TimestampedData::fake(I2cAddress::zero(), register, 1)
    }

    #[test]
    fn test_eviction_keeps_most_recent_in_order() {
        let history = ReadHistory::new(3);
        for register in 0..6 {
            history.push_with(|| entry(register));
        }
        let registers: Vec<u8> = history.snapshot().iter().map(|d| d.register).collect();
        assert_eq!(registers, vec![3, 4, 5]);
    }

    #[test]
    fn test_zero_capacity_records_nothing() {
        let history = ReadHistory::new(0);
        history.push_with(|| panic!("must not be evaluated"));
        assert!(history.snapshot().is_empty());
    }

    #[test]
    fn test_shrinking_capacity_evicts_oldest() {
        let history = ReadHistory::new(4);
        for register in 0..4 {
            history.push_with(|| entry(register));
        }
        history.set_capacity(2);
        let registers: Vec<u8> = history.snapshot().iter().map(|d| d.register).collect();
        assert_eq!(registers, vec![2, 3]);
        assert_eq!(history.capacity(), 2);
    }
}

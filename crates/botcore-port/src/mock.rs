//! In-process simulated expansion module.
//!
//! `SimulatedPort` emulates one controller port plus the module behind it:
//! a 256-register device, the staged host-side caches, and a cycle thread
//! that applies queued buffer movements and then delivers `port_is_ready`,
//! the way the USB firmware does once per cycle.
//!
//! Only compiled with the `mock` feature. Intended for tests and for running
//! higher layers without hardware attached.

use crate::{I2cAddress, I2cPort, PortKind, PortReadyCallback, PortSessionCallback};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

const DEVICE_REGISTERS: usize = 256;
const CYCLE_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    direction: Direction,
    first_register: u8,
    count: usize,
}

#[derive(Debug, Clone, Copy)]
enum QueuedOp {
    PushCache,
    PushFlagOnly,
    PullCache,
}

struct SimState {
    device: [u8; DEVICE_REGISTERS],
    // host-side staging, mutated synchronously by the port API
    staged_segment: Option<Segment>,
    staged_flag: bool,
    host_write_cache: Vec<u8>,
    host_read_cache: Vec<u8>,
    // module-side copies, updated only by the cycle thread
    module_segment: Option<Segment>,
    module_flag: bool,
    module_write: Vec<u8>,
    module_read: Vec<u8>,
    pending: Vec<QueuedOp>,
    last_pull: Option<Instant>,
}

struct SimInner {
    kind: PortKind,
    delivering: AtomicBool,
    armed: AtomicBool,
    state: Mutex<SimState>,
    ready: Mutex<Option<Arc<dyn PortReadyCallback>>>,
    session: Mutex<Option<Arc<dyn PortSessionCallback>>>,
    transactions: AtomicUsize,
    read_mode_enables: AtomicUsize,
    write_mode_enables: AtomicUsize,
}

impl SimInner {
    /// Performs the staged bus transaction if the module's flag is armed.
    fn maybe_transact(&self, state: &mut SimState) {
        if !state.module_flag {
            return;
        }
        let Some(segment) = state.module_segment else {
            return;
        };
        let first = segment.first_register as usize;
        let last = (first + segment.count).min(DEVICE_REGISTERS);
        match segment.direction {
            Direction::Read => {
                if self.armed.load(Ordering::Acquire) {
                    state.module_read = state.device[first..last].to_vec();
                } else {
                    state.module_read = vec![0; segment.count];
                }
            }
            Direction::Write => {
                if self.armed.load(Ordering::Acquire) {
                    let n = (last - first).min(state.module_write.len());
                    state.device[first..first + n].copy_from_slice(&state.module_write[..n]);
                }
            }
        }
        state.module_flag = false;
        self.transactions.fetch_add(1, Ordering::AcqRel);
    }

    fn run_cycle(&self) {
        if !self.delivering.load(Ordering::Acquire) {
            return;
        }
        {
            let mut state = self.state.lock();
            let pending = std::mem::take(&mut state.pending);
            for op in pending {
                match op {
                    QueuedOp::PushCache => {
                        state.module_segment = state.staged_segment;
                        state.module_flag = state.staged_flag;
                        state.module_write = state.host_write_cache.clone();
                        self.maybe_transact(&mut state);
                    }
                    QueuedOp::PushFlagOnly => {
                        state.module_flag = state.staged_flag;
                        self.maybe_transact(&mut state);
                    }
                    QueuedOp::PullCache => {
                        state.host_read_cache = state.module_read.clone();
                        state.last_pull = Some(Instant::now());
                    }
                }
            }
        }
        // callback runs outside the state lock, like the firmware's callback thread
        let ready = self.ready.lock().clone();
        if let Some(ready) = ready {
            ready.port_is_ready();
        }
    }
}

/// A simulated controller port. Cheap to clone; all clones share one module.
#[derive(Clone)]
pub struct SimulatedPort {
    inner: Arc<SimInner>,
}

impl SimulatedPort {
    pub fn new(kind: PortKind) -> Self {
        let inner = Arc::new(SimInner {
            kind,
            delivering: AtomicBool::new(false),
            armed: AtomicBool::new(false),
            state: Mutex::new(SimState {
                device: [0; DEVICE_REGISTERS],
                staged_segment: None,
                staged_flag: false,
                host_write_cache: Vec::new(),
                host_read_cache: Vec::new(),
                module_segment: None,
                module_flag: false,
                module_write: Vec::new(),
                module_read: Vec::new(),
                pending: Vec::new(),
                last_pull: None,
            }),
            ready: Mutex::new(None),
            session: Mutex::new(None),
            transactions: AtomicUsize::new(0),
            read_mode_enables: AtomicUsize::new(0),
            write_mode_enables: AtomicUsize::new(0),
        });

        let weak: Weak<SimInner> = Arc::downgrade(&inner);
        thread::Builder::new()
            .name("sim-port-cycle".into())
            .spawn(move || loop {
                spin_sleep::sleep(CYCLE_PERIOD);
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.run_cycle();
            })
            .ok();

        Self { inner }
    }

    /// Brings the simulated module online with live hardware semantics.
    pub fn arm(&self) {
        self.inner.armed.store(true, Ordering::Release);
        self.inner.delivering.store(true, Ordering::Release);
        tracing::debug!("simulated port armed");
        let session = self.inner.session.lock().clone();
        if let Some(session) = session {
            session.callbacks_begin(true);
        }
    }

    /// Brings the module online in pretend mode: callbacks flow but the
    /// device neither produces real data nor accepts writes.
    pub fn pretend(&self) {
        self.inner.armed.store(false, Ordering::Release);
        self.inner.delivering.store(true, Ordering::Release);
        tracing::debug!("simulated port pretending");
        let session = self.inner.session.lock().clone();
        if let Some(session) = session {
            session.callbacks_begin(false);
        }
    }

    /// Takes the module offline; no further ready callbacks are delivered.
    pub fn disarm(&self) {
        self.inner.delivering.store(false, Ordering::Release);
        self.inner.armed.store(false, Ordering::Release);
        tracing::debug!("simulated port disarmed");
        let session = self.inner.session.lock().clone();
        if let Some(session) = session {
            session.callbacks_end();
        }
    }

    /// Writes directly into the simulated device's register file.
    pub fn device_write(&self, first_register: u8, data: &[u8]) {
        let mut state = self.inner.state.lock();
        let first = first_register as usize;
        let last = (first + data.len()).min(DEVICE_REGISTERS);
        state.device[first..last].copy_from_slice(&data[..last - first]);
    }

    /// Reads directly from the simulated device's register file.
    pub fn device_read(&self, first_register: u8, count: usize) -> Vec<u8> {
        let state = self.inner.state.lock();
        let first = first_register as usize;
        let last = (first + count).min(DEVICE_REGISTERS);
        state.device[first..last].to_vec()
    }

    /// Number of completed bus transactions so far.
    pub fn transaction_count(&self) -> usize {
        self.inner.transactions.load(Ordering::Acquire)
    }

    /// Number of times a read segment was staged.
    pub fn read_mode_enables(&self) -> usize {
        self.inner.read_mode_enables.load(Ordering::Acquire)
    }

    /// Number of times a write segment was staged.
    pub fn write_mode_enables(&self) -> usize {
        self.inner.write_mode_enables.load(Ordering::Acquire)
    }
}

impl I2cPort for SimulatedPort {
    fn kind(&self) -> PortKind {
        self.inner.kind
    }

    fn is_armed(&self) -> bool {
        self.inner.armed.load(Ordering::Acquire)
    }

    fn max_write_latency(&self) -> Duration {
        // worst case: the queued push plus one full module cycle
        CYCLE_PERIOD * 4
    }

    fn enable_read_segment(&self, _addr: I2cAddress, first_register: u8, count: usize) {
        self.inner.read_mode_enables.fetch_add(1, Ordering::AcqRel);
        self.inner.state.lock().staged_segment = Some(Segment {
            direction: Direction::Read,
            first_register,
            count,
        });
    }

    fn enable_write_segment(&self, _addr: I2cAddress, first_register: u8, count: usize) {
        self.inner.write_mode_enables.fetch_add(1, Ordering::AcqRel);
        self.inner.state.lock().staged_segment = Some(Segment {
            direction: Direction::Write,
            first_register,
            count,
        });
    }

    fn read_cache(&self) -> Vec<u8> {
        self.inner.state.lock().host_read_cache.clone()
    }

    fn write_cache(&self) -> Vec<u8> {
        self.inner.state.lock().host_write_cache.clone()
    }

    fn set_write_cache(&self, data: &[u8]) {
        self.inner.state.lock().host_write_cache = data.to_vec();
    }

    fn set_action_flag(&self) {
        self.inner.state.lock().staged_flag = true;
    }

    fn clear_action_flag(&self) {
        self.inner.state.lock().staged_flag = false;
    }

    fn push_cache(&self) {
        self.inner.state.lock().pending.push(QueuedOp::PushCache);
    }

    fn push_action_flag_only(&self) {
        self.inner.state.lock().pending.push(QueuedOp::PushFlagOnly);
    }

    fn pull_cache(&self) {
        self.inner.state.lock().pending.push(QueuedOp::PullCache);
    }

    fn last_read_timestamp(&self) -> Option<Instant> {
        self.inner.state.lock().last_pull
    }

    fn register_ready_callback(&self, callback: Arc<dyn PortReadyCallback>) {
        *self.inner.ready.lock() = Some(callback);
    }

    fn deregister_ready_callback(&self) {
        *self.inner.ready.lock() = None;
    }

    fn register_session_callback(&self, callback: Arc<dyn PortSessionCallback>) {
        let delivering = self.inner.delivering.load(Ordering::Acquire);
        let armed = self.inner.armed.load(Ordering::Acquire);
        *self.inner.session.lock() = Some(callback.clone());
        // a late registrant still learns that callbacks are already flowing
        if delivering {
            callback.callbacks_begin(armed);
        }
    }

    fn deregister_session_callback(&self) {
        *self.inner.session.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingReady(AtomicUsize);

    impl PortReadyCallback for CountingReady {
        fn port_is_ready(&self) {
            self.0.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn addr() -> I2cAddress {
        I2cAddress::from_8bit(0x28)
    }

    fn settle(port: &SimulatedPort) {
        // a handful of cycle periods is plenty for the queue to drain
        let deadline = Instant::now() + Duration::from_millis(200);
        while Instant::now() < deadline {
            if port.inner.state.lock().pending.is_empty() {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("simulated port never drained its op queue");
    }

    #[test]
    fn test_ready_callbacks_only_while_delivering() {
        let port = SimulatedPort::new(PortKind::Standard);
        let ready = Arc::new(CountingReady(AtomicUsize::new(0)));
        port.register_ready_callback(ready.clone());

        thread::sleep(Duration::from_millis(20));
        assert_eq!(ready.0.load(Ordering::Acquire), 0);

        port.arm();
        thread::sleep(Duration::from_millis(20));
        assert!(ready.0.load(Ordering::Acquire) > 0);

        port.disarm();
        thread::sleep(Duration::from_millis(5));
        let settled = ready.0.load(Ordering::Acquire);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(ready.0.load(Ordering::Acquire), settled);
    }

    #[test]
    fn test_armed_read_returns_device_data() {
        let port = SimulatedPort::new(PortKind::Standard);
        port.device_write(0x10, &[1, 2, 3, 4]);
        port.arm();

        port.enable_read_segment(addr(), 0x10, 4);
        port.set_action_flag();
        port.push_cache();
        settle(&port);
        port.pull_cache();
        settle(&port);

        assert_eq!(port.read_cache(), vec![1, 2, 3, 4]);
        assert_eq!(port.transaction_count(), 1);
        assert!(port.last_read_timestamp().is_some());
    }

    #[test]
    fn test_pretend_read_returns_zeros_and_drops_writes() {
        let port = SimulatedPort::new(PortKind::Standard);
        port.device_write(0x10, &[9, 9]);
        port.pretend();

        port.enable_write_segment(addr(), 0x10, 2);
        port.set_write_cache(&[5, 5]);
        port.set_action_flag();
        port.push_cache();
        settle(&port);
        assert_eq!(port.device_read(0x10, 2), vec![9, 9]);

        port.enable_read_segment(addr(), 0x10, 2);
        port.set_action_flag();
        port.push_cache();
        settle(&port);
        port.pull_cache();
        settle(&port);
        assert_eq!(port.read_cache(), vec![0, 0]);
    }

    #[test]
    fn test_flag_only_push_retransacts_current_segment() {
        let port = SimulatedPort::new(PortKind::Standard);
        port.arm();

        port.enable_write_segment(addr(), 0x20, 1);
        port.set_write_cache(&[7]);
        port.set_action_flag();
        port.push_cache();
        settle(&port);
        assert_eq!(port.device_read(0x20, 1), vec![7]);
        assert_eq!(port.transaction_count(), 1);

        // flag-only push re-fires the transaction with the module's buffers
        port.push_action_flag_only();
        settle(&port);
        assert_eq!(port.transaction_count(), 2);

        port.clear_action_flag();
        port.push_action_flag_only();
        settle(&port);
        assert_eq!(port.transaction_count(), 2);
    }
}

//! The synchronous engine: a blocking read/write surface reconciled with the
//! port's asynchronous buffer protocol by a state machine run entirely inside
//! the port-ready callback.
//!
//! Locking discipline, outermost first:
//!
//!   engagement -> client -> callback
//!
//! The drain gate (a reader/writer lock whose readers are in-flight client
//! operations) is never acquired while the client or callback locks are held.
//! Debug builds enforce both rules with a thread-local level check.

use crate::builder::I2cEngineBuilder;
use crate::cache::{PortMode, ReadCacheStatus, WriteCacheStatus};
use crate::heartbeat::{self, HeartbeatAction};
use crate::history::ReadHistory;
use crate::types::{AtomicHealthStatus, HealthStatus, TimestampedData, WaitControl};
use crate::window::{ReadMode, ReadWindow};
use crate::I2cError;
use botcore_port::{I2cAddress, I2cPort, PortKind, PortReadyCallback, PortSessionCallback};
use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard};
use smallvec::SmallVec;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// How long a blocked wait sleeps before re-checking its condition.
const WAIT_QUANTUM: Duration = Duration::from_millis(60);
/// How long a drain retries for exclusive gate ownership per attempt.
const DRAIN_POLL: Duration = Duration::from_millis(20);

const LEVEL_ENGAGEMENT: u8 = 1;
const LEVEL_CLIENT: u8 = 2;
const LEVEL_CALLBACK: u8 = 3;

/// Thread-local lock-level tracking. Compiled away in release builds.
mod lock_order {
    #[cfg(debug_assertions)]
    pub(super) use checked::*;
    #[cfg(not(debug_assertions))]
    pub(super) use unchecked::*;

    #[cfg(debug_assertions)]
    mod checked {
        use std::cell::Cell;

        thread_local! {
            static HELD: Cell<u8> = const { Cell::new(0) };
        }

        pub(in super::super) struct LevelGuard {
            prev: u8,
        }

        pub(in super::super) fn acquire(level: u8) -> LevelGuard {
            HELD.with(|held| {
                let prev = held.get();
                assert!(prev < level, "lock order violation: level {level} requested while holding level {prev}");
                held.set(level);
                LevelGuard { prev }
            })
        }

        pub(in super::super) fn assert_at_most(level: u8) {
            HELD.with(|held| {
                let current = held.get();
                assert!(current <= level, "drain gate touched while holding lock level {current}");
            });
        }

        impl Drop for LevelGuard {
            fn drop(&mut self) {
                HELD.with(|held| held.set(self.prev));
            }
        }
    }

    #[cfg(not(debug_assertions))]
    mod unchecked {
        pub(in super::super) struct LevelGuard;

        pub(in super::super) fn acquire(_level: u8) -> LevelGuard {
            LevelGuard
        }

        pub(in super::super) fn assert_at_most(_level: u8) {}
    }
}

struct OrderedMutex<T> {
    level: u8,
    inner: Mutex<T>,
}

struct OrderedGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    _level: lock_order::LevelGuard,
}

impl<T> OrderedMutex<T> {
    fn new(level: u8, value: T) -> Self {
        Self {
            level,
            inner: Mutex::new(value),
        }
    }

    fn lock(&self) -> OrderedGuard<'_, T> {
        let level = lock_order::acquire(self.level);
        OrderedGuard {
            guard: self.inner.lock(),
            _level: level,
        }
    }
}

impl<T> Deref for OrderedGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OrderedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// Engagement bookkeeping, protected by the engagement lock.
struct EngagementState {
    heartbeat_worker: Option<JoinHandle<()>>,
    /// Whether we have performed module-armed work since the last teardown.
    seen_armed_work: bool,
    /// Whether that work re-enabled client operations (armed, not pretending).
    armed_work_enabled_ops: bool,
}

/// Everything the port-ready state machine owns, protected by the callback
/// lock.
struct MachineState {
    /// The window the client wants kept fresh.
    read_window: Option<Arc<ReadWindow>>,
    /// The window the data in the read cache actually belongs to.
    window_actually_read: Option<Arc<ReadWindow>>,
    /// The window whose header bytes were last staged to the controller.
    /// `None` means the port was last set up for a write.
    window_sent: Option<Arc<ReadWindow>>,
    /// Whether `window_sent` reflects reality (false after a reset).
    window_sent_known: bool,
    /// Whether `read_window` changed since the callback last looked.
    window_changed: bool,
    read_status: ReadCacheStatus,
    write_status: WriteCacheStatus,
    /// When the write cache last went idle. Only meaningful while idle.
    write_idle_at: Instant,
    /// When the data now in the read cache was captured.
    read_valid_at: Option<Instant>,
    port_mode: PortMode,
    write_first: u8,
    write_count: usize,
    heartbeat_interval: Duration,
    heartbeat_action: HeartbeatAction,
    /// Last time we asked the module to transact.
    last_transaction: Instant,
    /// Job queue of the window-heartbeat worker; present while hooked.
    heartbeat_tx: Option<Sender<Arc<ReadWindow>>>,
}

struct Shared<P: I2cPort + 'static> {
    port: P,
    tag: String,
    address: Mutex<I2cAddress>,
    health: AtomicHealthStatus,
    closing: AtomicBool,
    /// Client intent: should we be talking to the hardware?
    engaged: AtomicBool,
    /// Reality: are we registered for port-ready callbacks?
    hooked: AtomicBool,
    /// Nonzero while new client operations must degrade instead of running.
    ops_barred: AtomicUsize,
    /// In-flight client operations, mirrored by gate read holds.
    active_ops: AtomicUsize,
    write_coalescing: AtomicBool,
    abandon_after: Duration,
    engagement: OrderedMutex<EngagementState>,
    client: OrderedMutex<()>,
    callback: OrderedMutex<MachineState>,
    /// Paired with the callback lock: signaled on every state machine pass.
    cond: Condvar,
    /// Readers are in-flight operations; writers are drains.
    gate: RwLock<()>,
    history: ReadHistory,
    weak_self: OnceLock<Weak<Shared<P>>>,
}

/// In-flight-operation guard: holds the drain gate shared.
struct OpGuard<'a, P: I2cPort + 'static> {
    shared: &'a Shared<P>,
    _gate: RwLockReadGuard<'a, ()>,
}

impl<P: I2cPort + 'static> Drop for OpGuard<'_, P> {
    fn drop(&mut self) {
        self.shared.active_ops.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Adapter the port calls back into; weak so the port cannot keep a dropped
/// engine alive.
struct PortHook<P: I2cPort + 'static> {
    shared: Weak<Shared<P>>,
}

impl<P: I2cPort + 'static> PortReadyCallback for PortHook<P> {
    fn port_is_ready(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.update_state_machines();
        }
    }
}

impl<P: I2cPort + 'static> PortSessionCallback for PortHook<P> {
    fn callbacks_begin(&self, armed: bool) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_callbacks_begin(armed);
        }
    }

    fn callbacks_end(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_callbacks_end();
        }
    }
}

/// A synchronous I2C device client over one expansion-module port.
///
/// See the crate-level docs for the full contract. Dropping the engine closes
/// it; `close` is idempotent.
pub struct I2cEngine<P: I2cPort + 'static> {
    shared: Arc<Shared<P>>,
}

impl<P: I2cPort + 'static> I2cEngine<P> {
    pub(crate) fn from_builder(builder: I2cEngineBuilder<P>) -> Self {
        let now = Instant::now();
        let shared = Arc::new(Shared {
            port: builder.port,
            tag: builder.tag,
            address: Mutex::new(builder.address),
            health: AtomicHealthStatus::new(HealthStatus::Unknown),
            closing: AtomicBool::new(false),
            engaged: AtomicBool::new(false),
            hooked: AtomicBool::new(false),
            ops_barred: AtomicUsize::new(0),
            active_ops: AtomicUsize::new(0),
            write_coalescing: AtomicBool::new(builder.write_coalescing),
            abandon_after: builder.abandonment_timeout,
            engagement: OrderedMutex::new(
                LEVEL_ENGAGEMENT,
                EngagementState {
                    heartbeat_worker: None,
                    seen_armed_work: false,
                    armed_work_enabled_ops: false,
                },
            ),
            client: OrderedMutex::new(LEVEL_CLIENT, ()),
            callback: OrderedMutex::new(
                LEVEL_CALLBACK,
                MachineState {
                    read_window: None,
                    window_actually_read: None,
                    window_sent: None,
                    window_sent_known: false,
                    window_changed: true,
                    read_status: ReadCacheStatus::Idle,
                    write_status: WriteCacheStatus::Idle,
                    write_idle_at: now,
                    read_valid_at: None,
                    port_mode: PortMode::Unknown,
                    write_first: 0,
                    write_count: 0,
                    heartbeat_interval: builder.heartbeat_interval,
                    heartbeat_action: builder.heartbeat_action,
                    last_transaction: now,
                    heartbeat_tx: None,
                },
            ),
            cond: Condvar::new(),
            gate: RwLock::new(()),
            history: ReadHistory::new(builder.history_capacity),
            weak_self: OnceLock::new(),
        });
        let _ = shared.weak_self.set(Arc::downgrade(&shared));
        shared.port.register_session_callback(Arc::new(PortHook {
            shared: Arc::downgrade(&shared),
        }));
        Self { shared }
    }

    /// Declares the intent to communicate; binds to the port if possible.
    pub fn engage(&self) {
        self.shared.engage();
    }

    /// Withdraws the intent to communicate, draining in-flight operations
    /// and flushing pending writes first.
    pub fn disengage(&self) {
        self.shared.disengage();
    }

    pub fn is_engaged(&self) -> bool {
        self.shared.engaged.load(Ordering::Acquire)
    }

    /// Whether we are bound to a port whose module is live right now.
    pub fn is_armed(&self) -> bool {
        self.shared.is_armed()
    }

    pub fn address(&self) -> I2cAddress {
        *self.shared.address.lock()
    }

    /// Changes the target device address, re-binding to the port if we were
    /// bound before.
    pub fn set_address(&self, address: I2cAddress) {
        self.shared.set_address(address);
    }

    pub fn health_status(&self) -> HealthStatus {
        self.shared.health.load()
    }

    /// Lets a driver overlay its own liveness judgment, e.g. after a failed
    /// device self-test. `Closed` is terminal and cannot be overwritten.
    pub fn set_health_status(&self, status: HealthStatus) {
        self.shared.health.store_unless_closed(status);
    }

    /// The register range currently kept refreshed, if any.
    pub fn read_window(&self) -> Option<Arc<ReadWindow>> {
        let shared = &self.shared;
        let _client = shared.client.lock();
        let m = shared.callback.lock();
        m.read_window.clone()
    }

    /// Installs `window` as the range to keep refreshed. A window equal to
    /// the current one (and still fully usable) is left in place.
    pub fn set_read_window(&self, window: &ReadWindow) {
        let shared = &self.shared;
        let _client = shared.client.lock();
        let mut m = shared.callback.lock();
        shared.install_window_locked(&mut m, window);
    }

    /// Replaces the current window with `to_set` only if it cannot service
    /// `needed` with the same mode.
    pub fn ensure_read_window(&self, needed: &ReadWindow, to_set: &ReadWindow) {
        let shared = &self.shared;
        let _client = shared.client.lock();
        let mut m = shared.callback.lock();
        let satisfied = m
            .read_window
            .as_ref()
            .is_some_and(|current| current.contains_with_same_mode(needed));
        if !satisfied {
            shared.install_window_locked(&mut m, to_set);
        }
    }

    pub fn read8(&self, register: u8) -> Result<u8, I2cError> {
        let data = self.read_timestamped(register, 1)?;
        Ok(data.data.first().copied().unwrap_or(0))
    }

    pub fn read(&self, register: u8, count: usize) -> Result<Vec<u8>, I2cError> {
        Ok(self.read_timestamped(register, count)?.data.to_vec())
    }

    /// Core read. Blocks until the requested registers are covered by valid
    /// cached data, installing a window if the current one cannot serve the
    /// range. Degrades to zero-filled fake data when the module is
    /// unavailable or the wait is abandoned.
    pub fn read_timestamped(&self, register: u8, count: usize) -> Result<TimestampedData, I2cError> {
        self.shared.read_timestamped(register, count)
    }

    /// Like [`read_timestamped`](Self::read_timestamped), but first ensures a
    /// read window able to serve `needed`, installing `to_set` if not.
    pub fn read_timestamped_windowed(
        &self,
        register: u8,
        count: usize,
        needed: &ReadWindow,
        to_set: &ReadWindow,
    ) -> Result<TimestampedData, I2cError> {
        self.ensure_read_window(needed, to_set);
        self.read_timestamped(register, count)
    }

    /// Writes one byte, returning once it has been queued to the module.
    pub fn write8(&self, register: u8, value: u8) -> Result<(), I2cError> {
        self.write_with_control(register, &[value], WaitControl::Queued)
    }

    pub fn write8_with_control(&self, register: u8, value: u8, wait: WaitControl) -> Result<(), I2cError> {
        self.write_with_control(register, &[value], wait)
    }

    /// Writes a contiguous run of registers, returning once the data has
    /// been queued to the module.
    pub fn write(&self, register: u8, data: &[u8]) -> Result<(), I2cError> {
        self.write_with_control(register, data, WaitControl::Queued)
    }

    /// Core write. Once this returns `Ok` the data is in the write cache and
    /// will reach the module barring teardown; `wait` selects how much of
    /// that journey to wait for. Writes against an unavailable module are
    /// dropped, recorded in the device health.
    pub fn write_with_control(&self, register: u8, data: &[u8], wait: WaitControl) -> Result<(), I2cError> {
        self.shared.write(register, data, wait)
    }

    /// Blocks until pending writes have progressed as far as `wait` asks.
    pub fn wait_for_write_completions(&self, wait: WaitControl) {
        let shared = &self.shared;
        let _client = shared.client.lock();
        let mut m = shared.callback.lock();
        shared.wait_for_write_completion(&mut m, wait);
    }

    pub fn heartbeat_interval(&self) -> Duration {
        let shared = &self.shared;
        let _client = shared.client.lock();
        shared.callback.lock().heartbeat_interval
    }

    /// An interval of zero disables heartbeats.
    pub fn set_heartbeat_interval(&self, interval: Duration) {
        let shared = &self.shared;
        let _client = shared.client.lock();
        shared.callback.lock().heartbeat_interval = interval;
    }

    pub fn heartbeat_action(&self) -> HeartbeatAction {
        let shared = &self.shared;
        let _client = shared.client.lock();
        shared.callback.lock().heartbeat_action.clone()
    }

    pub fn set_heartbeat_action(&self, action: HeartbeatAction) {
        let shared = &self.shared;
        let _client = shared.client.lock();
        shared.callback.lock().heartbeat_action = action;
    }

    pub fn is_write_coalescing_enabled(&self) -> bool {
        self.shared.write_coalescing.load(Ordering::Acquire)
    }

    pub fn set_write_coalescing(&self, enabled: bool) {
        self.shared.write_coalescing.store(enabled, Ordering::Release);
    }

    pub fn history_capacity(&self) -> usize {
        self.shared.history.capacity()
    }

    /// Records the last `capacity` completed reads; zero disables recording.
    pub fn set_history_capacity(&self, capacity: usize) {
        self.shared.history.set_capacity(capacity);
    }

    /// Snapshot of recently completed reads, oldest first.
    pub fn read_history(&self) -> Vec<TimestampedData> {
        self.shared.history.snapshot()
    }

    /// Shuts the engine down: drains, flushes, unbinds from the port.
    /// Idempotent; also runs on drop.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl<P: I2cPort + 'static> Drop for I2cEngine<P> {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl<P: I2cPort + 'static> Shared<P> {
    //------------------------------------------------------------------
    // Availability
    //------------------------------------------------------------------

    fn ops_allowed(&self) -> bool {
        self.ops_barred.load(Ordering::Acquire) == 0
    }

    fn is_open_for_ops(&self) -> bool {
        self.hooked.load(Ordering::Acquire) && self.ops_allowed()
    }

    fn begin_op(&self) -> OpGuard<'_, P> {
        // the gate is never taken under the client or callback locks
        lock_order::assert_at_most(LEVEL_ENGAGEMENT);
        let gate = self.gate.read();
        self.active_ops.fetch_add(1, Ordering::AcqRel);
        OpGuard { shared: self, _gate: gate }
    }

    fn degrade(&self) {
        self.health.store_unless_closed(HealthStatus::Unhealthy);
    }

    fn fake_read(&self, register: u8, count: usize) -> TimestampedData {
        self.degrade();
        TimestampedData::fake(*self.address.lock(), register, count)
    }

    //------------------------------------------------------------------
    // Client operations
    //------------------------------------------------------------------

    fn read_timestamped(&self, register: u8, count: usize) -> Result<TimestampedData, I2cError> {
        if count > ReadWindow::READ_REGISTER_COUNT_MAX {
            return Err(I2cError::WindowTooLarge {
                requested: count,
                max: ReadWindow::READ_REGISTER_COUNT_MAX,
            });
        }

        let _op = self.begin_op();
        if !self.is_open_for_ops() {
            trace!(tag = %self.tag, register, count, "read while unavailable; returning fake data");
            return Ok(self.fake_read(register, count));
        }

        let _client = self.client.lock();
        let mut m = self.callback.lock();

        // Reads issued after an accepted write must observe post-write
        // device state, so wait out any pending write first.
        if self.wait_for_write_idle(&mut m).is_none() {
            return Ok(self.fake_read(register, count));
        }

        let prev_window = m.read_window.clone();

        // Is what's in the read cache, or shortly will be, what we want?
        let imminent = m.read_status != ReadCacheStatus::Idle && !m.window_changed;
        let covered = imminent
            && m.window_actually_read
                .as_ref()
                .is_some_and(|w| w.contains_range(register, count));
        if !covered {
            let current = m.read_window.clone();
            let range_ok = current.as_ref().is_some_and(|w| w.contains_range(register, count));
            let usable = current
                .as_ref()
                .is_some_and(|w| w.can_be_used_to_read() && w.may_initiate_switch_to_read_mode());
            if !range_ok || !usable {
                match (range_ok, current) {
                    // re-install the same range; a used window becomes a fresh copy
                    (true, Some(window)) => self.install_window_locked(&mut m, &window),
                    // one-shot covering exactly what was asked for
                    _ => {
                        let window = ReadWindow::new(register, count, ReadMode::OnlyOnce)?;
                        self.install_window_locked(&mut m, &window);
                    }
                }
            }
        }

        if !self.wait_for_valid_read(&mut m) {
            warn!(tag = %self.tag, register, count, "read abandoned; returning fake data");
            return Ok(self.fake_read(register, count));
        }

        let result = self.extract_read(&mut m, register, count);

        // One-shot data may only be handed out once.
        if m.read_status == ReadCacheStatus::ValidOnlyOnce {
            m.read_status = ReadCacheStatus::Idle;
        }

        // Restore any window this read disturbed.
        if !same_window_slot(&m.read_window, &prev_window) {
            assign_window(&mut m, prev_window);
        }

        Ok(result)
    }

    fn extract_read(&self, m: &mut MachineState, register: u8, count: usize) -> TimestampedData {
        let Some(actually_read) = m.window_actually_read.clone() else {
            return self.fake_read(register, count);
        };
        // A forced drain can validate the cache without ever servicing the
        // window this read installed; the data on hand then belongs to an
        // older window and may not cover the request.
        if !actually_read.contains_range(register, count) {
            return self.fake_read(register, count);
        }

        let cache = self.port.read_cache();
        let base = actually_read.first_register();
        let timestamp = m.read_valid_at.unwrap_or_else(Instant::now);
        let address = *self.address.lock();

        self.history.push_with(|| {
            let full = cache.get(..actually_read.register_count()).unwrap_or(&cache);
            TimestampedData {
                address,
                register: base,
                data: SmallVec::from_slice(full),
                timestamp,
            }
        });

        let offset = (register - base) as usize;
        match cache.get(offset..offset + count) {
            Some(slice) => {
                self.health.store_unless_closed(HealthStatus::Healthy);
                TimestampedData {
                    address,
                    register,
                    data: SmallVec::from_slice(slice),
                    timestamp,
                }
            }
            None => self.fake_read(register, count),
        }
    }

    fn write(&self, register: u8, data: &[u8], wait: WaitControl) -> Result<(), I2cError> {
        let _op = self.begin_op();
        if !self.is_open_for_ops() {
            trace!(tag = %self.tag, register, "write while unavailable; dropped");
            self.degrade();
            return Ok(());
        }

        let _client = self.client.lock();
        if data.len() > ReadWindow::WRITE_REGISTER_COUNT_MAX {
            return Err(I2cError::WriteTooLarge {
                requested: data.len(),
                max: ReadWindow::WRITE_REGISTER_COUNT_MAX,
            });
        }

        let mut m = self.callback.lock();

        let mut first = register;
        let mut payload: SmallVec<[u8; 32]> = SmallVec::from_slice(data);
        let mut coalesced = false;

        // If a write is already pending, adjacent data can merge into it
        // instead of waiting for the cache to come free.
        if self.write_coalescing.load(Ordering::Acquire)
            && m.write_status == WriteCacheStatus::Dirty
            && m.write_count + data.len() <= ReadWindow::WRITE_REGISTER_COUNT_MAX
        {
            let staged = self.port.write_cache();
            if let Some(staged) = staged.get(..m.write_count) {
                if register as usize + data.len() == m.write_first as usize {
                    // new data sits immediately before the staged data
                    first = register;
                    payload.extend_from_slice(staged);
                    coalesced = true;
                } else if m.write_first as usize + m.write_count == register as usize {
                    // new data sits immediately after the staged data
                    first = m.write_first;
                    let mut merged: SmallVec<[u8; 32]> = SmallVec::from_slice(staged);
                    merged.extend_from_slice(data);
                    payload = merged;
                    coalesced = true;
                }
            }
        }

        if !coalesced && self.wait_for_write_idle(&mut m).is_none() {
            warn!(tag = %self.tag, register, "write abandoned; dropped");
            self.degrade();
            return Ok(());
        }

        m.write_first = first;
        m.write_count = payload.len();
        // Don't disturb the idle state if we lost availability while waiting;
        // a dirty cache with nobody to flush it would wedge later waiters.
        if self.is_open_for_ops() {
            m.write_status = WriteCacheStatus::Dirty;
        }
        self.port.set_write_cache(&payload);

        self.wait_for_write_completion(&mut m, wait);
        Ok(())
    }

    //------------------------------------------------------------------
    // Blocking waits (callback lock held; deadline-bounded)
    //------------------------------------------------------------------

    /// Waits until the write cache is idle. Returns the instant it went
    /// idle, or `None` if the wait was abandoned.
    fn wait_for_write_idle(&self, m: &mut OrderedGuard<'_, MachineState>) -> Option<Instant> {
        let deadline = Instant::now() + self.abandon_after;
        while m.write_status != WriteCacheStatus::Idle {
            if Instant::now() >= deadline {
                return None;
            }
            self.cond.wait_for(&mut m.guard, WAIT_QUANTUM);
        }
        Some(m.write_idle_at)
    }

    /// Waits until the read cache holds valid data for the current window.
    fn wait_for_valid_read(&self, m: &mut OrderedGuard<'_, MachineState>) -> bool {
        let deadline = Instant::now() + self.abandon_after;
        while !(m.read_status.is_valid() && !m.window_changed) {
            if Instant::now() >= deadline {
                return false;
            }
            self.cond.wait_for(&mut m.guard, WAIT_QUANTUM);
        }
        true
    }

    fn wait_for_write_completion(&self, m: &mut OrderedGuard<'_, MachineState>, wait: WaitControl) {
        if wait == WaitControl::None {
            return;
        }
        let Some(idle_at) = self.wait_for_write_idle(m) else {
            self.degrade();
            return;
        };
        if wait == WaitControl::Written {
            // Queued only means handed to the module; give the bytes the
            // port's worst case to reach the device itself.
            let deadline = idle_at + self.port.max_write_latency();
            loop {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                self.cond.wait_for(&mut m.guard, deadline - now);
            }
        }
    }

    //------------------------------------------------------------------
    // Window bookkeeping
    //------------------------------------------------------------------

    /// The public window-set path: keeps an equivalent, still-fully-usable
    /// window in place, otherwise installs a fresh copy of `window`.
    fn install_window_locked(&self, m: &mut MachineState, window: &ReadWindow) {
        let keep = m.read_window.as_ref().is_some_and(|current| {
            current.can_be_used_to_read()
                && current.may_initiate_switch_to_read_mode()
                && current.same_as_including_mode(window)
        });
        if !keep {
            assign_window(m, Some(Arc::new(window.readable_copy())));
        }
    }

    //------------------------------------------------------------------
    // The port-ready state machine
    //------------------------------------------------------------------

    /// One pass of the callback state machine: resolve what the last cycle
    /// completed, decide the next buffer transaction, stage it, and wake
    /// blocked clients.
    fn update_state_machines(&self) {
        let mut m = self.callback.lock();

        let mut set_action_flag = false;
        let mut queue_full_write = false;
        let mut queue_read = false;
        let mut enabled_read_mode = false;
        let mut enabled_write_mode = false;
        let heartbeat_due = m.heartbeat_interval > Duration::ZERO
            && m.last_transaction.elapsed() >= m.heartbeat_interval;

        // After we request a mode switch, the next port-ready callback means
        // the switch has happened.
        if m.port_mode == PortMode::SwitchingToReadMode {
            m.port_mode = PortMode::Read;
        }

        // Resolve whatever we queued last cycle.
        if m.read_status.is_queued() {
            m.read_status = ReadCacheStatus::QueueCompleted;
            m.read_valid_at = Some(self.port.last_read_timestamp().unwrap_or_else(Instant::now));
        }
        if m.write_status == WriteCacheStatus::Queued {
            m.write_status = WriteCacheStatus::Idle;
            m.write_idle_at = Instant::now();
        }

        if m.read_status == ReadCacheStatus::SwitchingToReadMode {
            if m.port_mode == PortMode::Read {
                m.read_status = ReadCacheStatus::Queued;
                set_action_flag = true;
                queue_read = true;
            } else {
                queue_read = true;
            }
        } else if m.write_status == WriteCacheStatus::Dirty {
            self.issue_write(&mut m, &mut set_action_flag, &mut queue_full_write, &mut enabled_write_mode);
            // Reads after a write must wait for the write to land, so
            // whatever the cache held before is junk now.
            m.read_status = ReadCacheStatus::Idle;
        } else if m.read_status == ReadCacheStatus::Idle || m.window_changed {
            let mut issued = false;
            if let Some(window) = m.read_window.clone() {
                // Can the port serve this window without a mode switch?
                let switch_unnecessary = m.window_sent_known
                    && m.window_sent.as_ref().is_some_and(|sent| sent.contains(&window))
                    && m.port_mode == PortMode::Read;
                if window.can_be_used_to_read()
                    && (switch_unnecessary || window.may_initiate_switch_to_read_mode())
                {
                    if switch_unnecessary {
                        m.window_actually_read = m.window_sent.clone();
                        m.read_status = ReadCacheStatus::Queued;
                        set_action_flag = true;
                        queue_read = true;
                    } else {
                        m.window_actually_read = Some(window.clone());
                        self.start_switch_to_read_mode(
                            &mut m,
                            &window,
                            &mut set_action_flag,
                            &mut queue_full_write,
                            &mut queue_read,
                            &mut enabled_read_mode,
                        );
                    }
                    window.note_used_for_read();
                    issued = true;
                }
            }
            if !issued {
                // make sure we don't appear to have valid data
                m.read_status = ReadCacheStatus::Idle;
            }
            m.window_changed = false;
        } else if m.read_status == ReadCacheStatus::QueueCompleted {
            if m.read_window.as_ref().is_some_and(|w| w.can_be_used_to_read()) {
                m.read_status = ReadCacheStatus::ValidQueued;
                set_action_flag = true;
                queue_read = true;
            } else {
                m.read_status = ReadCacheStatus::ValidOnlyOnce;
            }
        }
        // ValidOnlyOnce: leave it until a client consumes it.

        if !set_action_flag && heartbeat_due {
            self.plan_heartbeat(&mut m, &mut set_action_flag, &mut queue_full_write);
        }

        if set_action_flag {
            m.last_transaction = Instant::now();
        }

        if enabled_read_mode || enabled_write_mode {
            debug_assert!(queue_full_write);
            m.port_mode = if enabled_write_mode {
                PortMode::Write
            } else if self.port.kind() == PortKind::Switching {
                PortMode::SwitchingToReadMode
            } else {
                PortMode::Read
            };
        }

        if set_action_flag {
            self.port.set_action_flag();
        } else {
            self.port.clear_action_flag();
        }
        if set_action_flag && !queue_full_write {
            self.port.push_action_flag_only();
        } else if queue_full_write {
            self.port.push_cache();
        }
        // Queue the pull after any push so staged work goes out first.
        if queue_read {
            self.port.pull_cache();
        }

        if set_action_flag || queue_full_write || queue_read {
            trace!(
                tag = %self.tag,
                flag = set_action_flag,
                push = queue_full_write,
                pull = queue_read,
                read_status = ?m.read_status,
                write_status = ?m.write_status,
                port_mode = ?m.port_mode,
                "cycle"
            );
        }

        self.cond.notify_all();
    }

    fn issue_write(
        &self,
        m: &mut MachineState,
        set_action_flag: &mut bool,
        queue_full_write: &mut bool,
        enabled_write_mode: &mut bool,
    ) {
        // If we lost the port while the write sat dirty, leave it dirty; a
        // later hook resets the state wholesale.
        if self.is_open_for_ops() {
            m.write_status = WriteCacheStatus::Queued;
        }
        let address = *self.address.lock();
        self.port.enable_write_segment(address, m.write_first, m.write_count);
        *enabled_write_mode = true;

        m.window_sent = None;
        m.window_sent_known = true;

        *set_action_flag = true;
        *queue_full_write = true;
    }

    fn start_switch_to_read_mode(
        &self,
        m: &mut MachineState,
        window: &Arc<ReadWindow>,
        set_action_flag: &mut bool,
        queue_full_write: &mut bool,
        queue_read: &mut bool,
        enabled_read_mode: &mut bool,
    ) {
        m.read_status = if self.port.kind() == PortKind::Switching {
            ReadCacheStatus::SwitchingToReadMode
        } else {
            ReadCacheStatus::Queued
        };
        let address = *self.address.lock();
        self.port
            .enable_read_segment(address, window.first_register(), window.register_count());
        *enabled_read_mode = true;

        m.window_sent = Some(window.clone());
        m.window_sent_known = true;

        *set_action_flag = true;
        *queue_full_write = true;
        if self.port.kind() != PortKind::Switching {
            *queue_read = true;
        }
    }

    /// First applicable heartbeat action wins; the window fallback runs on
    /// the worker thread as an ordinary client read so it cannot entangle
    /// this state machine.
    fn plan_heartbeat(
        &self,
        m: &mut MachineState,
        set_action_flag: &mut bool,
        queue_full_write: &mut bool,
    ) {
        let action = m.heartbeat_action.clone();
        if action.reread_last_read && m.window_sent_known && m.window_sent.is_some() {
            // port is in, or is switching to, read mode
            if m.port_mode == PortMode::Read {
                *set_action_flag = true;
            }
        } else if action.rewrite_last_written && m.window_sent_known && m.window_sent.is_none() {
            // port is in write mode and the write cache still holds the last
            // write
            *queue_full_write = true;
            *set_action_flag = true;
        } else if let Some(window) = action.read_window {
            if let Some(tx) = &m.heartbeat_tx {
                // full queue means the previous heartbeat read is still
                // running; skip this one
                let _ = tx.try_send(window);
            }
        }
    }

    //------------------------------------------------------------------
    // Engagement lifecycle
    //------------------------------------------------------------------

    fn engage(&self) {
        let mut e = self.engagement.lock();
        self.engaged.store(true, Ordering::Release);
        self.adjust_hooking(&mut e);
    }

    fn disengage(&self) {
        let mut e = self.engagement.lock();
        self.engaged.store(false, Ordering::Release);
        self.adjust_hooking(&mut e);
    }

    fn is_armed(&self) -> bool {
        let _e = self.engagement.lock();
        self.hooked.load(Ordering::Acquire) && self.port.is_armed()
    }

    fn set_address(&self, address: I2cAddress) {
        let mut e = self.engagement.lock();
        if *self.address.lock() == address {
            return;
        }
        let was_hooked = self.hooked.load(Ordering::Acquire);
        self.engaged.store(false, Ordering::Release);
        self.adjust_hooking(&mut e);

        *self.address.lock() = address;

        if was_hooked {
            self.engaged.store(true, Ordering::Release);
            self.adjust_hooking(&mut e);
        }
    }

    /// Reconciles the actual port binding with the client's engagement
    /// intent. Engagement lock held.
    fn adjust_hooking(&self, e: &mut EngagementState) {
        let hooked = self.hooked.load(Ordering::Acquire);
        let engaged = self.engaged.load(Ordering::Acquire);
        if !hooked && engaged {
            self.hook(e);
        } else if hooked && !engaged {
            self.unhook(e);
        }
    }

    fn hook(&self, e: &mut EngagementState) {
        if self.hooked.load(Ordering::Acquire) {
            return;
        }
        debug!(tag = %self.tag, "hooking");
        let Some(weak) = self.weak_self.get().cloned() else {
            return;
        };
        {
            let mut m = self.callback.lock();
            let worker_ref = weak.clone();
            let (tx, handle) = heartbeat::spawn_worker(&self.tag, move |window| {
                if let Some(shared) = worker_ref.upgrade() {
                    let _ = shared.read_timestamped(window.first_register(), window.register_count());
                }
            });
            m.heartbeat_tx = Some(tx);
            e.heartbeat_worker = handle;
            self.port.register_ready_callback(Arc::new(PortHook { shared: weak }));
        }
        self.hooked.store(true, Ordering::Release);
    }

    fn unhook(&self, e: &mut EngagementState) {
        if !self.hooked.load(Ordering::Acquire) {
            return;
        }
        debug!(tag = %self.tag, "unhooking");

        // Stop the heartbeat worker first; it may itself be mid-read, and
        // must not start another once we begin draining. Dropping the sender
        // lets an in-flight job finish, then the thread exits.
        let tx = {
            let mut m = self.callback.lock();
            m.heartbeat_tx.take()
        };
        drop(tx);

        self.ops_barred.fetch_add(1, Ordering::AcqRel);
        self.drain_gracefully();

        if let Some(worker) = e.heartbeat_worker.take() {
            let _ = worker.join();
        }

        {
            let mut m = self.callback.lock();
            // data may still need to get out to the module; wait for that
            self.wait_for_write_completion(&mut m, WaitControl::Queued);
            self.port.deregister_ready_callback();
        }

        self.hooked.store(false, Ordering::Release);

        // No callback is bound anymore, so none of this state is relevant to
        // a later rehook.
        {
            let mut m = self.callback.lock();
            reset_controller_state(&mut m);
            self.cond.notify_all();
        }
        self.ops_barred.fetch_sub(1, Ordering::AcqRel);
        debug!(tag = %self.tag, "unhooked");
    }

    /// Waits for in-flight operations to finish on their own.
    fn drain_gracefully(&self) {
        self.ops_barred.fetch_add(1, Ordering::AcqRel);
        loop {
            lock_order::assert_at_most(LEVEL_ENGAGEMENT);
            if let Some(exclusive) = self.gate.try_write_for(DRAIN_POLL) {
                drop(exclusive);
                break;
            }
        }
        debug_assert_eq!(self.active_ops.load(Ordering::Acquire), 0);
        self.ops_barred.fetch_sub(1, Ordering::AcqRel);
    }

    /// Unblocks in-flight operations by fabricating completion state, then
    /// waits them out. Used when no more callbacks will come to finish their
    /// work honestly; a mid-drain reader can observe stale or zeroed data,
    /// the price of guaranteed teardown.
    fn force_drain(&self) {
        self.ops_barred.fetch_add(1, Ordering::AcqRel);
        let mut exit = false;
        loop {
            {
                let mut m = self.callback.lock();
                m.write_status = WriteCacheStatus::Idle;
                m.write_idle_at = Instant::now();
                m.read_status = ReadCacheStatus::ValidQueued;
                m.window_changed = false;
                self.cond.notify_all();
            }
            if exit {
                break;
            }
            lock_order::assert_at_most(LEVEL_ENGAGEMENT);
            if let Some(exclusive) = self.gate.try_write_for(DRAIN_POLL) {
                drop(exclusive);
                exit = true;
            }
        }
        debug_assert_eq!(self.active_ops.load(Ordering::Acquire), 0);
        self.ops_barred.fetch_sub(1, Ordering::AcqRel);
    }

    //------------------------------------------------------------------
    // Port session notifications
    //------------------------------------------------------------------

    /// The module started (or restarted) servicing our port. Tear down any
    /// previous binding, reset, and rebind according to engagement intent.
    fn on_callbacks_begin(&self, armed: bool) {
        debug!(tag = %self.tag, armed, "port callbacks begin");
        let mut e = self.engagement.lock();

        self.ops_barred.fetch_add(1, Ordering::AcqRel);
        self.force_drain();
        self.unhook(&mut e);
        {
            let mut m = self.callback.lock();
            reset_controller_state(&mut m);
        }
        self.adjust_hooking(&mut e);

        if armed {
            self.ops_barred.fetch_sub(1, Ordering::AcqRel);
            e.armed_work_enabled_ops = true;
        } else {
            // Pretending module: keep client operations barred so they take
            // the degraded path rather than trusting the emulation. The bar
            // is lifted in on_callbacks_end.
            e.armed_work_enabled_ops = false;
        }
        e.seen_armed_work = true;
    }

    /// No further port-ready callbacks will be delivered; queued work can
    /// only be finished by fabrication.
    fn on_callbacks_end(&self) {
        if self.closing.load(Ordering::Acquire) {
            return;
        }
        debug!(tag = %self.tag, "port callbacks end");
        let mut e = self.engagement.lock();
        if !e.seen_armed_work {
            return;
        }
        if e.armed_work_enabled_ops {
            self.ops_barred.fetch_add(1, Ordering::AcqRel);
        }
        self.force_drain();
        self.unhook(&mut e);
        self.ops_barred.fetch_sub(1, Ordering::AcqRel);
        e.seen_armed_work = false;
    }

    fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(tag = %self.tag, "closing");
        self.port.deregister_session_callback();
        self.disengage();
        self.health.store(HealthStatus::Closed);
    }
}

/// Arc-identity comparison: this is how a read knows whether it disturbed
/// the client's window.
fn same_window_slot(a: &Option<Arc<ReadWindow>>, b: &Option<Arc<ReadWindow>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

fn assign_window(m: &mut MachineState, window: Option<Arc<ReadWindow>>) {
    m.read_window = window;
    m.window_changed = true;
}

fn reset_controller_state(m: &mut MachineState) {
    m.read_valid_at = None;
    m.read_status = ReadCacheStatus::Idle;
    m.write_status = WriteCacheStatus::Idle;
    m.write_idle_at = Instant::now();
    m.port_mode = PortMode::Unknown;
    m.window_actually_read = None;
    m.window_sent = None;
    m.window_sent_known = false;
    // so the next hook's callback re-evaluates the current window
    m.window_changed = true;
}

//! Read windows: the register range and caching policy the engine keeps
//! refreshed from the device.

use crate::I2cError;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Policy governing how a [`ReadWindow`] may be re-read once it has serviced
/// a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Keep the window continuously refreshed from the device, re-reading
    /// even while the client is idle.
    Repeat,
    /// Re-read on demand; never initiate a switch back to read mode on its
    /// own once the port has been used for a write.
    Balanced,
    /// Service exactly one read, then require a fresh window.
    OnlyOnce,
}

/// A contiguous register range plus a [`ReadMode`].
///
/// Windows are immutable once handed to the engine, with one exception: the
/// engine records (exactly once) that the window has serviced a read. All
/// other window changes are expressed by replacing the window reference.
pub struct ReadWindow {
    first_register: u8,
    register_count: usize,
    mode: ReadMode,
    used_for_read: AtomicBool,
}

impl ReadWindow {
    /// Most registers a single controller read transaction can carry.
    pub const READ_REGISTER_COUNT_MAX: usize = 26;
    /// Most payload bytes a single controller write transaction can carry.
    pub const WRITE_REGISTER_COUNT_MAX: usize = 26;

    pub fn new(first_register: u8, register_count: usize, mode: ReadMode) -> Result<Self, I2cError> {
        if register_count > Self::READ_REGISTER_COUNT_MAX {
            return Err(I2cError::WindowTooLarge {
                requested: register_count,
                max: Self::READ_REGISTER_COUNT_MAX,
            });
        }
        Ok(Self {
            first_register,
            register_count,
            mode,
            used_for_read: AtomicBool::new(false),
        })
    }

    pub fn first_register(&self) -> u8 {
        self.first_register
    }

    pub fn register_count(&self) -> usize {
        self.register_count
    }

    pub fn mode(&self) -> ReadMode {
        self.mode
    }

    pub fn is_used_for_read(&self) -> bool {
        self.used_for_read.load(Ordering::Acquire)
    }

    /// Records that this window has serviced a read.
    pub(crate) fn note_used_for_read(&self) {
        self.used_for_read.store(true, Ordering::Release);
    }

    /// Whether data read through this window may still be handed to clients.
    pub fn can_be_used_to_read(&self) -> bool {
        !self.is_used_for_read() || self.mode != ReadMode::OnlyOnce
    }

    /// Whether this window may cause the port to switch into read mode.
    pub fn may_initiate_switch_to_read_mode(&self) -> bool {
        !self.is_used_for_read() || self.mode == ReadMode::Repeat
    }

    /// Whether the registers `[register, register + count)` all fall inside
    /// this window. Arithmetic is widened so a range ending at the top of the
    /// register space cannot wrap.
    pub fn contains_range(&self, register: u8, count: usize) -> bool {
        let first = register as usize;
        let our_first = self.first_register as usize;
        first >= our_first && first + count <= our_first + self.register_count
    }

    pub fn contains(&self, other: &ReadWindow) -> bool {
        self.contains_range(other.first_register, other.register_count)
    }

    pub fn contains_with_same_mode(&self, other: &ReadWindow) -> bool {
        self.contains(other) && self.mode == other.mode
    }

    pub fn same_as_including_mode(&self, other: &ReadWindow) -> bool {
        self.first_register == other.first_register
            && self.register_count == other.register_count
            && self.mode == other.mode
    }

    /// A fresh, unused window with the same range and mode.
    pub fn readable_copy(&self) -> ReadWindow {
        Self {
            first_register: self.first_register,
            register_count: self.register_count,
            mode: self.mode,
            used_for_read: AtomicBool::new(false),
        }
    }
}

impl fmt::Debug for ReadWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadWindow")
            .field("first_register", &self.first_register)
            .field("register_count", &self.register_count)
            .field("mode", &self.mode)
            .field("used_for_read", &self.is_used_for_read())
            .finish()
    }
}

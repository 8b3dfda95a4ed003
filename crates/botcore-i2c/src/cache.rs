//! Cache and port-mode state machines driven by the port-ready callback.

/// What we know about the data sitting in the port's read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadCacheStatus {
    /// Quiescent; the buffer holds no valid data.
    Idle,
    /// A switch into read mode has been requested but not yet confirmed.
    /// Only ever seen on [`PortKind::Switching`](botcore_port::PortKind) ports.
    SwitchingToReadMode,
    /// A read has been queued to the module; data not yet seen.
    Queued,
    /// The queued read completed. Transient: only observed inside the
    /// callback, which immediately promotes it to one of the valid states.
    QueueCompleted,
    /// Valid data that may be handed out exactly once.
    ValidOnlyOnce,
    /// Valid data, and a refreshing read is already queued behind it.
    ValidQueued,
}

impl ReadCacheStatus {
    pub(crate) fn is_valid(self) -> bool {
        matches!(self, Self::ValidOnlyOnce | Self::ValidQueued)
    }

    pub(crate) fn is_queued(self) -> bool {
        matches!(self, Self::Queued | Self::ValidQueued)
    }
}

/// What we know about the data sitting in the port's write buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteCacheStatus {
    /// Quiescent.
    Idle,
    /// Holds bytes that still need to be pushed to the module.
    Dirty,
    /// Currently being pushed to the module; not yet confirmed.
    Queued,
}

/// What we know about the read/write modality of our port on the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PortMode {
    Unknown,
    Write,
    /// Transitioning to read mode; will be there by the next port-ready
    /// callback. Only ever seen on switching ports.
    SwitchingToReadMode,
    Read,
}

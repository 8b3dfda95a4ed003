use thiserror::Error;

/// Errors surfaced to clients of the synchronous engine.
///
/// Transient unavailability (module disarmed, mid-teardown, abandoned waits)
/// is deliberately not represented here: those paths degrade to fake data or
/// dropped writes and record themselves in the device health instead.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum I2cError {
    /// A read window asked for more registers than a single controller
    /// transaction can carry.
    #[error("read window of {requested} registers exceeds the controller maximum of {max}")]
    WindowTooLarge { requested: usize, max: usize },

    /// A write carried more payload bytes than a single controller
    /// transaction can carry.
    #[error("write of {requested} bytes exceeds the controller maximum of {max}")]
    WriteTooLarge { requested: usize, max: usize },
}

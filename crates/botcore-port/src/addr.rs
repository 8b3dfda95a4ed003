//! I2C bus addresses
//!
//! Stored internally in 7-bit form; 8-bit (read/write-annotated) form is
//! derived on demand. An address of zero is the conventional "not yet
//! configured" placeholder.

use crate::PortError;
use std::fmt;

/// A 7-bit I2C bus address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct I2cAddress(u8);

impl I2cAddress {
    /// Largest representable 7-bit address.
    pub const MAX_7BIT: u8 = 0x7f;

    /// Creates an address from its 7-bit form.
    pub fn from_7bit(addr: u8) -> Result<Self, PortError> {
        if addr > Self::MAX_7BIT {
            return Err(PortError::InvalidAddress(addr));
        }
        Ok(Self(addr))
    }

    /// Creates an address from its 8-bit (shifted) form. The low bit is ignored.
    pub fn from_8bit(addr: u8) -> Self {
        Self(addr >> 1)
    }

    /// The "unconfigured" placeholder address.
    pub const fn zero() -> Self {
        Self(0)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn as_7bit(self) -> u8 {
        self.0
    }

    pub fn as_8bit(self) -> u8 {
        self.0 << 1
    }
}

impl fmt::Display for I2cAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_7bit_round_trip() {
        let addr = I2cAddress::from_7bit(0x3c).unwrap();
        assert_eq!(addr.as_7bit(), 0x3c);
        assert_eq!(addr.as_8bit(), 0x78);
        assert_eq!(I2cAddress::from_8bit(0x78), addr);
        assert_eq!(I2cAddress::from_8bit(0x79), addr); // read bit ignored
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert_eq!(
            I2cAddress::from_7bit(0x80),
            Err(PortError::InvalidAddress(0x80))
        );
        assert!(I2cAddress::from_7bit(0x7f).is_ok());
    }

    #[test]
    fn test_zero_placeholder() {
        assert!(I2cAddress::zero().is_zero());
        assert!(!I2cAddress::from_7bit(1).unwrap().is_zero());
    }

    #[test]
    fn test_display() {
        let addr = I2cAddress::from_7bit(0x3c).unwrap();
        assert_eq!(format!("{addr}"), "0x3c");
    }
}

//! Status codes a target reports in the reply header

use num_derive::{
    FromPrimitive,
    ToPrimitive,
};
use num_traits::{
    FromPrimitive,
    ToPrimitive,
};

/// The standard RMAP status codes. 8 and everything above 12 are reserved.
#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
pub enum Status {
    #[error("Command executed successfully")]
    Success = 0,
    #[error("General error")]
    GeneralError = 1,
    #[error("Unused RMAP packet type or command code")]
    UnusedPacketType = 2,
    #[error("Invalid key")]
    InvalidKey = 3,
    #[error("Invalid data CRC")]
    InvalidDataCrc = 4,
    #[error("Early EOP")]
    EarlyEop = 5,
    #[error("Too much data")]
    TooMuchData = 6,
    #[error("EEP")]
    Eep = 7,
    #[error("Verify buffer overrun")]
    VerifyBufferOverrun = 9,
    #[error("RMAP command not implemented or not authorised")]
    NotImplemented = 10,
    #[error("RMW data length error")]
    RmwDataLengthError = 11,
    #[error("Invalid target logical address")]
    InvalidTargetLogicalAddress = 12,
}

impl Status {
    /// Look up a raw status byte, `None` for the reserved codes
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Self::from_u8(code)
    }

    #[must_use]
    pub fn code(self) -> u8 {
        self.to_u8().unwrap_or(u8::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes() {
        assert_eq!(Status::from_code(0), Some(Status::Success));
        assert_eq!(Status::from_code(3), Some(Status::InvalidKey));
        assert_eq!(Status::from_code(12), Some(Status::InvalidTargetLogicalAddress));
        assert_eq!(Status::RmwDataLengthError.code(), 11);
    }

    #[test]
    fn test_reserved_codes() {
        assert_eq!(Status::from_code(8), None);
        assert_eq!(Status::from_code(13), None);
        assert_eq!(Status::from_code(0xFF), None);
    }
}

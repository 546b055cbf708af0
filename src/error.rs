//! Device Error Codes
//!
//! A single error type covers every failure the device core can report.
//! Each kind maps to the negative errno a kernel hook would hand back to
//! its caller.

use core::fmt;

/// Errno values returned by the module hooks.
pub mod errno {
    pub const EBADF: i32 = 9;
    pub const ENOMEM: i32 = 12;
    pub const EACCES: i32 = 13;
    pub const EBUSY: i32 = 16;
    pub const EINVAL: i32 = 22;
    pub const ENOSPC: i32 = 28;
}

/// Error type for device, mapping and fault operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevError {
    /// The registry already holds the maximum number of devices.
    CapacityExceeded,
    /// The backing store could not provide the buffer memory.
    AllocationFailure,
    /// A mapping or fault offset lies outside the buffer extent.
    OutOfBounds,
    /// Operation on a closed session or torn-down registry.
    InvalidState,
    /// Teardown attempted while sessions or page references remain.
    ResourceBusy,
    /// Registry configuration rejected before construction.
    InvalidConfig,
    /// Access not allowed by the protection a view was mapped with.
    ProtectionFault,
}

impl DevError {
    /// Negative errno for this error, as returned from a file operation hook.
    pub const fn errno(self) -> i32 {
        let code = match self {
            Self::CapacityExceeded => errno::ENOSPC,
            Self::AllocationFailure => errno::ENOMEM,
            Self::OutOfBounds => errno::EINVAL,
            Self::InvalidState => errno::EBADF,
            Self::ResourceBusy => errno::EBUSY,
            Self::InvalidConfig => errno::EINVAL,
            Self::ProtectionFault => errno::EACCES,
        };
        -code
    }
}

impl fmt::Display for DevError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CapacityExceeded => write!(f, "device table full"),
            Self::AllocationFailure => write!(f, "backing store allocation failed"),
            Self::OutOfBounds => write!(f, "offset outside device buffer"),
            Self::InvalidState => write!(f, "operation invalid in current state"),
            Self::ResourceBusy => write!(f, "device buffers still mapped"),
            Self::InvalidConfig => write!(f, "invalid registry configuration"),
            Self::ProtectionFault => write!(f, "access denied by mapping protection"),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, DevError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_is_negative() {
        assert_eq!(DevError::OutOfBounds.errno(), -22);
        assert_eq!(DevError::ResourceBusy.errno(), -16);
        assert_eq!(DevError::CapacityExceeded.errno(), -28);
        assert_eq!(DevError::AllocationFailure.errno(), -12);
    }

    #[test]
    fn test_display() {
        assert_eq!(DevError::InvalidState.to_string(), "operation invalid in current state");
    }
}

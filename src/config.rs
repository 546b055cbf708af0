//! Registry Configuration
//!
//! Compile-time defaults plus a small builder for overriding them.

use crate::error::{DevError, Result};
use crate::mm::address::is_page_aligned;

/// Default size of each device buffer (1 MiB).
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// Default maximum number of distinct devices.
pub const MAX_DEVICES: usize = 256;

/// Parameters for a [`DeviceRegistry`](crate::device::DeviceRegistry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    buffer_size: usize,
    max_devices: usize,
}

impl RegistryConfig {
    /// Configuration with the default buffer size and device limit.
    pub const fn new() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_devices: MAX_DEVICES,
        }
    }

    /// Set the size of every device buffer. Must be a non-zero page multiple.
    pub const fn with_buffer_size(self, buffer_size: usize) -> Self {
        Self { buffer_size, ..self }
    }

    /// Set the maximum number of distinct devices. Must be non-zero.
    pub const fn with_max_devices(self, max_devices: usize) -> Self {
        Self { max_devices, ..self }
    }

    #[inline]
    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    #[inline]
    pub const fn max_devices(&self) -> usize {
        self.max_devices
    }

    /// Reject configurations a registry cannot be built from.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 || !is_page_aligned(self.buffer_size) {
            return Err(DevError::InvalidConfig);
        }
        if self.max_devices == 0 {
            return Err(DevError::InvalidConfig);
        }
        Ok(())
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::new()
    }
}

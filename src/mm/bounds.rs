//! Mapping Bounds Validation
//!
//! Every mapping request and every fault window is checked here before the
//! device core touches a buffer.
//!
//! # Rules
//! - Zero-length extents are rejected
//! - `offset + length` must not overflow
//! - The extent must end at or before the buffer limit

use crate::error::{DevError, Result};

use super::address::{pages_spanning, page_window_start};

/// A validated byte extent inside a buffer.
///
/// Only [`validate`] constructs this type, so holding one proves the
/// extent fit the buffer it was checked against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    offset: usize,
    length: usize,
}

impl Extent {
    /// First byte of the extent.
    #[inline]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Length in bytes (never zero).
    #[inline]
    pub const fn length(&self) -> usize {
        self.length
    }

    /// One past the last byte.
    #[inline]
    pub const fn end(&self) -> usize {
        // Cannot overflow: checked in validate().
        self.offset + self.length
    }

    /// Number of pages the extent spans, counting a trailing partial page.
    #[inline]
    pub const fn pages(&self) -> usize {
        pages_spanning(self.length)
    }

    /// Buffer offset of the page window at `index`, if that page is part of
    /// the extent.
    #[inline]
    pub const fn page_start(&self, index: usize) -> Option<usize> {
        if index >= self.pages() {
            return None;
        }
        page_window_start(self.offset, index)
    }
}

/// Validate a proposed `(offset, length)` against a buffer of `limit` bytes.
///
/// # Returns
/// * `Ok(Extent)` - `length > 0` and `offset + length <= limit`
/// * `Err(DevError::OutOfBounds)` - anything else, including overflow
pub fn validate(limit: usize, offset: usize, length: usize) -> Result<Extent> {
    if length == 0 {
        return Err(DevError::OutOfBounds);
    }

    let end = offset.checked_add(length).ok_or(DevError::OutOfBounds)?;
    if end > limit {
        return Err(DevError::OutOfBounds);
    }

    Ok(Extent { offset, length })
}

//! Page Handles
//!
//! A [`PageHandle`] names one page-sized window of a device buffer and holds
//! a reference on the page underneath it. The reference is taken when the
//! handle is created or cloned and dropped with the handle, so a page can
//! never be reclaimed while a mapping still points at it.
//!
//! Handles are what the fault resolver gives to the address-space layer:
//! identity (buffer + offset + frame number) plus byte access bounded to
//! the page.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::Ordering;

use crate::error::{DevError, Result};
use crate::mm::address::is_page_aligned;
use crate::mm::PAGE_SIZE;

use super::buffer::BufferHandle;

/// A counted reference to one page of a device buffer.
pub struct PageHandle {
    buffer: BufferHandle,
    /// Buffer offset of the first byte of the page window.
    offset: usize,
}

impl PageHandle {
    /// Take a reference on the page at `offset`.
    ///
    /// `offset + PAGE_SIZE` must already be checked against the buffer.
    pub(crate) fn get(buffer: BufferHandle, offset: usize) -> Self {
        debug_assert!(is_page_aligned(offset) && offset + PAGE_SIZE <= buffer.length());
        buffer.get_page(offset);
        Self { buffer, offset }
    }

    /// Buffer offset of the page window.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Page frame number of the backing page.
    #[inline]
    pub fn frame_number(&self) -> usize {
        self.buffer.frame_number(self.offset)
    }

    /// The buffer this page belongs to.
    #[inline]
    pub fn buffer(&self) -> &BufferHandle {
        &self.buffer
    }

    /// Address of the first byte of the page window.
    ///
    /// This is what gets installed into a consumer's page table.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.buffer.as_ptr(self.offset)
    }

    /// Check whether two handles refer to the same backing page.
    pub fn same_page(&self, other: &PageHandle) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer) && self.offset == other.offset
    }

    /// Buffer offset of `len` bytes starting `at` bytes into the page.
    fn window(&self, at: usize, len: usize) -> Result<usize> {
        let end = at.checked_add(len).ok_or(DevError::OutOfBounds)?;
        if end > PAGE_SIZE {
            return Err(DevError::OutOfBounds);
        }
        Ok(self.offset + at)
    }

    /// Copy bytes out of the page, starting `at` bytes into it.
    pub fn read(&self, at: usize, out: &mut [u8]) -> Result<()> {
        let start = self.window(at, out.len())?;
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.buffer.byte(start + i).load(Ordering::Relaxed);
        }
        Ok(())
    }

    /// Copy bytes into the page, starting `at` bytes into it.
    ///
    /// Concurrent writers through other mappings are not ordered against
    /// each other; the buffer behaves like ordinary shared memory.
    pub fn write(&self, at: usize, data: &[u8]) -> Result<()> {
        let start = self.window(at, data.len())?;
        for (i, &byte) in data.iter().enumerate() {
            self.buffer.byte(start + i).store(byte, Ordering::Relaxed);
        }
        Ok(())
    }
}

impl Clone for PageHandle {
    fn clone(&self) -> Self {
        Self::get(Arc::clone(&self.buffer), self.offset)
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        self.buffer.put_page(self.offset);
    }
}

impl fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PageHandle({}, offset={:#x}, pfn={:#x})",
            self.buffer.id(),
            self.offset,
            self.frame_number()
        )
    }
}

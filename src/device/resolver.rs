//! Page Fault Resolution
//!
//! Demand paging for mapping sessions. Nothing is bound when a session is
//! created; each page is resolved the first time the consumer touches it.
//!
//! # Resolution
//! 1. The session must be open (its buffer slot is held for the whole fault,
//!    so a concurrent close waits for in-flight faults)
//! 2. The page window `offset + index * PAGE_SIZE` is computed with overflow
//!    checks and must lie inside the session's extent
//! 3. The window is re-validated against the buffer length
//! 4. The fault is counted; the first fault on a page pins it for the session
//!
//! The same `(session, index)` always resolves to the same page: the window
//! depends only on the session's immutable extent.
//!
//! Failures only reach the faulting access. The resolver never retries.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{DevError, Result};
use crate::mm::{bounds, PAGE_SIZE};

use super::page::PageHandle;
use super::session::MappingSession;

/// Counters across all faults a resolver has handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultStats {
    /// Faults that produced a page.
    pub resolved: u64,
    /// Faults rejected as out of bounds or against a closed session.
    pub rejected: u64,
}

/// Resolves page faults on mapping sessions.
#[derive(Debug, Default)]
pub struct PageFaultResolver {
    resolved: AtomicU64,
    rejected: AtomicU64,
}

impl PageFaultResolver {
    /// Create a resolver with zeroed counters.
    pub const fn new() -> Self {
        Self {
            resolved: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Resolve the fault on page `index` of `session`.
    ///
    /// # Returns
    /// * `Ok(PageHandle)` - the backing page, with a reference held by the handle
    /// * `Err(DevError::InvalidState)` - the session is closed
    /// * `Err(DevError::OutOfBounds)` - the page lies outside the session or buffer
    pub fn resolve(&self, session: &MappingSession, index: usize) -> Result<PageHandle> {
        match Self::fault_in(session, index) {
            Ok(page) => {
                self.resolved.fetch_add(1, Ordering::Relaxed);
                Ok(page)
            }
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("session {}: fault on page {} failed: {}", session.id(), index, e);
                Err(e)
            }
        }
    }

    /// Snapshot of the resolver counters.
    pub fn stats(&self) -> FaultStats {
        FaultStats {
            resolved: self.resolved.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    fn fault_in(session: &MappingSession, index: usize) -> Result<PageHandle> {
        let slot = session.buffer_slot();
        let buffer = (*slot).as_ref().ok_or(DevError::InvalidState)?;

        let extent = session.extent();
        let offset = extent.page_start(index).ok_or(DevError::OutOfBounds)?;

        // Checked at mmap time too; the window must still fit the buffer.
        bounds::validate(buffer.length(), offset, PAGE_SIZE)?;

        let page = PageHandle::get(buffer.clone(), offset);
        let faults = session.record_fault(index, &page);

        log::trace!(
            "{}: session {} fault: pgoff={} offset={:#x} pfn={:#x} faults={}",
            buffer.id(),
            session.id(),
            index,
            offset,
            page.frame_number(),
            faults
        );

        Ok(page)
    }
}

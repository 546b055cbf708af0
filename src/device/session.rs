//! Mapping Sessions
//!
//! A session is one bounds-checked mapping of a buffer region into a
//! consumer's address space. It counts the faults it has served and keeps
//! one pin on every page it resolved until it is closed.
//!
//! # State Machine
//! ```text
//!   create ──► Open ──close()──► Closed
//! ```
//! There is no way back to `Open`. Dropping an open session closes it.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::{Mutex, RwLock, RwLockReadGuard};

use crate::error::{DevError, Result};
use crate::mm::address::is_page_aligned;
use crate::mm::{bounds, Extent};

use super::buffer::BufferHandle;
use super::page::PageHandle;

/// Source of session identifiers for log output.
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a mapping session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closed,
}

/// Shared reference to a mapping session.
pub type SessionHandle = Arc<MappingSession>;

/// One active mapping of a device buffer region.
pub struct MappingSession {
    id: u64,
    extent: Extent,
    /// Faults served while open. Reset on close.
    faults: AtomicU64,
    /// Buffer reference; `None` once closed.
    buffer: RwLock<Option<BufferHandle>>,
    /// One pin per resolved page, keyed by page index within the session.
    pins: Mutex<BTreeMap<usize, PageHandle>>,
}

/// Validate `(offset, length)` against `buffer` and open a session on it.
///
/// # Errors
/// * `OutOfBounds` - `offset` is not page-aligned, or the extent does not fit
/// * `InvalidState` - the registry has released `buffer`
pub fn create_mapping(buffer: &BufferHandle, offset: usize, length: usize) -> Result<SessionHandle> {
    if !is_page_aligned(offset) {
        log::debug!("{}: mmap offset {:#x} not page-aligned", buffer.id(), offset);
        return Err(DevError::OutOfBounds);
    }
    let extent = bounds::validate(buffer.length(), offset, length).map_err(|e| {
        log::debug!(
            "{}: mmap out of bounds: offset={:#x} length={:#x} size={:#x}",
            buffer.id(),
            offset,
            length,
            buffer.length()
        );
        e
    })?;
    Ok(Arc::new(MappingSession::create(Arc::clone(buffer), extent)?))
}

impl MappingSession {
    /// Open a session over an extent already validated against `buffer`.
    pub(crate) fn create(buffer: BufferHandle, extent: Extent) -> Result<Self> {
        debug_assert!(extent.end() <= buffer.length());
        buffer.session_opened().map_err(|e| {
            log::debug!("{}: mmap refused, buffer released", buffer.id());
            e
        })?;
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);

        log::debug!(
            "{}: session {} open: offset={:#x} length={:#x} faults=0",
            buffer.id(),
            id,
            extent.offset(),
            extent.length()
        );

        Ok(Self {
            id,
            extent,
            faults: AtomicU64::new(0),
            buffer: RwLock::new(Some(buffer)),
            pins: Mutex::new(BTreeMap::new()),
        })
    }

    /// Session identifier, unique for the life of the process.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The mapped extent of the buffer.
    #[inline]
    pub fn extent(&self) -> Extent {
        self.extent
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        if self.buffer.read().is_some() {
            SessionState::Open
        } else {
            SessionState::Closed
        }
    }

    /// Faults served since the session was opened; 0 once closed.
    pub fn fault_count(&self) -> u64 {
        self.faults.load(Ordering::Acquire)
    }

    /// Close the session.
    ///
    /// Releases every page pin and the buffer reference, and resets the
    /// fault counter. Returns the number of faults the session served.
    pub fn close(&self) -> Result<u64> {
        let mut slot = self.buffer.write();
        let buffer = slot.take().ok_or(DevError::InvalidState)?;

        let pins = core::mem::take(&mut *self.pins.lock());
        let faults = self.faults.swap(0, Ordering::AcqRel);

        log::debug!(
            "{}: session {} close: faults={} pins={}",
            buffer.id(),
            self.id,
            faults,
            pins.len()
        );

        drop(pins);
        buffer.session_closed();
        Ok(faults)
    }

    /// Shared view of the buffer slot; held across a fault so close() waits.
    pub(crate) fn buffer_slot(&self) -> RwLockReadGuard<'_, Option<BufferHandle>> {
        self.buffer.read()
    }

    /// Record a served fault on page `index`. Caller holds `buffer_slot()`.
    ///
    /// The first fault on a page pins it; re-faults only count.
    pub(crate) fn record_fault(&self, index: usize, page: &PageHandle) -> u64 {
        self.pins.lock().entry(index).or_insert_with(|| page.clone());
        self.faults.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl fmt::Debug for MappingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingSession")
            .field("id", &self.id)
            .field("extent", &self.extent)
            .field("state", &self.state())
            .field("faults", &self.fault_count())
            .finish()
    }
}

impl Drop for MappingSession {
    fn drop(&mut self) {
        if self.buffer.get_mut().is_some() {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceBuffer, DeviceId};
    use crate::mm::{BackingStore, GlobalStore, PAGE_SIZE};

    const MIB: usize = 1024 * 1024;

    fn buffer() -> BufferHandle {
        let store: Arc<dyn BackingStore> = Arc::new(GlobalStore);
        DeviceBuffer::allocate(DeviceId::new(0), MIB, &store).unwrap()
    }

    #[test]
    fn test_new_session_is_open_with_no_faults() {
        let buffer = buffer();
        let session = create_mapping(&buffer, 0, MIB).unwrap();
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.fault_count(), 0);
        assert_eq!(buffer.open_sessions(), 1);
    }

    #[test]
    fn test_out_of_bounds_mapping() {
        let buffer = buffer();
        assert_eq!(
            create_mapping(&buffer, 1_000_000, 100_000).unwrap_err(),
            DevError::OutOfBounds
        );
        assert_eq!(create_mapping(&buffer, 0, 0).unwrap_err(), DevError::OutOfBounds);
        assert_eq!(buffer.open_sessions(), 0);
    }

    #[test]
    fn test_unaligned_offset_refused() {
        let buffer = buffer();
        assert_eq!(
            create_mapping(&buffer, 100, PAGE_SIZE * 2).unwrap_err(),
            DevError::OutOfBounds
        );
        assert_eq!(
            create_mapping(&buffer, PAGE_SIZE - 1, 1).unwrap_err(),
            DevError::OutOfBounds
        );
        assert_eq!(buffer.open_sessions(), 0);
        assert!(create_mapping(&buffer, PAGE_SIZE * 3, 100).is_ok());
    }

    #[test]
    fn test_refault_keeps_one_pin_per_page() {
        let buffer = buffer();
        let session = create_mapping(&buffer, 0, PAGE_SIZE * 2).unwrap();
        {
            let _slot = session.buffer_slot();
            let page = PageHandle::get(buffer.clone(), PAGE_SIZE);
            for _ in 0..100 {
                session.record_fault(1, &page);
            }
        }
        assert_eq!(session.fault_count(), 100);
        assert_eq!(buffer.page_ref_count(PAGE_SIZE), 1);
        assert_eq!(session.close(), Ok(100));
        assert_eq!(buffer.page_ref_count(PAGE_SIZE), 0);
    }

    #[test]
    fn test_close_twice() {
        let buffer = buffer();
        let session = create_mapping(&buffer, PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(session.close(), Ok(0));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.close(), Err(DevError::InvalidState));
        assert_eq!(buffer.open_sessions(), 0);
    }

    #[test]
    fn test_close_releases_pins_and_resets_counter() {
        let buffer = buffer();
        let session = create_mapping(&buffer, 0, PAGE_SIZE * 2).unwrap();
        {
            let _slot = session.buffer_slot();
            session.record_fault(0, &PageHandle::get(buffer.clone(), 0));
            session.record_fault(1, &PageHandle::get(buffer.clone(), PAGE_SIZE));
        }
        assert_eq!(session.fault_count(), 2);
        assert_eq!(buffer.pinned_pages(), 2);

        assert_eq!(session.close(), Ok(2));
        assert_eq!(session.fault_count(), 0);
        assert_eq!(buffer.pinned_pages(), 0);
    }

    #[test]
    fn test_drop_closes_open_session() {
        let buffer = buffer();
        let session = create_mapping(&buffer, 0, PAGE_SIZE).unwrap();
        assert_eq!(buffer.open_sessions(), 1);
        drop(session);
        assert_eq!(buffer.open_sessions(), 0);
    }
}

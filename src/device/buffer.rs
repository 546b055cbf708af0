//! Device Buffers
//!
//! One fixed-size, zero-initialized memory buffer per logical device.
//!
//! # Design
//! - Storage is a single page-aligned region from a [`BackingStore`]
//! - Each page has a reference count; faults pin pages, closes unpin them
//! - Length never changes after allocation
//! - Once the registry releases a buffer it is retired: no new sessions
//! - No read/write API: bytes are reached only through page handles

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::error::{DevError, Result};
use crate::mm::address::{page_number, pages_spanning, PAGE_SHIFT};
use crate::mm::BackingStore;

/// Identifier of a logical device (its minor number).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct DeviceId(u32);

impl DeviceId {
    /// Create a device identifier.
    #[inline]
    pub const fn new(minor: u32) -> Self {
        Self(minor)
    }

    /// Get the raw minor number.
    #[inline]
    pub const fn minor(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mapdev{}", self.0)
    }
}

/// Set in the session word once the registry has released the buffer.
const RETIRED: usize = 1 << (usize::BITS - 1);

/// Backing storage of one logical device.
pub struct DeviceBuffer {
    id: DeviceId,
    base: NonNull<u8>,
    len: usize,
    /// Reference count per page.
    page_refs: Vec<AtomicUsize>,
    /// Sessions currently open on this buffer, plus the `RETIRED` bit.
    sessions: AtomicUsize,
    store: Arc<dyn BackingStore>,
}

// SAFETY: the region behind `base` is only accessed through atomic byte
// operations, and the pointer itself never changes after allocation.
unsafe impl Send for DeviceBuffer {}
unsafe impl Sync for DeviceBuffer {}

/// Shared reference to a device buffer.
pub type BufferHandle = Arc<DeviceBuffer>;

impl DeviceBuffer {
    /// Allocate a zero-filled buffer of `len` bytes from `store`.
    ///
    /// On failure nothing is left allocated.
    pub(crate) fn allocate(
        id: DeviceId,
        len: usize,
        store: &Arc<dyn BackingStore>,
    ) -> Result<BufferHandle> {
        let pages = pages_spanning(len);
        let mut page_refs = Vec::new();
        page_refs
            .try_reserve_exact(pages)
            .map_err(|_| DevError::AllocationFailure)?;
        page_refs.extend((0..pages).map(|_| AtomicUsize::new(0)));

        let base = store.allocate(len)?;

        Ok(Arc::new(Self {
            id,
            base,
            len,
            page_refs,
            sessions: AtomicUsize::new(0),
            store: Arc::clone(store),
        }))
    }

    /// Device this buffer belongs to.
    #[inline]
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Length of the buffer in bytes.
    #[inline]
    pub fn length(&self) -> usize {
        self.len
    }

    /// Number of pages backing the buffer.
    #[inline]
    pub fn page_count(&self) -> usize {
        self.page_refs.len()
    }

    /// Number of mapping sessions currently open on this buffer.
    pub fn open_sessions(&self) -> usize {
        self.sessions.load(Ordering::Acquire) & !RETIRED
    }

    /// Whether the registry has released this buffer.
    pub fn is_retired(&self) -> bool {
        self.sessions.load(Ordering::Acquire) & RETIRED != 0
    }

    /// Number of pages with a non-zero reference count.
    pub fn pinned_pages(&self) -> usize {
        self.page_refs
            .iter()
            .filter(|r| r.load(Ordering::Acquire) != 0)
            .count()
    }

    /// Reference count of the page containing `offset`.
    pub fn page_ref_count(&self, offset: usize) -> usize {
        self.page_refs
            .get(page_number(offset))
            .map_or(0, |r| r.load(Ordering::Acquire))
    }

    pub(crate) fn get_page(&self, offset: usize) {
        self.page_refs[page_number(offset)].fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn put_page(&self, offset: usize) {
        let prev = self.page_refs[page_number(offset)].fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev != 0, "page reference underflow at offset {:#x}", offset);
    }

    /// Count a new session. Fails with `InvalidState` once retired.
    pub(crate) fn session_opened(&self) -> Result<()> {
        self.sessions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                (word & RETIRED == 0).then_some(word + 1)
            })
            .map(|_| ())
            .map_err(|_| DevError::InvalidState)
    }

    pub(crate) fn session_closed(&self) {
        self.sessions.fetch_sub(1, Ordering::AcqRel);
    }

    /// Retire the buffer if no session is open on it.
    pub(crate) fn retire(&self) -> bool {
        self.sessions
            .compare_exchange(0, RETIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Undo a `retire()` that was part of a refused teardown.
    pub(crate) fn unretire(&self) {
        self.sessions.fetch_and(!RETIRED, Ordering::AcqRel);
    }

    /// Page frame number of the page holding `offset`.
    #[inline]
    pub(crate) fn frame_number(&self, offset: usize) -> usize {
        (self.base.as_ptr() as usize + offset) >> PAGE_SHIFT
    }

    /// Address of the byte at `offset`.
    #[inline]
    pub(crate) fn as_ptr(&self, offset: usize) -> *const u8 {
        debug_assert!(offset < self.len);
        self.base.as_ptr().wrapping_add(offset)
    }

    /// The byte at `offset`, for shared access.
    ///
    /// Callers have already bounds-checked `offset`.
    #[inline]
    pub(crate) fn byte(&self, offset: usize) -> &AtomicU8 {
        assert!(offset < self.len);
        // SAFETY:
        // - offset is inside the region, which lives as long as self
        // - every access to the region goes through AtomicU8
        unsafe { AtomicU8::from_ptr(self.base.as_ptr().add(offset)) }
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("id", &self.id)
            .field("base", &self.base)
            .field("len", &self.len)
            .field("sessions", &self.open_sessions())
            .field("retired", &self.is_retired())
            .finish()
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        log::trace!("{}: releasing {} bytes at {:p}", self.id, self.len, self.base);
        // SAFETY: base came from store.allocate(len) and this is the last reference.
        unsafe { self.store.release(self.base, self.len) };
    }
}

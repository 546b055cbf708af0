//! Backing Stores for Device Buffers
//!
//! A backing store hands out zeroed, page-aligned memory regions for device
//! buffers and takes them back when the last reference to a buffer drops.
//!
//! Two stores are provided:
//! - [`GlobalStore`]: the global allocator, like `kzalloc` in a kernel module
//! - [`ArenaStore`]: a fixed-size region carved up with
//!   `linked_list_allocator`, so a registry can be given a hard memory budget
//!
//! # Safety Considerations
//! - Every region returned by `allocate` is zero-filled before use
//! - `release` must be handed back exactly what `allocate` returned

use alloc::alloc::{alloc, alloc_zeroed, dealloc, Layout};
use core::ptr::NonNull;

use linked_list_allocator::Heap;
use spin::Mutex;

use crate::error::{DevError, Result};

use super::address::PAGE_SIZE;

/// Source of memory for device buffers.
pub trait BackingStore: Send + Sync {
    /// Allocate a zero-filled region of `len` bytes aligned to [`PAGE_SIZE`].
    fn allocate(&self, len: usize) -> Result<NonNull<u8>>;

    /// Return a region to the store.
    ///
    /// # Safety
    /// `base` must have come from `allocate(len)` on this store and must not
    /// be used afterwards.
    unsafe fn release(&self, base: NonNull<u8>, len: usize);
}

/// Layout for a buffer region. Zero-sized regions are refused.
fn region_layout(len: usize) -> Result<Layout> {
    if len == 0 {
        return Err(DevError::AllocationFailure);
    }
    Layout::from_size_align(len, PAGE_SIZE).map_err(|_| DevError::AllocationFailure)
}

/// Backing store that draws from the global allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobalStore;

impl BackingStore for GlobalStore {
    fn allocate(&self, len: usize) -> Result<NonNull<u8>> {
        let layout = region_layout(len)?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(DevError::AllocationFailure)
    }

    unsafe fn release(&self, base: NonNull<u8>, len: usize) {
        // Layout was valid when the region was allocated.
        if let Ok(layout) = region_layout(len) {
            // SAFETY: caller guarantees base came from allocate(len).
            unsafe { dealloc(base.as_ptr(), layout) };
        }
    }
}

/// Backing store with a fixed memory budget.
///
/// The arena owns one page-aligned region taken from the global allocator
/// and serves buffers out of it with a first-fit linked-list heap.
pub struct ArenaStore {
    heap: Mutex<Heap>,
    region: NonNull<u8>,
    region_layout: Layout,
}

// SAFETY: the region is only touched through the heap, which is behind a
// lock, and through buffers that own disjoint sub-regions.
unsafe impl Send for ArenaStore {}
unsafe impl Sync for ArenaStore {}

impl ArenaStore {
    /// Create an arena holding `capacity` bytes.
    pub fn new(capacity: usize) -> Result<Self> {
        let layout = region_layout(capacity)?;
        // SAFETY: layout has non-zero size.
        let region = NonNull::new(unsafe { alloc(layout) }).ok_or(DevError::AllocationFailure)?;

        let mut heap = Heap::empty();
        // SAFETY:
        // - region is a fresh allocation of `capacity` bytes
        // - nothing else refers to it until the heap hands out blocks
        unsafe { heap.init(region.as_ptr(), capacity) };

        log::debug!("arena store: {} KiB at {:p}", capacity / 1024, region);

        Ok(Self {
            heap: Mutex::new(heap),
            region,
            region_layout: layout,
        })
    }

    /// Total bytes managed by the arena.
    pub fn capacity(&self) -> usize {
        self.region_layout.size()
    }

    /// Bytes currently handed out to buffers.
    pub fn used(&self) -> usize {
        self.heap.lock().used()
    }
}

impl BackingStore for ArenaStore {
    fn allocate(&self, len: usize) -> Result<NonNull<u8>> {
        let layout = region_layout(len)?;
        let block = self
            .heap
            .lock()
            .allocate_first_fit(layout)
            .map_err(|_| DevError::AllocationFailure)?;

        // Arena memory is recycled, so it has to be cleared on the way out.
        // SAFETY: the heap just gave us exclusive use of `len` bytes.
        unsafe { core::ptr::write_bytes(block.as_ptr(), 0, len) };

        Ok(block)
    }

    unsafe fn release(&self, base: NonNull<u8>, len: usize) {
        if let Ok(layout) = region_layout(len) {
            // SAFETY: caller guarantees base came from allocate(len).
            unsafe { self.heap.lock().deallocate(base, layout) };
        }
    }
}

impl Drop for ArenaStore {
    fn drop(&mut self) {
        // SAFETY: region was allocated with region_layout in new().
        unsafe { dealloc(self.region.as_ptr(), self.region_layout) };
    }
}

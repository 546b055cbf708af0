//! Page Geometry
//!
//! Page-size constants and the arithmetic that turns byte offsets inside a
//! device buffer into page numbers and page windows.
//!
//! All helpers are `const` and overflow-aware: anything that could wrap
//! returns `None` instead.

/// Page size (4 KiB)
pub const PAGE_SIZE: usize = 4096;
/// Page size mask
pub const PAGE_MASK: usize = PAGE_SIZE - 1;
/// Bits to shift for page number
pub const PAGE_SHIFT: usize = 12;

/// Check if a byte offset or length is page-aligned.
#[inline]
pub const fn is_page_aligned(value: usize) -> bool {
    value & PAGE_MASK == 0
}

/// Align a byte offset down to the nearest page boundary.
#[inline]
pub const fn page_align_down(value: usize) -> usize {
    value & !PAGE_MASK
}

/// Align a byte offset up to the nearest page boundary.
///
/// Returns `None` if the aligned value does not fit in a `usize`.
#[inline]
pub const fn page_align_up(value: usize) -> Option<usize> {
    match value.checked_add(PAGE_MASK) {
        Some(v) => Some(v & !PAGE_MASK),
        None => None,
    }
}

/// Page number containing the given byte offset.
#[inline]
pub const fn page_number(offset: usize) -> usize {
    offset >> PAGE_SHIFT
}

/// Number of pages needed to cover `len` bytes.
#[inline]
pub const fn pages_spanning(len: usize) -> usize {
    (len >> PAGE_SHIFT) + (len & PAGE_MASK != 0) as usize
}

/// Byte offset of page `index` relative to `base`.
///
/// Returns `None` on overflow.
#[inline]
pub const fn page_window_start(base: usize, index: usize) -> Option<usize> {
    match index.checked_mul(PAGE_SIZE) {
        Some(rel) => base.checked_add(rel),
        None => None,
    }
}

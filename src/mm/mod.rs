//! Memory primitives for the device core
//!
//! Provides:
//! - Page geometry (size, alignment, page windows)
//! - Bounds validation of mapping extents
//! - Backing stores that supply buffer memory
//!
//! # Principles
//! - All extents are bounds-checked before use
//! - Buffer memory is zero-initialized
//! - Unsafe code is confined to the stores and page access

pub mod address;
pub mod bounds;
pub mod store;

pub use address::{PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};
pub use bounds::{validate, Extent};
pub use store::{ArenaStore, BackingStore, GlobalStore};

//! mapdev - Demand-Paged Memory-Mapped Device
//!
//! A logical device backed by a fixed-size memory buffer that consumers map
//! into their address space instead of reading and writing it.
//!
//! # Core
//! - Registry: one zero-filled buffer per device id, created on first open
//! - Mappings: bounds-checked once at creation
//! - Faults: pages bound lazily on first touch, counted per mapping
//! - Lifecycle: open → active → closed, with teardown refused while mapped
//!
//! # Properties
//! - Bounds are re-checked on every fault, not only at mmap time
//! - Fault counters are atomic; registry mutation is serialized
//! - Pages are reference-counted while any mapping holds them
//! - Errors never leave half-built state behind

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod config;
pub mod device;
pub mod error;
pub mod mm;
pub mod module;

pub use config::{RegistryConfig, DEFAULT_BUFFER_SIZE, MAX_DEVICES};
pub use device::{
    create_mapping, BufferHandle, DeviceBuffer, DeviceId, DeviceRegistry, FaultStats, MappedView,
    MappingSession, PageFaultResolver, PageHandle, Prot, SessionHandle, SessionState,
};
pub use error::{DevError, Result};
pub use mm::{ArenaStore, BackingStore, GlobalStore, PAGE_SIZE};

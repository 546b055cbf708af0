//! Memory-Mapped Device Core
//!
//! Buffers, mapping sessions and demand-paged fault resolution.
//!
//! # Flow
//! - [`DeviceRegistry::open`] returns the buffer for a device id
//! - [`create_mapping`] bounds-checks a region and opens a [`MappingSession`]
//! - [`PageFaultResolver::resolve`] binds pages on first touch
//! - [`MappingSession::close`] releases the session's pages
//!
//! [`MappedView`] drives the last three steps the way an address-space
//! layer would.

pub mod buffer;
pub mod page;
pub mod registry;
pub mod resolver;
pub mod session;
pub mod view;

pub use buffer::{BufferHandle, DeviceBuffer, DeviceId};
pub use page::PageHandle;
pub use registry::DeviceRegistry;
pub use resolver::{FaultStats, PageFaultResolver};
pub use session::{create_mapping, MappingSession, SessionHandle, SessionState};
pub use view::{MappedView, Prot};

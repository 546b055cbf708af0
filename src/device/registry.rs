//! Device Registry
//!
//! Owns one buffer per device id. Buffers are created on the first open of
//! an id and live until the registry is torn down.
//!
//! # Design
//! - Ordered map from [`DeviceId`] to buffer, bounded by `max_devices`
//! - All mutation happens under one spinlock, so concurrent first opens of
//!   the same id allocate exactly one buffer
//! - Allocation happens before insertion; a failed open leaves no trace
//! - Teardown retires every buffer, so stale handles cannot be mapped again

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;

use spin::Mutex;

use crate::config::RegistryConfig;
use crate::error::{DevError, Result};
use crate::mm::{BackingStore, GlobalStore};

use super::buffer::{BufferHandle, DeviceBuffer, DeviceId};

struct RegistryInner {
    devices: BTreeMap<DeviceId, BufferHandle>,
    torn_down: bool,
}

/// Owner of every device buffer.
pub struct DeviceRegistry {
    config: RegistryConfig,
    store: Arc<dyn BackingStore>,
    inner: Mutex<RegistryInner>,
}

impl DeviceRegistry {
    /// Create a registry whose buffers come from the global allocator.
    pub fn new(config: RegistryConfig) -> Result<Self> {
        Self::with_store(config, Arc::new(GlobalStore))
    }

    /// Create a registry whose buffers come from `store`.
    pub fn with_store(config: RegistryConfig, store: Arc<dyn BackingStore>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            inner: Mutex::new(RegistryInner {
                devices: BTreeMap::new(),
                torn_down: false,
            }),
        })
    }

    /// Configuration the registry was built with.
    #[inline]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Open a device, creating its buffer on first use.
    ///
    /// Every open of the same id returns the same buffer.
    ///
    /// # Errors
    /// * `CapacityExceeded` - `id` is new and the table is full
    /// * `AllocationFailure` - the backing store is out of memory
    /// * `InvalidState` - the registry has been torn down
    pub fn open(&self, id: DeviceId) -> Result<BufferHandle> {
        let mut inner = self.inner.lock();
        if inner.torn_down {
            return Err(DevError::InvalidState);
        }

        if let Some(buffer) = inner.devices.get(&id) {
            log::debug!("{}: open (existing buffer)", id);
            return Ok(Arc::clone(buffer));
        }

        if inner.devices.len() >= self.config.max_devices() {
            log::warn!("{}: open refused, {} devices in use", id, inner.devices.len());
            return Err(DevError::CapacityExceeded);
        }

        let buffer = DeviceBuffer::allocate(id, self.config.buffer_size(), &self.store)
            .map_err(|e| {
                log::warn!("{}: buffer allocation failed", id);
                e
            })?;
        inner.devices.insert(id, Arc::clone(&buffer));

        log::debug!(
            "{}: open (new buffer, {} bytes, {} devices)",
            id,
            buffer.length(),
            inner.devices.len()
        );
        Ok(buffer)
    }

    /// Look up a device without creating it.
    pub fn get(&self, id: DeviceId) -> Option<BufferHandle> {
        self.inner.lock().devices.get(&id).cloned()
    }

    /// Number of devices with a buffer.
    pub fn len(&self) -> usize {
        self.inner.lock().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every buffer.
    ///
    /// Fails with `ResourceBusy`, changing nothing, while any buffer still
    /// has an open session or a pinned page. Released buffers are retired:
    /// `create_mapping` on a handle kept past teardown fails with
    /// `InvalidState`. Tearing down twice is a no-op.
    pub fn teardown(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.torn_down {
            return Ok(());
        }

        if let Some(busy) = inner
            .devices
            .values()
            .find(|b| b.open_sessions() != 0 || b.pinned_pages() != 0)
        {
            log::warn!(
                "{}: teardown refused, {} sessions open, {} pages pinned",
                busy.id(),
                busy.open_sessions(),
                busy.pinned_pages()
            );
            return Err(DevError::ResourceBusy);
        }

        // Sessions open without the registry lock. Retire each buffer from
        // zero sessions and re-check pins; on any miss, undo.
        let retired = inner.devices.values().take_while(|b| b.retire()).count();
        if retired != inner.devices.len() || inner.devices.values().any(|b| b.pinned_pages() != 0)
        {
            inner.devices.values().take(retired).for_each(|b| b.unretire());
            log::warn!("registry teardown refused, mapping opened during teardown");
            return Err(DevError::ResourceBusy);
        }

        let released = inner.devices.len();
        inner.devices.clear();
        inner.torn_down = true;

        log::debug!("registry teardown: released {} buffers", released);
        Ok(())
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("config", &self.config)
            .field("devices", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    use crate::device::{create_mapping, PageFaultResolver};
    use crate::mm::{ArenaStore, PAGE_SIZE};

    fn small() -> RegistryConfig {
        RegistryConfig::new().with_buffer_size(PAGE_SIZE * 4).with_max_devices(4)
    }

    #[test]
    fn test_open_is_idempotent() {
        let registry = DeviceRegistry::new(RegistryConfig::default()).unwrap();
        let a = registry.open(DeviceId::new(0)).unwrap();
        let b = registry.open(DeviceId::new(0)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.length(), 1024 * 1024);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_shared_buffer_across_mappings() {
        let registry = DeviceRegistry::new(small()).unwrap();
        let resolver = PageFaultResolver::new();

        let writer = create_mapping(&registry.open(DeviceId::new(1)).unwrap(), 0, PAGE_SIZE).unwrap();
        resolver.resolve(&writer, 0).unwrap().write(0, b"hello").unwrap();

        let reader = create_mapping(&registry.open(DeviceId::new(1)).unwrap(), 0, PAGE_SIZE).unwrap();
        let mut out = [0u8; 5];
        resolver.resolve(&reader, 0).unwrap().read(0, &mut out).unwrap();
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn test_capacity_exceeded_keeps_bindings() {
        let registry = DeviceRegistry::new(small()).unwrap();
        let buffers: Vec<_> = (0..4).map(|i| registry.open(DeviceId::new(i)).unwrap()).collect();

        assert_eq!(registry.open(DeviceId::new(4)).unwrap_err(), DevError::CapacityExceeded);
        assert_eq!(registry.len(), 4);
        for (i, buffer) in buffers.iter().enumerate() {
            let again = registry.open(DeviceId::new(i as u32)).unwrap();
            assert!(Arc::ptr_eq(buffer, &again));
        }
    }

    #[test]
    fn test_default_capacity() {
        let registry =
            DeviceRegistry::new(RegistryConfig::new().with_buffer_size(PAGE_SIZE)).unwrap();
        for i in 0..256 {
            registry.open(DeviceId::new(i)).unwrap();
        }
        assert_eq!(registry.open(DeviceId::new(256)).unwrap_err(), DevError::CapacityExceeded);
        assert!(registry.get(DeviceId::new(255)).is_some());
    }

    #[test]
    fn test_allocation_failure_leaves_registry_unchanged() {
        let arena = Arc::new(ArenaStore::new(PAGE_SIZE * 8).unwrap());
        let registry = DeviceRegistry::with_store(small(), arena.clone()).unwrap();

        registry.open(DeviceId::new(0)).unwrap();
        registry.open(DeviceId::new(1)).unwrap();
        assert_eq!(registry.open(DeviceId::new(2)).unwrap_err(), DevError::AllocationFailure);

        assert_eq!(registry.len(), 2);
        assert!(registry.get(DeviceId::new(2)).is_none());
        assert_eq!(arena.used(), PAGE_SIZE * 8);
    }

    #[test]
    fn test_teardown_refused_while_mapped() {
        let registry = DeviceRegistry::new(small()).unwrap();
        let session = create_mapping(&registry.open(DeviceId::new(0)).unwrap(), 0, PAGE_SIZE).unwrap();

        assert_eq!(registry.teardown(), Err(DevError::ResourceBusy));
        assert_eq!(registry.len(), 1);

        session.close().unwrap();
        assert_eq!(registry.teardown(), Ok(()));
        assert!(registry.is_empty());
        assert_eq!(registry.open(DeviceId::new(0)).unwrap_err(), DevError::InvalidState);
        assert_eq!(registry.teardown(), Ok(()));
    }

    #[test]
    fn test_kept_handle_cannot_map_after_teardown() {
        let registry = DeviceRegistry::new(small()).unwrap();
        let buffer = registry.open(DeviceId::new(2)).unwrap();
        assert!(!buffer.is_retired());

        registry.teardown().unwrap();
        assert!(buffer.is_retired());
        assert_eq!(create_mapping(&buffer, 0, PAGE_SIZE).unwrap_err(), DevError::InvalidState);
        assert_eq!(buffer.open_sessions(), 0);
    }

    #[test]
    fn test_refused_teardown_leaves_buffers_mappable() {
        let registry = DeviceRegistry::new(small()).unwrap();
        let idle = registry.open(DeviceId::new(0)).unwrap();
        let busy = registry.open(DeviceId::new(1)).unwrap();
        let session = create_mapping(&busy, 0, PAGE_SIZE).unwrap();

        assert_eq!(registry.teardown(), Err(DevError::ResourceBusy));
        assert!(!idle.is_retired());
        assert!(create_mapping(&idle, 0, PAGE_SIZE).is_ok());
        drop(session);
    }

    #[test]
    fn test_teardown_refused_while_page_held() {
        let registry = DeviceRegistry::new(small()).unwrap();
        let resolver = PageFaultResolver::new();
        let session = create_mapping(&registry.open(DeviceId::new(0)).unwrap(), 0, PAGE_SIZE).unwrap();
        let page = resolver.resolve(&session, 0).unwrap();
        session.close().unwrap();

        assert_eq!(registry.teardown(), Err(DevError::ResourceBusy));
        drop(page);
        assert_eq!(registry.teardown(), Ok(()));
    }

    #[test]
    fn test_concurrent_first_open_allocates_once() {
        let registry = DeviceRegistry::new(small()).unwrap();
        let buffers: Vec<BufferHandle> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| registry.open(DeviceId::new(9)).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(registry.len(), 1);
        assert!(buffers.iter().all(|b| Arc::ptr_eq(b, &buffers[0])));
    }

    #[test]
    fn test_invalid_config() {
        let config = RegistryConfig::new().with_max_devices(0);
        assert_eq!(DeviceRegistry::new(config).unwrap_err(), DevError::InvalidConfig);
    }
}

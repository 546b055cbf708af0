//! Module Lifecycle
//!
//! The process-wide registry, created at load and torn down at unload.

use alloc::sync::Arc;

use spin::Mutex;

use crate::config::RegistryConfig;
use crate::device::DeviceRegistry;
use crate::error::{DevError, Result};

/// The loaded registry, if any.
static MODULE: Mutex<Option<Arc<DeviceRegistry>>> = Mutex::new(None);

/// Create the process-wide registry.
///
/// Fails with `InvalidState` if already loaded.
pub fn load(config: RegistryConfig) -> Result<Arc<DeviceRegistry>> {
    let mut module = MODULE.lock();
    if module.is_some() {
        return Err(DevError::InvalidState);
    }

    let registry = Arc::new(DeviceRegistry::new(config)?);
    *module = Some(Arc::clone(&registry));

    log::info!(
        "mapdev loaded: buffer_size={} max_devices={}",
        config.buffer_size(),
        config.max_devices()
    );
    Ok(registry)
}

/// The process-wide registry, if loaded.
pub fn registry() -> Option<Arc<DeviceRegistry>> {
    MODULE.lock().clone()
}

/// Tear down and drop the process-wide registry.
///
/// On `ResourceBusy` the module stays loaded.
pub fn unload() -> Result<()> {
    let mut module = MODULE.lock();
    let registry = module.as_ref().ok_or(DevError::InvalidState)?;
    registry.teardown()?;
    *module = None;

    log::info!("mapdev unloaded");
    Ok(())
}

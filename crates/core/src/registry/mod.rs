//! Owned registries for module capabilities and device definitions.
//!
//! Both are plain objects handed to the engine at construction so tests can
//! swap in their own instances.

use std::{
    collections::HashMap,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use crate::{
    capability::{DeviceCapabilities, ModuleVisualizationCapability},
    LedRouterError, Result,
};

/// Capability declaration plus the order in which the module registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredModule {
    pub capability: ModuleVisualizationCapability,
    pub sequence: u64,
}

impl RegisteredModule {
    pub fn module_id(&self) -> &str {
        &self.capability.module_id
    }
}

#[derive(Debug, Default)]
struct ModuleTable {
    modules: HashMap<String, RegisteredModule>,
    next_sequence: u64,
}

/// Capability declarations of currently active modules, keyed by module id.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    table: RwLock<ModuleTable>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces a module's declaration. A module that registers
    /// again keeps its original position in the registration order.
    pub fn register(&self, capability: ModuleVisualizationCapability) -> Result<()> {
        capability.validate()?;
        let mut table = self.write()?;
        let sequence = match table.modules.get(&capability.module_id) {
            Some(existing) => existing.sequence,
            None => {
                let sequence = table.next_sequence;
                table.next_sequence += 1;
                sequence
            }
        };
        tracing::info!(
            module_id = %capability.module_id,
            outputs = capability.outputs.len(),
            "registered module capability"
        );
        table.modules.insert(
            capability.module_id.clone(),
            RegisteredModule {
                capability,
                sequence,
            },
        );
        Ok(())
    }

    /// Removes a module. Returns whether it was registered.
    pub fn unregister(&self, module_id: &str) -> Result<bool> {
        let removed = self.write()?.modules.remove(module_id).is_some();
        if removed {
            tracing::info!(module_id, "unregistered module capability");
        }
        Ok(removed)
    }

    pub fn get(&self, module_id: &str) -> Result<Option<RegisteredModule>> {
        Ok(self.read()?.modules.get(module_id).cloned())
    }

    pub fn contains(&self, module_id: &str) -> Result<bool> {
        Ok(self.read()?.modules.contains_key(module_id))
    }

    /// All registered modules in registration order.
    pub fn snapshot(&self) -> Result<Vec<RegisteredModule>> {
        let mut modules: Vec<_> = self.read()?.modules.values().cloned().collect();
        modules.sort_by_key(|module| module.sequence);
        Ok(modules)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.modules.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, ModuleTable>> {
        self.table
            .read()
            .map_err(|_| LedRouterError::Poisoned("module registry"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, ModuleTable>> {
        self.table
            .write()
            .map_err(|_| LedRouterError::Poisoned("module registry"))
    }
}

/// Source of device definitions. The engine only ever reads from it.
pub trait DeviceRegistry: Send + Sync {
    /// Every known device, ordered by device id.
    fn snapshot(&self) -> Result<Vec<DeviceCapabilities>>;

    fn device(&self, device_id: &str) -> Result<Option<DeviceCapabilities>>;
}

/// In-memory device registry that validates definitions on insert.
#[derive(Debug, Default)]
pub struct StaticDeviceRegistry {
    devices: RwLock<HashMap<String, DeviceCapabilities>>,
}

impl StaticDeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: impl IntoIterator<Item = DeviceCapabilities>) -> Result<Self> {
        let registry = Self::new();
        for device in devices {
            registry.upsert(device)?;
        }
        Ok(registry)
    }

    /// Adds or replaces a device. Invalid definitions are refused here rather
    /// than surfacing later during compositing.
    pub fn upsert(&self, device: DeviceCapabilities) -> Result<()> {
        device.validate()?;
        tracing::debug!(
            device_id = %device.device_id,
            dimensions = %device.dimensions,
            pixel_count = device.pixel_count,
            "device registered"
        );
        self.devices
            .write()
            .map_err(|_| LedRouterError::Poisoned("device registry"))?
            .insert(device.device_id.clone(), device);
        Ok(())
    }

    pub fn remove(&self, device_id: &str) -> Result<Option<DeviceCapabilities>> {
        Ok(self
            .devices
            .write()
            .map_err(|_| LedRouterError::Poisoned("device registry"))?
            .remove(device_id))
    }
}

impl DeviceRegistry for StaticDeviceRegistry {
    fn snapshot(&self) -> Result<Vec<DeviceCapabilities>> {
        let mut devices: Vec<_> = self
            .devices
            .read()
            .map_err(|_| LedRouterError::Poisoned("device registry"))?
            .values()
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(devices)
    }

    fn device(&self, device_id: &str) -> Result<Option<DeviceCapabilities>> {
        Ok(self
            .devices
            .read()
            .map_err(|_| LedRouterError::Poisoned("device registry"))?
            .get(device_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{DimensionPreference, VisualizationMode, VisualizationOutput};

    fn capability(id: &str, priority: i32) -> ModuleVisualizationCapability {
        ModuleVisualizationCapability::new(id).with_output(
            VisualizationOutput::new(VisualizationMode::FullStripWave, DimensionPreference::Either)
                .priority(priority),
        )
    }

    #[test]
    fn snapshot_follows_registration_order() {
        let registry = ModuleRegistry::new();
        registry.register(capability("zeta", 1)).unwrap();
        registry.register(capability("alpha", 1)).unwrap();
        registry.register(capability("mid", 1)).unwrap();

        let ids: Vec<_> = registry
            .snapshot()
            .unwrap()
            .iter()
            .map(|m| m.module_id().to_string())
            .collect();
        assert_eq!(ids, ["zeta", "alpha", "mid"]);
    }

    #[test]
    fn reregistering_keeps_position_and_replaces_outputs() {
        let registry = ModuleRegistry::new();
        registry.register(capability("first", 1)).unwrap();
        registry.register(capability("second", 1)).unwrap();
        registry.register(capability("first", 7)).unwrap();

        let snapshot = registry.snapshot().unwrap();
        assert_eq!(snapshot[0].module_id(), "first");
        assert_eq!(snapshot[0].capability.outputs[0].priority, 7);
    }

    #[test]
    fn unregister_removes_module() {
        let registry = ModuleRegistry::new();
        registry.register(capability("drums", 1)).unwrap();
        assert!(registry.unregister("drums").unwrap());
        assert!(!registry.unregister("drums").unwrap());
        assert!(registry.is_empty().unwrap());
    }

    #[test]
    fn device_registry_refuses_invalid_devices() {
        let registry = StaticDeviceRegistry::new();
        assert!(registry.upsert(DeviceCapabilities::strip("bad", 0)).is_err());
        assert!(registry.device("bad").unwrap().is_none());
    }

    #[test]
    fn device_snapshot_is_sorted() {
        let registry = StaticDeviceRegistry::with_devices([
            DeviceCapabilities::strip("b", 10),
            DeviceCapabilities::strip("a", 10),
        ])
        .unwrap();
        let ids: Vec<_> = registry
            .snapshot()
            .unwrap()
            .into_iter()
            .map(|d| d.device_id)
            .collect();
        assert_eq!(ids, ["a", "b"]);
    }
}

//! Producer-facing façade over the registries, frame slots and routing state.
//!
//! An [`Engine`] is cheap to clone and safe to share between module tasks.
//! Every producer call returns immediately; none of them waits on the
//! dispatch loop.

use std::{
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Instant,
};

use tokio::sync::broadcast;

use crate::{
    capability::{LedFrame, ModuleVisualizationCapability},
    compat::CompatibilityMatrix,
    compositor::{BlendMode, Compositor},
    config::EngineConfig,
    events::{EngineEvent, EventBus},
    frames::FrameStore,
    registry::{DeviceRegistry, ModuleRegistry},
    routing::{self, DeviceAssignment},
    rules::{RoutingContext, RoutingOverrides, RoutingRule},
    LedRouterError, Result,
};

#[derive(Debug, Default)]
struct Steering {
    focused_module: Option<String>,
    overrides: RoutingOverrides,
}

struct EngineShared {
    modules: ModuleRegistry,
    devices: Arc<dyn DeviceRegistry>,
    frames: FrameStore,
    rules: RwLock<Vec<RoutingRule>>,
    config: RwLock<EngineConfig>,
    steering: RwLock<Steering>,
    compositor: Compositor,
    events: EventBus,
}

#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

pub struct EngineBuilder {
    devices: Arc<dyn DeviceRegistry>,
    config: EngineConfig,
    rules: Vec<RoutingRule>,
    matrix: CompatibilityMatrix,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Appends a rule after the ones already declared. Device pins are
    /// always the first rule.
    pub fn rule(mut self, rule: RoutingRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn compatibility(mut self, matrix: CompatibilityMatrix) -> Self {
        self.matrix = matrix;
        self
    }

    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;
        let events = EventBus::new(self.config.event_capacity);
        Ok(Engine {
            shared: Arc::new(EngineShared {
                modules: ModuleRegistry::new(),
                devices: self.devices,
                frames: FrameStore::new(),
                rules: RwLock::new(self.rules),
                config: RwLock::new(self.config),
                steering: RwLock::new(Steering::default()),
                compositor: Compositor::new(self.matrix),
                events,
            }),
        })
    }
}

impl Engine {
    pub fn builder(devices: Arc<dyn DeviceRegistry>) -> EngineBuilder {
        EngineBuilder {
            devices,
            config: EngineConfig::default(),
            rules: vec![RoutingRule::pinned_devices()],
            matrix: CompatibilityMatrix::default(),
        }
    }

    /// Engine with default configuration and rules.
    pub fn new(devices: Arc<dyn DeviceRegistry>) -> Result<Self> {
        Self::builder(devices).build()
    }

    pub fn register_capability(&self, capability: ModuleVisualizationCapability) -> Result<()> {
        self.shared.modules.register(capability)
    }

    /// Removes a module and empties all of its frame slots. Both are visible
    /// to the very next tick.
    pub fn unregister_capability(&self, module_id: &str) -> Result<()> {
        self.shared.modules.unregister(module_id)?;
        let cleared = self.shared.frames.clear_module(module_id)?;
        tracing::debug!(module_id, cleared, "cleared frame slots of departing module");
        Ok(())
    }

    /// Stores `frame` as the latest output of its module for its device.
    ///
    /// Frames that do not fit the target device are rejected and the slot
    /// keeps its previous content.
    pub fn submit_frame(&self, frame: LedFrame) -> Result<()> {
        self.submit_frame_at(frame, Instant::now())
    }

    /// Like [`submit_frame`](Self::submit_frame) with an explicit receive
    /// time, which staleness is measured from.
    pub fn submit_frame_at(&self, frame: LedFrame, received_at: Instant) -> Result<()> {
        if let Err(err) = self.validate_frame(&frame) {
            tracing::warn!(
                module_id = %frame.module_id,
                device_id = %frame.device_id,
                error = %err,
                "rejected frame"
            );
            return Err(err);
        }
        self.shared.frames.submit(Arc::new(frame), received_at)
    }

    /// Empties one slot. Returns whether it held a frame.
    pub fn clear_frame(&self, module_id: &str, device_id: &str) -> Result<bool> {
        self.shared.frames.clear(module_id, device_id)
    }

    pub fn set_focused_module(&self, module_id: Option<String>) -> Result<()> {
        tracing::info!(focused = ?module_id, "focus changed");
        self.steering_mut()?.focused_module = module_id;
        Ok(())
    }

    pub fn set_overrides(&self, overrides: RoutingOverrides) -> Result<()> {
        self.steering_mut()?.overrides = overrides;
        Ok(())
    }

    pub fn overrides(&self) -> Result<RoutingOverrides> {
        Ok(self.steering()?.overrides.clone())
    }

    /// Validates and swaps the configuration; the next tick picks it up.
    pub fn update_config(&self, config: EngineConfig) -> Result<()> {
        config.validate()?;
        *self
            .shared
            .config
            .write()
            .map_err(|_| LedRouterError::Poisoned("engine config"))? = config;
        Ok(())
    }

    pub fn config(&self) -> Result<EngineConfig> {
        Ok(self
            .shared
            .config
            .read()
            .map_err(|_| LedRouterError::Poisoned("engine config"))?
            .clone())
    }

    pub fn add_rule(&self, rule: RoutingRule) -> Result<()> {
        self.shared
            .rules
            .write()
            .map_err(|_| LedRouterError::Poisoned("routing rules"))?
            .push(rule);
        Ok(())
    }

    pub fn rules(&self) -> Result<Vec<RoutingRule>> {
        Ok(self
            .shared
            .rules
            .read()
            .map_err(|_| LedRouterError::Poisoned("routing rules"))?
            .clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    /// Snapshot of everything the rules and the matrix look at.
    pub fn routing_context(&self) -> Result<RoutingContext> {
        let steering = self.steering()?;
        Ok(RoutingContext {
            focused_module: steering.focused_module.clone(),
            devices: self.shared.devices.snapshot()?,
            modules: self.shared.modules.snapshot()?,
            overrides: steering.overrides.clone(),
        })
    }

    /// Runs one routing cycle without dispatching anything.
    pub fn route(&self) -> Result<Vec<DeviceAssignment>> {
        let context = self.routing_context()?;
        let rules = self.rules()?;
        Ok(routing::route_with_rules(&context, &rules))
    }

    /// Effective blend mode for a device: a forced override first, then the
    /// per-device setting, then the global default.
    pub fn blend_for(&self, device_id: &str) -> Result<BlendMode> {
        let forced = self.steering()?.overrides.forced_blend;
        Ok(forced.unwrap_or(self.config()?.blend_for(device_id)))
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.shared.modules
    }

    pub fn devices(&self) -> &Arc<dyn DeviceRegistry> {
        &self.shared.devices
    }

    pub(crate) fn frames(&self) -> &FrameStore {
        &self.shared.frames
    }

    pub(crate) fn compositor(&self) -> &Compositor {
        &self.shared.compositor
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.shared.events
    }

    fn validate_frame(&self, frame: &LedFrame) -> Result<()> {
        if frame.module_id.trim().is_empty() {
            return Err(LedRouterError::malformed(
                &frame.module_id,
                &frame.device_id,
                "module id must not be empty",
            ));
        }
        let device = self
            .shared
            .devices
            .device(&frame.device_id)?
            .ok_or_else(|| LedRouterError::UnknownDevice(frame.device_id.clone()))?;
        if frame.len() != device.pixel_count {
            return Err(LedRouterError::malformed(
                &frame.module_id,
                &frame.device_id,
                format!(
                    "expected {} pixels, got {}",
                    device.pixel_count,
                    frame.len()
                ),
            ));
        }
        Ok(())
    }

    fn steering(&self) -> Result<RwLockReadGuard<'_, Steering>> {
        self.shared
            .steering
            .read()
            .map_err(|_| LedRouterError::Poisoned("routing overrides"))
    }

    fn steering_mut(&self) -> Result<RwLockWriteGuard<'_, Steering>> {
        self.shared
            .steering
            .write()
            .map_err(|_| LedRouterError::Poisoned("routing overrides"))
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("modules", &self.shared.modules)
            .field("frames", &self.shared.frames)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        capability::{
            DeviceCapabilities, DimensionPreference, Rgb, VisualizationMode::*, VisualizationOutput,
        },
        registry::StaticDeviceRegistry,
    };

    fn engine() -> Engine {
        let devices = StaticDeviceRegistry::with_devices([
            DeviceCapabilities::strip("strip-a", 90),
            DeviceCapabilities::matrix("grid-b", 8, 8, true),
        ])
        .unwrap();
        Engine::new(Arc::new(devices)).unwrap()
    }

    fn wave(module: &str) -> ModuleVisualizationCapability {
        ModuleVisualizationCapability::new(module).with_output(
            VisualizationOutput::new(FullStripWave, DimensionPreference::Either).overlay(),
        )
    }

    #[test]
    fn short_frame_is_rejected_and_slot_kept() {
        let engine = engine();
        engine
            .submit_frame(LedFrame::solid("x", "strip-a", FullStripWave, Rgb::WHITE, 90))
            .unwrap();

        let err = engine
            .submit_frame(LedFrame::solid("x", "strip-a", FullStripWave, Rgb::BLACK, 80))
            .unwrap_err();
        assert!(matches!(err, LedRouterError::MalformedFrame { .. }));

        let mailbox = engine.frames().mailbox("strip-a").unwrap();
        let kept = mailbox.get("x").unwrap().unwrap();
        assert_eq!(kept.frame.pixels[0], Rgb::WHITE);
    }

    #[test]
    fn unknown_device_is_rejected() {
        let engine = engine();
        let err = engine
            .submit_frame(LedFrame::solid("x", "nowhere", BeatFlash, Rgb::WHITE, 4))
            .unwrap_err();
        assert!(matches!(err, LedRouterError::UnknownDevice(_)));
    }

    #[test]
    fn unregister_clears_frames_and_assignments() {
        let engine = engine();
        engine.register_capability(wave("x")).unwrap();
        engine
            .submit_frame(LedFrame::solid("x", "strip-a", FullStripWave, Rgb::WHITE, 90))
            .unwrap();
        assert!(engine.route().unwrap().iter().any(|a| a.involves("x")));

        engine.unregister_capability("x").unwrap();
        assert!(engine.route().unwrap().is_empty());
        assert!(!engine.clear_frame("x", "strip-a").unwrap());
    }

    #[test]
    fn forced_blend_beats_device_setting() {
        let engine = engine();
        let mut config = EngineConfig::default();
        config.device_blend.insert("grid-b".to_string(), BlendMode::Max);
        engine.update_config(config).unwrap();
        assert_eq!(engine.blend_for("grid-b").unwrap(), BlendMode::Max);

        engine
            .set_overrides(RoutingOverrides {
                forced_blend: Some(BlendMode::Multiply),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(engine.blend_for("grid-b").unwrap(), BlendMode::Multiply);
    }

    #[test]
    fn pins_are_honored_by_default() {
        let engine = engine();
        engine.register_capability(wave("x")).unwrap();
        engine.register_capability(wave("y")).unwrap();

        let mut overrides = RoutingOverrides::default();
        overrides.pins.insert("strip-a".to_string(), "y".to_string());
        engine.set_overrides(overrides).unwrap();

        let assignments = engine.route().unwrap();
        let strip = assignments.iter().find(|a| a.device_id == "strip-a").unwrap();
        assert_eq!(strip.primary.module_id, "y");
        assert!(strip.overlays.is_empty());
    }

    #[test]
    fn invalid_config_update_is_refused() {
        let engine = engine();
        let config = EngineConfig {
            staleness_ticks: 0,
            ..Default::default()
        };
        assert!(engine.update_config(config).is_err());
        assert_eq!(engine.config().unwrap().staleness_ticks, 2);
    }
}

use std::{collections::BTreeMap, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    capability::{DeviceCapabilities, ModuleVisualizationCapability},
    compositor::BlendMode,
    LedRouterError, Result,
};

/// Fastest dispatch rate accepted; keeps the tick period non-zero.
pub const MAX_TICK_RATE_HZ: u32 = 1000;

/// What a device shows once nothing feeds it any more.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdlePolicy {
    /// Leave the last sent frame on the hardware.
    #[default]
    Hold,
    /// Send one all-black frame, then hold.
    Blank,
}

/// Engine tuning consumed at construction and on [`update`].
///
/// [`update`]: crate::Engine::update_config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub tick_rate_hz: u32,
    /// Frames older than this many ticks are left out of compositing.
    pub staleness_ticks: u32,
    pub default_blend: BlendMode,
    /// Per-device blend mode overrides.
    pub device_blend: BTreeMap<String, BlendMode>,
    pub idle_policy: IdlePolicy,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 30,
            staleness_ticks: 2,
            default_blend: BlendMode::Screen,
            device_blend: BTreeMap::new(),
            idle_policy: IdlePolicy::Hold,
            event_capacity: 256,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tick_rate_hz == 0 || self.tick_rate_hz > MAX_TICK_RATE_HZ {
            return Err(LedRouterError::InvalidConfig(format!(
                "tick rate must be between 1 and {MAX_TICK_RATE_HZ} Hz, got {}",
                self.tick_rate_hz
            )));
        }
        if self.staleness_ticks == 0 {
            return Err(LedRouterError::InvalidConfig(
                "staleness threshold must be at least one tick".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(LedRouterError::InvalidConfig(
                "event capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tick_period(&self) -> Duration {
        let rate = self.tick_rate_hz.clamp(1, MAX_TICK_RATE_HZ);
        Duration::from_nanos(1_000_000_000 / u64::from(rate))
    }

    pub fn staleness_threshold(&self) -> Duration {
        self.tick_period() * self.staleness_ticks
    }

    /// Configured blend mode for a device, before user overrides.
    pub fn blend_for(&self, device_id: &str) -> BlendMode {
        self.device_blend
            .get(device_id)
            .copied()
            .unwrap_or(self.default_blend)
    }
}

/// Top-level configuration file for the command line front end.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub devices: Vec<DeviceCapabilities>,
    #[serde(default)]
    pub modules: Vec<ModuleVisualizationCapability>,
    /// Device id -> `host:port` of the controller driving it.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

impl AppConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: AppConfig = serde_json::from_str(json)?;
        config.engine.validate()?;
        for device in &config.devices {
            device.validate()?;
        }
        for module in &config.modules {
            module.validate()?;
        }
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }
}

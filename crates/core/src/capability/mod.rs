//! Shared vocabulary between modules, devices and the engine.

use std::{collections::BTreeSet, fmt, time::Instant};

use serde::{Deserialize, Serialize};

use crate::{LedRouterError, Result};

/// Addressing scheme a frame uses. Only consulted for blend compatibility,
/// never for rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VisualizationMode {
    NotePerLed,
    FullStripWave,
    GridPattern,
    BeatFlash,
}

impl VisualizationMode {
    pub const ALL: [VisualizationMode; 4] = [
        VisualizationMode::NotePerLed,
        VisualizationMode::FullStripWave,
        VisualizationMode::GridPattern,
        VisualizationMode::BeatFlash,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            VisualizationMode::NotePerLed => "note-per-led",
            VisualizationMode::FullStripWave => "full-strip-wave",
            VisualizationMode::GridPattern => "grid-pattern",
            VisualizationMode::BeatFlash => "beat-flash",
        }
    }
}

impl fmt::Display for VisualizationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One colour, three 8-bit channels. Channel arithmetic elsewhere in the
/// crate saturates instead of wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);
    pub const WHITE: Rgb = Rgb::new(255, 255, 255);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Applies `op` to each channel pair.
    pub fn zip_with(self, other: Rgb, op: impl Fn(u8, u8) -> u8) -> Rgb {
        Rgb {
            r: op(self.r, other.r),
            g: op(self.g, other.g),
            b: op(self.b, other.b),
        }
    }

    /// An all-black pixel buffer of the given length.
    pub fn blank(len: usize) -> Vec<Rgb> {
        vec![Rgb::BLACK; len]
    }
}

impl From<(u8, u8, u8)> for Rgb {
    fn from((r, g, b): (u8, u8, u8)) -> Self {
        Self { r, g, b }
    }
}

/// One module's current output for one device.
///
/// Frames are shared as `Arc<LedFrame>` once submitted and never mutated by
/// the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedFrame {
    pub module_id: String,
    pub device_id: String,
    pub timestamp: Instant,
    pub pixels: Vec<Rgb>,
    pub mode: VisualizationMode,
}

impl LedFrame {
    pub fn new(
        module_id: impl Into<String>,
        device_id: impl Into<String>,
        mode: VisualizationMode,
        pixels: Vec<Rgb>,
    ) -> Self {
        Self::at(module_id, device_id, mode, pixels, Instant::now())
    }

    pub fn at(
        module_id: impl Into<String>,
        device_id: impl Into<String>,
        mode: VisualizationMode,
        pixels: Vec<Rgb>,
        timestamp: Instant,
    ) -> Self {
        Self {
            module_id: module_id.into(),
            device_id: device_id.into(),
            timestamp,
            pixels,
            mode,
        }
    }

    /// A frame filled with a single colour.
    pub fn solid(
        module_id: impl Into<String>,
        device_id: impl Into<String>,
        mode: VisualizationMode,
        color: Rgb,
        len: usize,
    ) -> Self {
        Self::new(module_id, device_id, mode, vec![color; len])
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }
}

impl AsRef<LedFrame> for LedFrame {
    fn as_ref(&self) -> &LedFrame {
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimensions {
    #[serde(rename = "1D")]
    OneD,
    #[serde(rename = "2D")]
    TwoD,
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimensions::OneD => f.write_str("1D"),
            Dimensions::TwoD => f.write_str("2D"),
        }
    }
}

/// Which device shape a module output is designed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DimensionPreference {
    #[serde(rename = "1D")]
    OneD,
    #[serde(rename = "2D")]
    TwoD,
    #[serde(rename = "either")]
    Either,
}

impl DimensionPreference {
    pub fn accepts(self, dimensions: Dimensions) -> bool {
        matches!(
            (self, dimensions),
            (DimensionPreference::Either, _)
                | (DimensionPreference::OneD, Dimensions::OneD)
                | (DimensionPreference::TwoD, Dimensions::TwoD)
        )
    }

    /// True when the preference names exactly this shape (not `either`).
    pub fn is_exact(self, dimensions: Dimensions) -> bool {
        self != DimensionPreference::Either && self.accepts(dimensions)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Orientation {
    #[default]
    Horizontal,
    Vertical,
}

/// Physical layout of a 2D matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridConfig {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub serpentine: bool,
    #[serde(default)]
    pub orientation: Orientation,
}

impl GridConfig {
    /// Maps a logical `(x, y)` coordinate to the index along the wired strip.
    ///
    /// Horizontal grids are wired row by row, vertical grids column by
    /// column. Serpentine wiring reverses every odd line.
    pub fn index_of(&self, x: u32, y: u32) -> Option<usize> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let (line, offset, line_len) = match self.orientation {
            Orientation::Horizontal => (y, x, self.width),
            Orientation::Vertical => (x, y, self.height),
        };
        let offset = if self.serpentine && line % 2 == 1 {
            line_len - 1 - offset
        } else {
            offset
        };
        Some(line as usize * line_len as usize + offset as usize)
    }

    pub fn cell_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Read-only description of a physical LED device, owned by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub device_id: String,
    pub dimensions: Dimensions,
    pub pixel_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid: Option<GridConfig>,
    #[serde(default)]
    pub supported: BTreeSet<VisualizationMode>,
}

impl DeviceCapabilities {
    pub fn strip(device_id: impl Into<String>, pixel_count: usize) -> Self {
        Self {
            device_id: device_id.into(),
            dimensions: Dimensions::OneD,
            pixel_count,
            grid: None,
            supported: BTreeSet::new(),
        }
    }

    pub fn matrix(device_id: impl Into<String>, width: u32, height: u32, serpentine: bool) -> Self {
        let grid = GridConfig {
            width,
            height,
            serpentine,
            orientation: Orientation::Horizontal,
        };
        Self {
            device_id: device_id.into(),
            dimensions: Dimensions::TwoD,
            pixel_count: grid.cell_count(),
            grid: Some(grid),
            supported: BTreeSet::new(),
        }
    }

    pub fn with_supported(mut self, modes: impl IntoIterator<Item = VisualizationMode>) -> Self {
        self.supported.extend(modes);
        self
    }

    pub fn supports(&self, mode: VisualizationMode) -> bool {
        self.supported.contains(&mode)
    }

    /// Checks the registration preconditions. Violations are programming
    /// errors reported to whoever registers the device.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| LedRouterError::InvalidDevice {
            device_id: self.device_id.clone(),
            reason,
        };

        if self.device_id.trim().is_empty() {
            return Err(invalid("device id must not be empty".to_string()));
        }
        if self.pixel_count == 0 {
            return Err(invalid("pixel count must be greater than zero".to_string()));
        }
        if let (Dimensions::TwoD, Some(grid)) = (self.dimensions, &self.grid) {
            if grid.cell_count() != self.pixel_count {
                return Err(invalid(format!(
                    "grid {}x{} does not cover {} pixels",
                    grid.width, grid.height, self.pixel_count
                )));
            }
        }
        Ok(())
    }
}

/// One visualization a module can produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisualizationOutput {
    pub mode: VisualizationMode,
    pub dimension_preference: DimensionPreference,
    #[serde(default)]
    pub overlay_compatible: bool,
    #[serde(default)]
    pub priority: i32,
}

impl VisualizationOutput {
    pub fn new(mode: VisualizationMode, dimension_preference: DimensionPreference) -> Self {
        Self {
            mode,
            dimension_preference,
            overlay_compatible: false,
            priority: 0,
        }
    }

    pub fn overlay(mut self) -> Self {
        self.overlay_compatible = true;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Static declaration a module registers when it activates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleVisualizationCapability {
    pub module_id: String,
    pub outputs: Vec<VisualizationOutput>,
}

impl ModuleVisualizationCapability {
    pub fn new(module_id: impl Into<String>) -> Self {
        Self {
            module_id: module_id.into(),
            outputs: Vec::new(),
        }
    }

    pub fn with_output(mut self, output: VisualizationOutput) -> Self {
        self.outputs.push(output);
        self
    }

    /// Declared output for `mode`, if the module produces it.
    pub fn output(&self, mode: VisualizationMode) -> Option<&VisualizationOutput> {
        self.outputs.iter().find(|output| output.mode == mode)
    }

    pub fn validate(&self) -> Result<()> {
        if self.module_id.trim().is_empty() {
            return Err(LedRouterError::InvalidCapability {
                module_id: self.module_id.clone(),
                reason: "module id must not be empty".to_string(),
            });
        }
        if self.outputs.is_empty() {
            return Err(LedRouterError::InvalidCapability {
                module_id: self.module_id.clone(),
                reason: "at least one visualization output is required".to_string(),
            });
        }
        Ok(())
    }
}

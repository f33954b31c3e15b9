//! Blends the frames of every producer assigned to one device into a single
//! output frame.
//!
//! Layers are ordered by declared priority (highest first, ties broken by
//! module id) and folded left to right: the first layer is the base, each
//! following layer is blended on top of the running result. Every step is
//! clamped to 8 bits, so for three or more layers the fold order is part of
//! the result. Saturating `additive` and `max` are associative, so only
//! `multiply` and `screen` can differ between fold orders, by at most one
//! unit of rounding per step.

use std::{cmp::Reverse, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    capability::{LedFrame, Rgb},
    compat::{CompatibilityMatrix, IncompatibilityReason},
};

/// Module id stamped on frames produced by blending.
pub const COMPOSITE_MODULE_ID: &str = "compositor";

/// Per-channel function used to combine two pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlendMode {
    Multiply,
    #[default]
    Screen,
    Additive,
    Max,
}

impl BlendMode {
    pub fn apply(self, base: Rgb, top: Rgb) -> Rgb {
        match self {
            BlendMode::Multiply => base.zip_with(top, multiply),
            BlendMode::Screen => base.zip_with(top, screen),
            BlendMode::Additive => base.zip_with(top, additive),
            BlendMode::Max => base.zip_with(top, u8::max),
        }
    }
}

/// `round(a * b / 255)`.
pub fn multiply(a: u8, b: u8) -> u8 {
    ((a as u16 * b as u16 + 127) / 255) as u8
}

/// `round(255 - (255 - a) * (255 - b) / 255)`.
pub fn screen(a: u8, b: u8) -> u8 {
    255 - multiply(255 - a, 255 - b)
}

/// `min(255, a + b)`.
pub fn additive(a: u8, b: u8) -> u8 {
    a.saturating_add(b)
}

/// A frame together with the declared priority of the output that produced it.
#[derive(Debug, Clone)]
pub struct Layer {
    pub frame: Arc<LedFrame>,
    pub priority: i32,
}

impl Layer {
    pub fn new(frame: Arc<LedFrame>, priority: i32) -> Self {
        Self { frame, priority }
    }
}

impl AsRef<LedFrame> for Layer {
    fn as_ref(&self) -> &LedFrame {
        &self.frame
    }
}

/// Incompatible producer pair that forced toggle mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameConflict {
    pub module_a: String,
    pub module_b: String,
    pub reason: IncompatibilityReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompositeKind {
    /// Exactly one layer, returned untouched.
    Passthrough,
    /// Two or more compatible layers folded with the blend function.
    Blended { layers: usize },
    /// Incompatible layers; the most recent frame won.
    Fallback { conflict: FrameConflict },
}

#[derive(Debug, Clone)]
pub struct Composite {
    pub frame: Arc<LedFrame>,
    pub kind: CompositeKind,
}

#[derive(Debug, Clone, Default)]
pub struct Compositor {
    matrix: CompatibilityMatrix,
}

impl Compositor {
    pub fn new(matrix: CompatibilityMatrix) -> Self {
        Self { matrix }
    }

    pub fn matrix(&self) -> &CompatibilityMatrix {
        &self.matrix
    }

    /// Produces one output frame, or `None` when there is nothing to show.
    pub fn composite(&self, layers: &[Layer], blend: BlendMode) -> Option<Composite> {
        match layers {
            [] => None,
            [only] => Some(Composite {
                frame: Arc::clone(&only.frame),
                kind: CompositeKind::Passthrough,
            }),
            _ => {
                let mut ordered = layers.to_vec();
                ordered.sort_by(|a, b| {
                    b.priority
                        .cmp(&a.priority)
                        .then_with(|| a.frame.module_id.cmp(&b.frame.module_id))
                });

                match self.matrix.check_all(&ordered) {
                    Ok(()) => Some(Composite {
                        frame: Arc::new(fold(&ordered, blend)),
                        kind: CompositeKind::Blended {
                            layers: ordered.len(),
                        },
                    }),
                    Err(conflict) => {
                        let conflict = FrameConflict {
                            module_a: ordered[conflict.left].frame.module_id.clone(),
                            module_b: ordered[conflict.right].frame.module_id.clone(),
                            reason: conflict.reason,
                        };
                        Some(Composite {
                            frame: most_recent(&ordered),
                            kind: CompositeKind::Fallback { conflict },
                        })
                    }
                }
            }
        }
    }
}

/// Composites with the default compatibility matrix.
pub fn composite(layers: &[Layer], blend: BlendMode) -> Option<Composite> {
    Compositor::default().composite(layers, blend)
}

fn fold(ordered: &[Layer], blend: BlendMode) -> LedFrame {
    let base = &ordered[0].frame;
    let mut pixels = base.pixels.clone();
    for layer in &ordered[1..] {
        for (pixel, top) in pixels.iter_mut().zip(&layer.frame.pixels) {
            *pixel = blend.apply(*pixel, *top);
        }
    }

    let timestamp = ordered
        .iter()
        .map(|layer| layer.frame.timestamp)
        .max()
        .unwrap_or(base.timestamp);

    LedFrame::at(
        COMPOSITE_MODULE_ID,
        base.device_id.clone(),
        base.mode,
        pixels,
        timestamp,
    )
}

// Ties go to the earlier (higher precedence) layer.
fn most_recent(ordered: &[Layer]) -> Arc<LedFrame> {
    let (_, winner) = ordered
        .iter()
        .enumerate()
        .max_by_key(|(index, layer)| (layer.frame.timestamp, Reverse(*index)))
        .unwrap_or((0, &ordered[0]));
    Arc::clone(&winner.frame)
}

//! Decides whether frames with different addressing schemes can be blended.

use std::{collections::BTreeSet, fmt};

use serde::{Deserialize, Serialize};

use crate::capability::{LedFrame, VisualizationMode};

/// Why two frames cannot be blended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum IncompatibilityReason {
    /// Both frames address one LED per note but disagree on how many notes.
    NotePerLedCardinality { left: usize, right: usize },
    /// The matrix has no entry for this pair of modes.
    ModeConflict {
        left: VisualizationMode,
        right: VisualizationMode,
    },
}

impl fmt::Display for IncompatibilityReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IncompatibilityReason::NotePerLedCardinality { left, right } => write!(
                f,
                "different note-per-led cardinality ({left} vs {right})"
            ),
            IncompatibilityReason::ModeConflict { left, right } => {
                write!(f, "{left} cannot blend with {right}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compatibility {
    Compatible,
    Incompatible(IncompatibilityReason),
}

impl Compatibility {
    pub fn is_compatible(&self) -> bool {
        matches!(self, Compatibility::Compatible)
    }
}

/// First conflicting pair found by [`CompatibilityMatrix::check_all`], as
/// indices into the checked slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub left: usize,
    pub right: usize,
    pub reason: IncompatibilityReason,
}

/// Symmetric relation over visualization modes. Each unordered pair is stored
/// once and queried in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompatibilityMatrix {
    pairs: BTreeSet<(VisualizationMode, VisualizationMode)>,
}

impl Default for CompatibilityMatrix {
    /// Waves and beat flashes blend with everything. Note-per-led and grid
    /// patterns blend with those two and with themselves, never with each
    /// other.
    fn default() -> Self {
        use VisualizationMode::*;

        let mut matrix = Self::empty();
        for universal in [FullStripWave, BeatFlash] {
            for mode in VisualizationMode::ALL {
                matrix.allow(universal, mode);
            }
        }
        matrix.allow(NotePerLed, NotePerLed);
        matrix.allow(GridPattern, GridPattern);
        matrix
    }
}

impl CompatibilityMatrix {
    /// A matrix in which nothing blends (except the note-per-led rule, which
    /// is applied before the matrix is consulted).
    pub fn empty() -> Self {
        Self {
            pairs: BTreeSet::new(),
        }
    }

    pub fn allow(&mut self, a: VisualizationMode, b: VisualizationMode) -> &mut Self {
        self.pairs.insert(Self::key(a, b));
        self
    }

    pub fn allows(&self, a: VisualizationMode, b: VisualizationMode) -> bool {
        self.pairs.contains(&Self::key(a, b))
    }

    /// Checks a single pair of frames.
    pub fn check(&self, a: &LedFrame, b: &LedFrame) -> Compatibility {
        if a.mode == VisualizationMode::NotePerLed && b.mode == VisualizationMode::NotePerLed {
            return if a.len() == b.len() {
                Compatibility::Compatible
            } else {
                Compatibility::Incompatible(IncompatibilityReason::NotePerLedCardinality {
                    left: a.len(),
                    right: b.len(),
                })
            };
        }

        if self.allows(a.mode, b.mode) {
            Compatibility::Compatible
        } else {
            let (left, right) = Self::key(a.mode, b.mode);
            Compatibility::Incompatible(IncompatibilityReason::ModeConflict { left, right })
        }
    }

    /// Pairwise check of every combination. Any incompatible pair makes the
    /// whole set incompatible; the first one in `(i, j)` order is reported.
    pub fn check_all<F>(&self, frames: &[F]) -> Result<(), Conflict>
    where
        F: AsRef<LedFrame>,
    {
        for (i, a) in frames.iter().enumerate() {
            for (offset, b) in frames[i + 1..].iter().enumerate() {
                if let Compatibility::Incompatible(reason) = self.check(a.as_ref(), b.as_ref()) {
                    return Err(Conflict {
                        left: i,
                        right: i + 1 + offset,
                        reason,
                    });
                }
            }
        }
        Ok(())
    }

    fn key(a: VisualizationMode, b: VisualizationMode) -> (VisualizationMode, VisualizationMode) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }
}

/// Checks two frames against the default matrix.
pub fn check_compatible(a: &LedFrame, b: &LedFrame) -> Compatibility {
    CompatibilityMatrix::default().check(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Rgb;
    use VisualizationMode::*;

    fn frame(mode: VisualizationMode, len: usize) -> LedFrame {
        LedFrame::solid("m", "d", mode, Rgb::BLACK, len)
    }

    #[test]
    fn note_per_led_requires_equal_cardinality() {
        assert!(check_compatible(&frame(NotePerLed, 88), &frame(NotePerLed, 88)).is_compatible());
        assert_eq!(
            check_compatible(&frame(NotePerLed, 88), &frame(NotePerLed, 150)),
            Compatibility::Incompatible(IncompatibilityReason::NotePerLedCardinality {
                left: 88,
                right: 150
            })
        );
    }

    #[test]
    fn relation_is_symmetric_for_every_mode_pair() {
        for a in VisualizationMode::ALL {
            for b in VisualizationMode::ALL {
                let ab = check_compatible(&frame(a, 10), &frame(b, 10));
                let ba = check_compatible(&frame(b, 10), &frame(a, 10));
                assert_eq!(ab, ba, "{a} vs {b}");
            }
        }
    }

    #[test]
    fn notes_and_grids_do_not_mix() {
        let result = check_compatible(&frame(NotePerLed, 64), &frame(GridPattern, 64));
        assert!(!result.is_compatible());
        assert!(check_compatible(&frame(GridPattern, 64), &frame(BeatFlash, 64)).is_compatible());
        assert!(
            check_compatible(&frame(NotePerLed, 64), &frame(FullStripWave, 64)).is_compatible()
        );
    }

    #[test]
    fn check_all_reports_first_conflict() {
        let frames = vec![
            frame(FullStripWave, 10),
            frame(GridPattern, 10),
            frame(BeatFlash, 10),
            frame(NotePerLed, 10),
        ];
        let conflict = CompatibilityMatrix::default().check_all(&frames).unwrap_err();
        assert_eq!((conflict.left, conflict.right), (1, 3));
    }

    #[test]
    fn custom_matrix_extends_defaults() {
        let mut matrix = CompatibilityMatrix::default();
        matrix.allow(GridPattern, NotePerLed);
        assert!(matrix.check(&frame(NotePerLed, 8), &frame(GridPattern, 8)).is_compatible());
    }
}

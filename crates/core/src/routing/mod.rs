//! Default capability matching between module outputs and devices.
//!
//! Every `(module, output)` pair whose dimension preference fits the device is
//! scored: +100 for an exact dimension match, +50 for `either`, and a further
//! +50 when the device lists the output's mode as supported. The best pair
//! becomes the primary producer; ties go to the higher declared priority and
//! then to the module that registered first. Every other module joins as an
//! overlay with its best overlay-compatible output, highest priority first.

use std::{cmp::Reverse, fmt};

use serde::Serialize;

use crate::{
    capability::{DeviceCapabilities, VisualizationMode, VisualizationOutput},
    registry::RegisteredModule,
    rules::{self, RoutingContext, RoutingRule, RuleOutcome},
};

pub const EXACT_DIMENSION_SCORE: u32 = 100;
pub const EITHER_DIMENSION_SCORE: u32 = 50;
pub const SUPPORTED_MODE_BONUS: u32 = 50;

/// A module output feeding a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Producer {
    pub module_id: String,
    pub mode: VisualizationMode,
}

impl Producer {
    pub fn new(module_id: impl Into<String>, mode: VisualizationMode) -> Self {
        Self {
            module_id: module_id.into(),
            mode,
        }
    }
}

impl fmt::Display for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.module_id, self.mode)
    }
}

/// What decided an assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "by", content = "rule", rename_all = "kebab-case")]
pub enum Resolution {
    Matrix,
    Rule(String),
}

/// Producers feeding one device for one routing cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceAssignment {
    pub device_id: String,
    pub primary: Producer,
    pub overlays: Vec<Producer>,
    pub resolved_by: Resolution,
}

impl DeviceAssignment {
    /// Assignment with only a primary producer.
    pub fn exclusive(
        device_id: impl Into<String>,
        primary: Producer,
        resolved_by: Resolution,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            primary,
            overlays: Vec::new(),
            resolved_by,
        }
    }

    /// Primary first, then overlays in order.
    pub fn producers(&self) -> impl Iterator<Item = &Producer> {
        std::iter::once(&self.primary).chain(self.overlays.iter())
    }

    pub fn involves(&self, module_id: &str) -> bool {
        self.producers().any(|producer| producer.module_id == module_id)
    }
}

/// Capability fit of one output on one device, `None` when the dimension
/// preference rules the device out.
pub fn score(output: &VisualizationOutput, device: &DeviceCapabilities) -> Option<u32> {
    if !output.dimension_preference.accepts(device.dimensions) {
        return None;
    }
    let mut score = if output.dimension_preference.is_exact(device.dimensions) {
        EXACT_DIMENSION_SCORE
    } else {
        EITHER_DIMENSION_SCORE
    };
    if device.supports(output.mode) {
        score += SUPPORTED_MODE_BONUS;
    }
    Some(score)
}

/// Highest scoring output a module declares for a device.
pub fn best_output<'a>(
    module: &'a RegisteredModule,
    device: &DeviceCapabilities,
) -> Option<(&'a VisualizationOutput, u32)> {
    best_output_where(module, device, |_| true)
}

fn best_output_where<'a>(
    module: &'a RegisteredModule,
    device: &DeviceCapabilities,
    keep: impl Fn(&VisualizationOutput) -> bool,
) -> Option<(&'a VisualizationOutput, u32)> {
    module
        .capability
        .outputs
        .iter()
        .enumerate()
        .filter(|(_, output)| keep(*output))
        .filter_map(|(index, output)| score(output, device).map(|score| (index, output, score)))
        .min_by_key(|(index, output, score)| (Reverse(*score), Reverse(output.priority), *index))
        .map(|(_, output, score)| (output, score))
}

#[derive(Debug)]
struct Candidate<'a> {
    module: &'a RegisteredModule,
    output: &'a VisualizationOutput,
    score: u32,
}

impl Candidate<'_> {
    fn producer(&self) -> Producer {
        Producer::new(self.module.module_id(), self.output.mode)
    }
}

/// Default assignment for a single device, `None` when no module fits it.
pub fn assign_device(
    device: &DeviceCapabilities,
    modules: &[RegisteredModule],
) -> Option<DeviceAssignment> {
    let mut candidates: Vec<Candidate<'_>> = modules
        .iter()
        .filter_map(|module| {
            best_output(module, device).map(|(output, score)| Candidate {
                module,
                output,
                score,
            })
        })
        .collect();

    candidates.sort_by_key(|c| (Reverse(c.score), Reverse(c.output.priority), c.module.sequence));
    let primary = candidates.into_iter().next()?;

    let mut overlays: Vec<Candidate<'_>> = modules
        .iter()
        .filter(|module| module.module_id() != primary.module.module_id())
        .filter_map(|module| {
            best_output_where(module, device, |output| output.overlay_compatible).map(
                |(output, score)| Candidate {
                    module,
                    output,
                    score,
                },
            )
        })
        .collect();
    overlays.sort_by_key(|c| (Reverse(c.output.priority), Reverse(c.score), c.module.sequence));

    Some(DeviceAssignment {
        device_id: device.device_id.clone(),
        primary: primary.producer(),
        overlays: overlays.iter().map(Candidate::producer).collect(),
        resolved_by: Resolution::Matrix,
    })
}

/// Default assignments for every device that at least one module fits.
pub fn route(
    devices: &[DeviceCapabilities],
    modules: &[RegisteredModule],
) -> Vec<DeviceAssignment> {
    devices
        .iter()
        .filter_map(|device| assign_device(device, modules))
        .collect()
}

/// One full routing cycle: rules first, the capability matrix for every
/// device no rule resolved.
pub fn route_with_rules(context: &RoutingContext, rules: &[RoutingRule]) -> Vec<DeviceAssignment> {
    context
        .devices
        .iter()
        .filter_map(|device| {
            if let RuleOutcome::Matched { rule, assignment } =
                rules::evaluate(context, device, rules)
            {
                match sanitize(assignment, &context.modules) {
                    Some(assignment) => return Some(assignment),
                    None => tracing::warn!(
                        device_id = %device.device_id,
                        rule = %rule,
                        "rule assigned an unregistered primary producer; using default routing"
                    ),
                }
            }
            assign_device(device, &context.modules)
        })
        .collect()
}

/// Holds a rule-produced assignment to the same invariants as the matrix:
/// the primary must be registered, overlays must be registered,
/// overlay-compatible, and distinct from the primary module.
pub fn sanitize(
    mut assignment: DeviceAssignment,
    modules: &[RegisteredModule],
) -> Option<DeviceAssignment> {
    let find = |module_id: &str| modules.iter().find(|m| m.module_id() == module_id);

    find(&assignment.primary.module_id)?;

    let primary_module = assignment.primary.module_id.clone();
    let mut seen = vec![primary_module];
    assignment.overlays.retain(|overlay| {
        let keep = !seen.contains(&overlay.module_id)
            && find(&overlay.module_id)
                .and_then(|module| module.capability.output(overlay.mode))
                .map(|output| output.overlay_compatible)
                .unwrap_or(false);
        if keep {
            seen.push(overlay.module_id.clone());
        } else {
            tracing::debug!(
                device_id = %assignment.device_id,
                overlay = %overlay,
                "dropping overlay that is unknown, duplicated or not overlay-compatible"
            );
        }
        keep
    });
    Some(assignment)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        capability::{DimensionPreference, ModuleVisualizationCapability},
        VisualizationMode::*,
    };

    fn module(sequence: u64, id: &str, outputs: Vec<VisualizationOutput>) -> RegisteredModule {
        RegisteredModule {
            capability: ModuleVisualizationCapability {
                module_id: id.to_string(),
                outputs,
            },
            sequence,
        }
    }

    fn grid_b() -> DeviceCapabilities {
        DeviceCapabilities::matrix("grid-b", 8, 8, true).with_supported([GridPattern, BeatFlash])
    }

    #[test]
    fn scores_dimension_fit_and_supported_modes() {
        let device = grid_b();
        let exact = VisualizationOutput::new(GridPattern, DimensionPreference::TwoD);
        let either = VisualizationOutput::new(FullStripWave, DimensionPreference::Either);
        let wrong = VisualizationOutput::new(GridPattern, DimensionPreference::OneD);
        assert_eq!(score(&exact, &device), Some(150));
        assert_eq!(score(&either, &device), Some(50));
        assert_eq!(score(&wrong, &device), None);
    }

    #[test]
    fn grid_device_gets_pattern_primary_and_flash_overlay() {
        let modules = vec![
            module(
                0,
                "module-a",
                vec![VisualizationOutput::new(GridPattern, DimensionPreference::TwoD).priority(10)],
            ),
            module(
                1,
                "module-b",
                vec![VisualizationOutput::new(BeatFlash, DimensionPreference::Either)
                    .priority(5)
                    .overlay()],
            ),
        ];

        let assignment = assign_device(&grid_b(), &modules).unwrap();
        assert_eq!(
            assignment,
            DeviceAssignment {
                device_id: "grid-b".to_string(),
                primary: Producer::new("module-a", GridPattern),
                overlays: vec![Producer::new("module-b", BeatFlash)],
                resolved_by: Resolution::Matrix,
            }
        );
    }

    #[test]
    fn ties_break_by_priority_then_registration() {
        let strip = DeviceCapabilities::strip("strip", 30);
        let wave =
            |p| VisualizationOutput::new(FullStripWave, DimensionPreference::OneD).priority(p);
        let modules = vec![
            module(0, "early", vec![wave(1)]),
            module(1, "loud", vec![wave(4)]),
            module(2, "late", vec![wave(4)]),
        ];
        let assignment = assign_device(&strip, &modules).unwrap();
        assert_eq!(assignment.primary.module_id, "loud");
        assert!(assignment.overlays.is_empty());
    }

    #[test]
    fn overlays_ordered_by_priority() {
        let strip = DeviceCapabilities::strip("strip", 30);
        let flash = |p| {
            VisualizationOutput::new(BeatFlash, DimensionPreference::Either)
                .priority(p)
                .overlay()
        };
        let modules = vec![
            module(
                0,
                "main",
                vec![VisualizationOutput::new(FullStripWave, DimensionPreference::OneD)],
            ),
            module(1, "low", vec![flash(1)]),
            module(2, "high", vec![flash(9)]),
        ];
        let assignment = assign_device(&strip, &modules).unwrap();
        let overlays: Vec<_> = assignment.overlays.iter().map(|p| p.module_id.as_str()).collect();
        assert_eq!(overlays, ["high", "low"]);
    }

    #[test]
    fn module_uses_only_its_best_output() {
        let device = grid_b();
        let modules = vec![module(
            0,
            "multi",
            vec![
                VisualizationOutput::new(BeatFlash, DimensionPreference::Either).overlay(),
                VisualizationOutput::new(GridPattern, DimensionPreference::TwoD),
            ],
        )];
        let assignment = assign_device(&device, &modules).unwrap();
        assert_eq!(assignment.primary, Producer::new("multi", GridPattern));
        assert!(assignment.overlays.is_empty());
    }

    #[test]
    fn routing_is_deterministic() {
        let devices = vec![DeviceCapabilities::strip("a", 10), grid_b()];
        let modules = vec![
            module(
                0,
                "x",
                vec![
                    VisualizationOutput::new(FullStripWave, DimensionPreference::Either).overlay(),
                ],
            ),
            module(
                1,
                "y",
                vec![VisualizationOutput::new(BeatFlash, DimensionPreference::Either).overlay()],
            ),
        ];
        assert_eq!(route(&devices, &modules), route(&devices, &modules));
        assert_eq!(route(&devices, &modules).len(), 2);
    }

    #[test]
    fn losing_module_overlays_with_its_compatible_output() {
        let modules = vec![
            module(
                0,
                "a",
                vec![VisualizationOutput::new(GridPattern, DimensionPreference::TwoD).priority(10)],
            ),
            module(
                1,
                "b",
                vec![
                    VisualizationOutput::new(GridPattern, DimensionPreference::TwoD).priority(5),
                    VisualizationOutput::new(BeatFlash, DimensionPreference::Either)
                        .priority(5)
                        .overlay(),
                ],
            ),
        ];
        let assignment = assign_device(&grid_b(), &modules).unwrap();
        assert_eq!(assignment.primary, Producer::new("a", GridPattern));
        assert_eq!(assignment.overlays, vec![Producer::new("b", BeatFlash)]);
    }

    #[test]
    fn unfit_devices_get_no_assignment() {
        let modules = vec![module(
            0,
            "strip-only",
            vec![VisualizationOutput::new(FullStripWave, DimensionPreference::OneD)],
        )];
        assert!(assign_device(&grid_b(), &modules).is_none());
    }

    #[test]
    fn sanitize_drops_invalid_overlays() {
        let modules = vec![
            module(
                0,
                "a",
                vec![VisualizationOutput::new(GridPattern, DimensionPreference::TwoD)],
            ),
            module(
                1,
                "b",
                vec![VisualizationOutput::new(BeatFlash, DimensionPreference::Either)],
            ),
            module(
                2,
                "c",
                vec![VisualizationOutput::new(BeatFlash, DimensionPreference::Either).overlay()],
            ),
        ];
        let assignment = DeviceAssignment {
            device_id: "grid-b".to_string(),
            primary: Producer::new("a", GridPattern),
            overlays: vec![
                Producer::new("a", GridPattern),
                Producer::new("b", BeatFlash),
                Producer::new("c", BeatFlash),
                Producer::new("ghost", BeatFlash),
            ],
            resolved_by: Resolution::Rule("test".to_string()),
        };
        let cleaned = sanitize(assignment, &modules).unwrap();
        assert_eq!(cleaned.overlays, vec![Producer::new("c", BeatFlash)]);

        let orphan = DeviceAssignment::exclusive(
            "grid-b",
            Producer::new("ghost", GridPattern),
            Resolution::Matrix,
        );
        assert!(sanitize(orphan, &modules).is_none());
    }
}

//! Context-aware routing overrides evaluated before the capability matrix.
//!
//! Rules are checked in declaration order and the first one whose condition
//! holds for a device decides that device. Conditions and actions are pure
//! functions of the [`RoutingContext`]. An action may decline by returning
//! `None`, in which case evaluation moves on to the next rule.

use std::{collections::BTreeMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    capability::{DeviceCapabilities, Dimensions},
    compositor::BlendMode,
    registry::RegisteredModule,
    routing::{best_output, DeviceAssignment, Producer, Resolution},
};

/// User-set overrides that take precedence over automatic routing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingOverrides {
    /// Blend mode forced onto every device, ahead of any configured mode.
    #[serde(default)]
    pub forced_blend: Option<BlendMode>,
    /// Device id -> module id that exclusively owns it.
    #[serde(default)]
    pub pins: BTreeMap<String, String>,
}

/// Everything a rule may look at. Built fresh for every routing cycle.
#[derive(Debug, Clone, Default)]
pub struct RoutingContext {
    pub focused_module: Option<String>,
    pub devices: Vec<DeviceCapabilities>,
    /// Registered modules in registration order.
    pub modules: Vec<RegisteredModule>,
    pub overrides: RoutingOverrides,
}

impl RoutingContext {
    pub fn module(&self, module_id: &str) -> Option<&RegisteredModule> {
        self.modules.iter().find(|module| module.module_id() == module_id)
    }

    pub fn is_focused(&self, module_id: &str) -> bool {
        self.focused_module.as_deref() == Some(module_id)
    }
}

type Condition = dyn Fn(&RoutingContext, &DeviceCapabilities) -> bool + Send + Sync;
type Action =
    dyn Fn(&RoutingContext, &DeviceCapabilities) -> Option<DeviceAssignment> + Send + Sync;

#[derive(Clone)]
pub struct RoutingRule {
    name: String,
    condition: Arc<Condition>,
    action: Arc<Action>,
}

impl RoutingRule {
    pub fn new<C, A>(name: impl Into<String>, condition: C, action: A) -> Self
    where
        C: Fn(&RoutingContext, &DeviceCapabilities) -> bool + Send + Sync + 'static,
        A: Fn(&RoutingContext, &DeviceCapabilities) -> Option<DeviceAssignment>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            condition: Arc::new(condition),
            action: Arc::new(action),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matches(&self, context: &RoutingContext, device: &DeviceCapabilities) -> bool {
        (self.condition)(context, device)
    }

    pub fn apply(
        &self,
        context: &RoutingContext,
        device: &DeviceCapabilities,
    ) -> Option<DeviceAssignment> {
        (self.action)(context, device)
    }

    /// Honors [`RoutingOverrides::pins`]. The pinned module becomes the only
    /// producer for the device, using its best fitting output, or its highest
    /// priority output when none of its outputs fit the device shape.
    pub fn pinned_devices() -> Self {
        const NAME: &str = "pinned-devices";
        Self::new(
            NAME,
            |context, device| {
                context
                    .overrides
                    .pins
                    .get(&device.device_id)
                    .map(|module_id| context.module(module_id).is_some())
                    .unwrap_or(false)
            },
            |context, device| {
                let module = context.module(context.overrides.pins.get(&device.device_id)?)?;
                let output = best_output(module, device)
                    .map(|(output, _)| output)
                    .or_else(|| module.capability.outputs.iter().max_by_key(|o| o.priority))?;
                Some(DeviceAssignment::exclusive(
                    device.device_id.clone(),
                    Producer::new(module.module_id(), output.mode),
                    Resolution::Rule(NAME.to_string()),
                ))
            },
        )
    }

    /// While `module_id` is the focused module it exclusively owns every
    /// device of the given shape, e.g. a fretboard taking over the grid.
    pub fn exclusive_when_focused(module_id: impl Into<String>, dimensions: Dimensions) -> Self {
        let module_id: String = module_id.into();
        let name = format!("{module_id}-exclusive-{dimensions}");
        let owner = module_id.clone();
        let rule_name = name.clone();
        Self::new(
            name,
            move |context, device| {
                device.dimensions == dimensions && context.is_focused(&module_id)
            },
            move |context, device| {
                let module = context.module(&owner)?;
                let (output, _) = best_output(module, device)?;
                Some(DeviceAssignment::exclusive(
                    device.device_id.clone(),
                    Producer::new(owner.clone(), output.mode),
                    Resolution::Rule(rule_name.clone()),
                ))
            },
        )
    }
}

impl fmt::Debug for RoutingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingRule").field("name", &self.name).finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOutcome {
    Matched {
        rule: String,
        assignment: DeviceAssignment,
    },
    NoMatch,
}

/// First matching rule for `device`, in declaration order.
pub fn evaluate(
    context: &RoutingContext,
    device: &DeviceCapabilities,
    rules: &[RoutingRule],
) -> RuleOutcome {
    for rule in rules {
        if !rule.matches(context, device) {
            continue;
        }
        match rule.apply(context, device) {
            Some(assignment) => {
                return RuleOutcome::Matched {
                    rule: rule.name.clone(),
                    assignment,
                }
            }
            None => tracing::debug!(
                rule = %rule.name,
                device_id = %device.device_id,
                "rule matched but declined to assign"
            ),
        }
    }
    RuleOutcome::NoMatch
}

//! Structured notifications for UI and observability consumers.

use std::fmt;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::{compat::IncompatibilityReason, routing::DeviceAssignment, TransportError};

/// Per-device dispatch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceState {
    /// No producer is assigned.
    #[default]
    Idle,
    /// A primary producer is assigned, at most one live frame.
    Assigned,
    /// Two or more compatible live frames are being blended.
    Compositing,
    /// Incompatible live frames; the most recent one is shown.
    Fallback,
    /// The device left the registry. Terminal.
    Removed,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Idle => "idle",
            DeviceState::Assigned => "assigned",
            DeviceState::Compositing => "compositing",
            DeviceState::Fallback => "fallback",
            DeviceState::Removed => "removed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum EngineEvent {
    /// The producers feeding a device changed. `None` means the device has
    /// no assignment any more.
    AssignmentChanged {
        device_id: String,
        assignment: Option<DeviceAssignment>,
    },
    CompatibilityWarning {
        device_id: String,
        module_a: String,
        module_b: String,
        reason: IncompatibilityReason,
    },
    DispatchError {
        device_id: String,
        error: TransportError,
    },
    StateChanged {
        device_id: String,
        from: DeviceState,
        to: DeviceState,
    },
}

impl EngineEvent {
    pub fn device_id(&self) -> &str {
        match self {
            EngineEvent::AssignmentChanged { device_id, .. }
            | EngineEvent::CompatibilityWarning { device_id, .. }
            | EngineEvent::DispatchError { device_id, .. }
            | EngineEvent::StateChanged { device_id, .. } => device_id,
        }
    }
}

/// Fan-out of [`EngineEvent`]s. Lagging subscribers lose the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event; having no subscribers is fine.
    pub fn emit(&self, event: EngineEvent) {
        tracing::trace!(?event, "engine event");
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

//! Core library for the LED router.
//!
//! Several creative modules (sequencers, piano rolls, fretboards, audio
//! analysers) submit pixel frames for a shared pool of LED strips and
//! matrices. The engine decides which module feeds which device, blends the
//! frames that may be blended, falls back to the most recent frame when they
//! may not, and dispatches one frame per device per tick to a transport sink.

pub mod capability;
pub mod compat;
pub mod compositor;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod frames;
pub mod registry;
pub mod routing;
pub mod rules;
pub mod transport;

pub use capability::{
    DeviceCapabilities, DimensionPreference, Dimensions, GridConfig, LedFrame,
    ModuleVisualizationCapability, Orientation, Rgb, VisualizationMode, VisualizationOutput,
};
pub use compat::{check_compatible, Compatibility, CompatibilityMatrix, IncompatibilityReason};
pub use compositor::{composite, BlendMode, Composite, CompositeKind, Compositor, Layer};
pub use config::{AppConfig, EngineConfig, IdlePolicy, MAX_TICK_RATE_HZ};
pub use dispatch::{spawn_dispatch_loop, DispatchHandle, Dispatcher, Outgoing};
pub use engine::{Engine, EngineBuilder};
pub use error::{LedRouterError, Result, TransportError};
pub use events::{DeviceState, EngineEvent, EventBus};
pub use frames::{DeviceMailbox, FrameSlot, FrameStore};
pub use registry::{DeviceRegistry, ModuleRegistry, RegisteredModule, StaticDeviceRegistry};
pub use routing::{route, DeviceAssignment, Producer, Resolution};
pub use rules::{evaluate, RoutingContext, RoutingOverrides, RoutingRule, RuleOutcome};
pub use transport::{LogSink, MemorySink, TransportSink};

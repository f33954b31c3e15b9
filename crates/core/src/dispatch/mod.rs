//! Fixed-rate dispatch of composited frames.
//!
//! Every tick routes all devices, gathers the fresh frames of each device's
//! producers, composites them and hands the result to the transport sink. A
//! device whose previous send has not finished is skipped for that tick, so
//! a slow device never holds up the others and never receives more than one
//! frame per tick.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{sync::mpsc, task::JoinHandle, time};

use crate::{
    capability::{LedFrame, Rgb, VisualizationMode},
    compositor::{CompositeKind, Layer, COMPOSITE_MODULE_ID},
    config::IdlePolicy,
    engine::Engine,
    events::{DeviceState, EngineEvent},
    routing::{self, DeviceAssignment},
    rules::RoutingContext,
    transport::TransportSink,
    LedRouterError, Result,
};

/// A frame ready to be sent to one device.
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub device_id: String,
    pub frame: Arc<LedFrame>,
    /// True for the single black frame sent by [`IdlePolicy::Blank`].
    pub blank: bool,
}

#[derive(Debug, Default)]
struct DeviceTracker {
    state: DeviceState,
    assignment: Option<DeviceAssignment>,
    conflict: Option<(String, String)>,
    blanked: bool,
    in_flight: Option<JoinHandle<()>>,
}

impl DeviceTracker {
    fn busy(&self) -> bool {
        self.in_flight
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

pub struct Dispatcher {
    engine: Engine,
    sink: Arc<dyn TransportSink>,
    trackers: HashMap<String, DeviceTracker>,
}

impl Dispatcher {
    pub fn new(engine: Engine, sink: Arc<dyn TransportSink>) -> Self {
        Self {
            engine,
            sink,
            trackers: HashMap::new(),
        }
    }

    /// Current state of a device; unknown devices are idle.
    pub fn state(&self, device_id: &str) -> DeviceState {
        self.trackers
            .get(device_id)
            .map(|tracker| tracker.state)
            .unwrap_or_default()
    }

    pub fn assignment(&self, device_id: &str) -> Option<&DeviceAssignment> {
        self.trackers.get(device_id)?.assignment.as_ref()
    }

    /// The synchronous half of a tick: routing, compositing, state tracking
    /// and events. Returns what should be sent.
    pub fn plan(&mut self, now: Instant) -> Result<Vec<Outgoing>> {
        let context = self.engine.routing_context()?;
        let rules = self.engine.rules()?;
        let config = self.engine.config()?;
        let threshold = config.staleness_threshold();

        let mut assignments: HashMap<String, DeviceAssignment> =
            routing::route_with_rules(&context, &rules)
                .into_iter()
                .map(|assignment| (assignment.device_id.clone(), assignment))
                .collect();

        self.retire_removed_devices(&context)?;

        let mut outgoing = Vec::new();
        for device in &context.devices {
            let device_id = device.device_id.as_str();
            let assignment = assignments.remove(device_id);
            let blend = self.engine.blend_for(device_id)?;

            let layers = match &assignment {
                Some(assignment) => self.collect_layers(assignment, &context, now, threshold)?,
                None => Vec::new(),
            };
            let composite = self.engine.compositor().composite(&layers, blend);

            let tracker = self.trackers.entry(device_id.to_string()).or_default();
            if tracker.assignment != assignment {
                tracing::info!(
                    device_id,
                    primary = ?assignment.as_ref().map(|a| a.primary.to_string()),
                    overlays = assignment.as_ref().map(|a| a.overlays.len()).unwrap_or(0),
                    "assignment changed"
                );
                self.engine.events().emit(EngineEvent::AssignmentChanged {
                    device_id: device_id.to_string(),
                    assignment: assignment.clone(),
                });
                tracker.assignment = assignment;
            }

            let next_state = match (&tracker.assignment, &composite) {
                (None, _) => DeviceState::Idle,
                (Some(_), None) => DeviceState::Assigned,
                (Some(_), Some(composite)) => match &composite.kind {
                    CompositeKind::Passthrough => DeviceState::Assigned,
                    CompositeKind::Blended { .. } => DeviceState::Compositing,
                    CompositeKind::Fallback { .. } => DeviceState::Fallback,
                },
            };

            match composite.as_ref().map(|c| &c.kind) {
                Some(CompositeKind::Fallback { conflict }) => {
                    let pair = (conflict.module_a.clone(), conflict.module_b.clone());
                    if tracker.conflict.as_ref() != Some(&pair) {
                        tracing::warn!(
                            device_id,
                            module_a = %conflict.module_a,
                            module_b = %conflict.module_b,
                            reason = %conflict.reason,
                            "incompatible producers, showing most recent frame"
                        );
                        self.engine.events().emit(EngineEvent::CompatibilityWarning {
                            device_id: device_id.to_string(),
                            module_a: conflict.module_a.clone(),
                            module_b: conflict.module_b.clone(),
                            reason: conflict.reason.clone(),
                        });
                        tracker.conflict = Some(pair);
                    }
                }
                _ => tracker.conflict = None,
            }

            if next_state != tracker.state {
                tracing::info!(
                    device_id,
                    from = %tracker.state,
                    to = %next_state,
                    "device state changed"
                );
                self.engine.events().emit(EngineEvent::StateChanged {
                    device_id: device_id.to_string(),
                    from: tracker.state,
                    to: next_state,
                });
                tracker.state = next_state;
            }

            match composite {
                Some(composite) => {
                    tracker.blanked = false;
                    outgoing.push(Outgoing {
                        device_id: device_id.to_string(),
                        frame: composite.frame,
                        blank: false,
                    });
                }
                None if config.idle_policy == IdlePolicy::Blank && !tracker.blanked => {
                    outgoing.push(Outgoing {
                        device_id: device_id.to_string(),
                        frame: Arc::new(LedFrame::at(
                            COMPOSITE_MODULE_ID,
                            device_id,
                            VisualizationMode::FullStripWave,
                            Rgb::blank(device.pixel_count),
                            now,
                        )),
                        blank: true,
                    });
                }
                None => {}
            }
        }

        Ok(outgoing)
    }

    /// Plans a tick and starts one send task per ready device. Must run
    /// inside a Tokio runtime. Returns the number of sends started.
    pub fn tick(&mut self, now: Instant) -> Result<usize> {
        let outgoing = self.plan(now)?;
        let mut started = 0;
        for Outgoing {
            device_id,
            frame,
            blank,
        } in outgoing
        {
            let Some(tracker) = self.trackers.get_mut(&device_id) else {
                continue;
            };
            if tracker.busy() {
                tracing::debug!(
                    device_id = %device_id,
                    "previous send still in flight, skipping tick"
                );
                continue;
            }
            if blank {
                tracker.blanked = true;
            }

            let sink = Arc::clone(&self.sink);
            let events = self.engine.events().clone();
            tracker.in_flight = Some(tokio::spawn(async move {
                if let Err(error) = sink.send(&device_id, frame).await {
                    tracing::warn!(device_id = %device_id, error = %error, "dispatch failed");
                    events.emit(EngineEvent::DispatchError { device_id, error });
                }
            }));
            started += 1;
        }
        Ok(started)
    }

    /// Waits for every send that is still running.
    pub async fn flush(&mut self) {
        for tracker in self.trackers.values_mut() {
            if let Some(handle) = tracker.in_flight.take() {
                if let Err(err) = handle.await {
                    tracing::warn!(error = %err, "send task failed");
                }
            }
        }
    }

    fn collect_layers(
        &self,
        assignment: &DeviceAssignment,
        context: &RoutingContext,
        now: Instant,
        threshold: Duration,
    ) -> Result<Vec<Layer>> {
        let Some(mailbox) = self.engine.frames().existing(&assignment.device_id)? else {
            return Ok(Vec::new());
        };

        let mut layers = Vec::new();
        for producer in assignment.producers() {
            let Some(slot) = mailbox.fresh(&producer.module_id, now, threshold)? else {
                continue;
            };
            let priority = context
                .module(&producer.module_id)
                .and_then(|module| module.capability.output(producer.mode))
                .map(|output| output.priority)
                .unwrap_or_default();
            layers.push(Layer::new(slot.frame, priority));
        }
        Ok(layers)
    }

    fn retire_removed_devices(&mut self, context: &RoutingContext) -> Result<()> {
        let live: HashSet<&str> = context.devices.iter().map(|d| d.device_id.as_str()).collect();
        let removed: Vec<String> = self
            .trackers
            .keys()
            .filter(|id| !live.contains(id.as_str()))
            .cloned()
            .collect();

        for device_id in removed {
            let Some(tracker) = self.trackers.remove(&device_id) else {
                continue;
            };
            tracing::info!(device_id = %device_id, "device removed from registry");
            if tracker.assignment.is_some() {
                self.engine.events().emit(EngineEvent::AssignmentChanged {
                    device_id: device_id.clone(),
                    assignment: None,
                });
            }
            self.engine.events().emit(EngineEvent::StateChanged {
                device_id: device_id.clone(),
                from: tracker.state,
                to: DeviceState::Removed,
            });
            self.engine.frames().purge_device(&device_id)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("devices", &self.trackers.len())
            .finish()
    }
}

#[derive(Debug)]
enum DispatchCommand {
    Shutdown,
}

/// Running dispatch loop.
#[derive(Debug)]
pub struct DispatchHandle {
    commands: mpsc::Sender<DispatchCommand>,
    task: JoinHandle<()>,
}

impl DispatchHandle {
    /// Stops the loop after waiting for in-flight sends.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.commands.send(DispatchCommand::Shutdown).await;
        self.task
            .await
            .map_err(|err| LedRouterError::msg(format!("dispatch loop failed: {err}")))
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Starts the background loop ticking at the configured rate. Configuration
/// changes to the tick rate take effect on the following tick.
pub fn spawn_dispatch_loop(engine: Engine, sink: Arc<dyn TransportSink>) -> Result<DispatchHandle> {
    let mut period = engine.config()?.tick_period();
    let (commands, mut command_rx) = mpsc::channel::<DispatchCommand>(4);
    let mut dispatcher = Dispatcher::new(engine.clone(), sink);

    let task = tokio::spawn(async move {
        let mut interval = ticker(period);
        tracing::info!(period_ms = period.as_secs_f64() * 1000.0, "dispatch loop started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = dispatcher.tick(Instant::now()) {
                        tracing::warn!(error = %err, "dispatch tick failed");
                    }
                    match engine.config() {
                        Ok(config) if config.tick_period() != period => {
                            period = config.tick_period();
                            interval = ticker(period);
                            tracing::info!(tick_rate_hz = config.tick_rate_hz, "tick rate changed");
                        }
                        Ok(_) => {}
                        Err(err) => tracing::warn!(error = %err, "could not read engine config"),
                    }
                }
                command = command_rx.recv() => {
                    match command {
                        Some(DispatchCommand::Shutdown) | None => break,
                    }
                }
            }
        }

        dispatcher.flush().await;
        tracing::info!("dispatch loop stopped");
    });

    Ok(DispatchHandle { commands, task })
}

fn ticker(period: Duration) -> time::Interval {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
    interval
}

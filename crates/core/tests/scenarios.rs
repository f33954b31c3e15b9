use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use led_router_core::{
    composite, BlendMode, CompositeKind, DeviceCapabilities, DimensionPreference, Dispatcher,
    Engine, EngineEvent, Layer, LedFrame, LedRouterError, MemorySink,
    ModuleVisualizationCapability, Producer, Rgb, StaticDeviceRegistry, VisualizationMode::*,
    VisualizationOutput,
};
use pretty_assertions::assert_eq;

fn engine_with(devices: Vec<DeviceCapabilities>) -> Engine {
    let registry = StaticDeviceRegistry::with_devices(devices).expect("devices are valid");
    Engine::new(Arc::new(registry)).expect("default config is valid")
}

#[test]
fn two_waves_screen_to_magenta() {
    let engine = engine_with(vec![
        DeviceCapabilities::strip("Strip-A", 90).with_supported([FullStripWave]),
    ]);
    for module in ["ModuleX", "ModuleY"] {
        engine
            .register_capability(ModuleVisualizationCapability::new(module).with_output(
                VisualizationOutput::new(FullStripWave, DimensionPreference::OneD).overlay(),
            ))
            .unwrap();
    }

    let now = Instant::now();
    for (module, color) in [("ModuleX", Rgb::new(255, 0, 0)), ("ModuleY", Rgb::new(0, 0, 255))] {
        engine
            .submit_frame_at(LedFrame::solid(module, "Strip-A", FullStripWave, color, 90), now)
            .unwrap();
    }

    let mut dispatcher = Dispatcher::new(engine.clone(), Arc::new(MemorySink::new()));
    let out = dispatcher.plan(now).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].frame.len(), 90);
    assert!(out[0].frame.pixels.iter().all(|p| *p == Rgb::new(255, 0, 255)));
}

#[test]
fn mismatched_note_counts_fall_back_to_latest() {
    let now = Instant::now();
    let piano = Layer::new(
        Arc::new(LedFrame::at("Piano", "Grid-B", NotePerLed, vec![Rgb::WHITE; 88], now)),
        1,
    );
    let guitar = Layer::new(
        Arc::new(LedFrame::at(
            "Guitar",
            "Grid-B",
            NotePerLed,
            vec![Rgb::new(0, 255, 0); 150],
            now + Duration::from_millis(10),
        )),
        1,
    );

    let out = composite(&[piano, guitar.clone()], BlendMode::Screen).unwrap();
    assert!(Arc::ptr_eq(&out.frame, &guitar.frame));
    let CompositeKind::Fallback { conflict } = out.kind else {
        panic!("expected fallback");
    };
    let mut named = [conflict.module_a, conflict.module_b];
    named.sort();
    assert_eq!(named, ["Guitar".to_string(), "Piano".to_string()]);
}

#[test]
fn incompatible_producers_emit_warning_through_engine() {
    let engine = engine_with(vec![DeviceCapabilities::matrix("Grid-B", 8, 11, false)]);
    let mut events = engine.subscribe();
    engine
        .register_capability(ModuleVisualizationCapability::new("Piano").with_output(
            VisualizationOutput::new(NotePerLed, DimensionPreference::Either)
                .priority(2)
                .overlay(),
        ))
        .unwrap();
    engine
        .register_capability(ModuleVisualizationCapability::new("Grid").with_output(
            VisualizationOutput::new(GridPattern, DimensionPreference::TwoD)
                .priority(1)
                .overlay(),
        ))
        .unwrap();

    let now = Instant::now();
    let piano = LedFrame::at("Piano", "Grid-B", NotePerLed, vec![Rgb::WHITE; 88], now);
    engine.submit_frame_at(piano, now).unwrap();
    let latest = LedFrame::at(
        "Grid",
        "Grid-B",
        GridPattern,
        vec![Rgb::new(1, 2, 3); 88],
        now + Duration::from_millis(1),
    );
    engine.submit_frame_at(latest.clone(), now).unwrap();

    let mut dispatcher = Dispatcher::new(engine.clone(), Arc::new(MemorySink::new()));
    let out = dispatcher.plan(now).unwrap();
    assert_eq!(*out[0].frame, latest);

    let mut warned = false;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::CompatibilityWarning { module_a, module_b, .. } = event {
            assert_eq!((module_a.as_str(), module_b.as_str()), ("Piano", "Grid"));
            warned = true;
        }
    }
    assert!(warned);
}

#[test]
fn grid_routing_prefers_pattern_with_flash_overlay() {
    let engine = engine_with(vec![
        DeviceCapabilities::matrix("Grid-B", 8, 8, true).with_supported([GridPattern, BeatFlash]),
    ]);
    engine
        .register_capability(ModuleVisualizationCapability::new("ModuleA").with_output(
            VisualizationOutput::new(GridPattern, DimensionPreference::TwoD).priority(10),
        ))
        .unwrap();
    engine
        .register_capability(ModuleVisualizationCapability::new("ModuleB").with_output(
            VisualizationOutput::new(BeatFlash, DimensionPreference::Either)
                .priority(5)
                .overlay(),
        ))
        .unwrap();

    let assignments = engine.route().unwrap();
    assert_eq!(assignments.len(), 1);
    assert_eq!(assignments[0].primary, Producer::new("ModuleA", GridPattern));
    assert_eq!(assignments[0].overlays, vec![Producer::new("ModuleB", BeatFlash)]);
    assert_eq!(engine.route().unwrap(), assignments);
}

#[test]
fn short_frame_is_rejected_without_disturbing_slot() {
    let engine = engine_with(vec![DeviceCapabilities::strip("Strip-A", 90)]);
    engine
        .register_capability(ModuleVisualizationCapability::new("ModuleX").with_output(
            VisualizationOutput::new(FullStripWave, DimensionPreference::OneD),
        ))
        .unwrap();

    let now = Instant::now();
    let err = engine
        .submit_frame_at(LedFrame::solid("ModuleX", "Strip-A", FullStripWave, Rgb::WHITE, 80), now)
        .unwrap_err();
    assert!(matches!(err, LedRouterError::MalformedFrame { .. }));

    let mut dispatcher = Dispatcher::new(engine.clone(), Arc::new(MemorySink::new()));
    assert!(dispatcher.plan(now).unwrap().is_empty());
}

#[test]
fn unregistered_module_never_reappears() {
    let engine = engine_with(vec![DeviceCapabilities::strip("Strip-A", 10)]);
    for module in ["keep", "gone"] {
        engine
            .register_capability(ModuleVisualizationCapability::new(module).with_output(
                VisualizationOutput::new(BeatFlash, DimensionPreference::Either).overlay(),
            ))
            .unwrap();
    }
    let now = Instant::now();
    engine
        .submit_frame_at(LedFrame::solid("keep", "Strip-A", BeatFlash, Rgb::new(5, 5, 5), 10), now)
        .unwrap();
    let doomed = LedFrame::solid("gone", "Strip-A", BeatFlash, Rgb::new(200, 0, 0), 10);
    engine.submit_frame_at(doomed, now).unwrap();

    engine.unregister_capability("gone").unwrap();
    engine.clear_frame("gone", "Strip-A").unwrap();

    assert!(engine.route().unwrap().iter().all(|a| !a.involves("gone")));
    let mut dispatcher = Dispatcher::new(engine.clone(), Arc::new(MemorySink::new()));
    let out = dispatcher.plan(now).unwrap();
    assert_eq!(out[0].frame.module_id, "keep");
    assert_eq!(out[0].frame.pixels[0], Rgb::new(5, 5, 5));
}

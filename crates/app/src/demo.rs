//! Synthetic producers standing in for real creative modules.

use std::{f32::consts::TAU, time::Duration};

use led_router_core::{
    DeviceCapabilities, Engine, LedFrame, ModuleVisualizationCapability, Rgb, VisualizationMode,
};
use tokio::{sync::watch, task::JoinHandle, time};

const FRAME_INTERVAL: Duration = Duration::from_millis(25);
const BEAT_SECONDS: f32 = 0.5;

/// Pixel buffer for one device at time `t` (seconds).
pub fn render(
    mode: VisualizationMode,
    device: &DeviceCapabilities,
    t: f32,
    color: Rgb,
) -> Vec<Rgb> {
    let len = device.pixel_count;
    match mode {
        VisualizationMode::FullStripWave => (0..len)
            .map(|i| {
                let phase = i as f32 / len as f32 * TAU - t * 3.0;
                scale(color, 0.5 + 0.5 * phase.sin())
            })
            .collect(),
        VisualizationMode::BeatFlash => {
            let decay = 1.0 - (t % BEAT_SECONDS) / BEAT_SECONDS;
            vec![scale(Rgb::WHITE, decay * decay); len]
        }
        VisualizationMode::NotePerLed => {
            let lit = (t * 8.0) as usize % len;
            (0..len)
                .map(|i| if i == lit { color } else { Rgb::BLACK })
                .collect()
        }
        VisualizationMode::GridPattern => {
            let mut pixels = Rgb::blank(len);
            let flip = (t / BEAT_SECONDS) as u32 % 2;
            match &device.grid {
                Some(grid) => {
                    for y in 0..grid.height {
                        for x in 0..grid.width {
                            if (x + y + flip) % 2 == 0 {
                                if let Some(index) = grid.index_of(x, y) {
                                    pixels[index] = color;
                                }
                            }
                        }
                    }
                }
                None => {
                    for (i, pixel) in pixels.iter_mut().enumerate() {
                        if (i as u32 + flip) % 2 == 0 {
                            *pixel = color;
                        }
                    }
                }
            }
            pixels
        }
    }
}

fn scale(color: Rgb, amount: f32) -> Rgb {
    let amount = amount.clamp(0.0, 1.0);
    let channel = |c: u8| (c as f32 * amount).round() as u8;
    Rgb::new(channel(color.r), channel(color.g), channel(color.b))
}

/// Stable colour per module so overlapping producers stay distinguishable.
pub fn module_color(module_id: &str) -> Rgb {
    const PALETTE: [Rgb; 6] = [
        Rgb::new(255, 0, 0),
        Rgb::new(0, 0, 255),
        Rgb::new(0, 255, 0),
        Rgb::new(255, 128, 0),
        Rgb::new(160, 0, 255),
        Rgb::new(0, 200, 200),
    ];
    let hash = module_id
        .bytes()
        .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
    PALETTE[hash % PALETTE.len()]
}

/// Registers `capability` and, until `shutdown` flips, submits a frame for
/// every device routing currently feeds from it, in the mode it was routed
/// with. Unregisters on the way out.
pub fn spawn_producer(
    engine: Engine,
    devices: Vec<DeviceCapabilities>,
    capability: ModuleVisualizationCapability,
    mut shutdown: watch::Receiver<bool>,
) -> led_router_core::Result<JoinHandle<()>> {
    let module_id = capability.module_id.clone();
    engine.register_capability(capability)?;
    let color = module_color(&module_id);

    Ok(tokio::spawn(async move {
        let start = time::Instant::now();
        let mut interval = time::interval(FRAME_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let t = start.elapsed().as_secs_f32();
                    for (device, mode) in routed_targets(&engine, &devices, &module_id) {
                        let frame = LedFrame::new(
                            module_id.as_str(),
                            device.device_id.as_str(),
                            mode,
                            render(mode, device, t, color),
                        );
                        if let Err(err) = engine.submit_frame(frame) {
                            tracing::debug!(
                                module_id = %module_id,
                                error = %err,
                                "demo frame rejected"
                            );
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        if let Err(err) = engine.unregister_capability(&module_id) {
            tracing::warn!(
                module_id = %module_id,
                error = %err,
                "could not unregister demo module"
            );
        }
    }))
}

/// Devices currently fed by `module_id`, with the mode each one was routed.
fn routed_targets<'a>(
    engine: &Engine,
    devices: &'a [DeviceCapabilities],
    module_id: &str,
) -> Vec<(&'a DeviceCapabilities, VisualizationMode)> {
    let assignments = match engine.route() {
        Ok(assignments) => assignments,
        Err(err) => {
            tracing::debug!(module_id, error = %err, "demo routing lookup failed");
            return Vec::new();
        }
    };
    assignments
        .iter()
        .filter_map(|assignment| {
            let producer = assignment
                .producers()
                .find(|producer| producer.module_id == module_id)?;
            let device = devices
                .iter()
                .find(|device| device.device_id == assignment.device_id)?;
            Some((device, producer.mode))
        })
        .collect()
}

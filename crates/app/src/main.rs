mod demo;
mod udp;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::{Parser, Subcommand};
use led_router_core::{
    spawn_dispatch_loop, AppConfig, DeviceRegistry, Engine, EngineEvent, LedRouterError, LogSink,
    RoutingOverrides, StaticDeviceRegistry, TransportSink,
};
use tokio::sync::{broadcast, watch};
use tracing_subscriber::EnvFilter;

use crate::udp::UdpSink;

#[tokio::main]
async fn main() -> led_router_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            seconds,
            dry_run,
        } => run(&config, seconds, dry_run).await,
        Commands::Route { config, focus, pin } => print_routes(&config, focus, pin),
    }
}

fn build_engine(config: &AppConfig) -> led_router_core::Result<Engine> {
    let devices = StaticDeviceRegistry::with_devices(config.devices.iter().cloned())?;
    Engine::builder(Arc::new(devices))
        .config(config.engine.clone())
        .build()
}

async fn run(path: &Path, seconds: Option<u64>, dry_run: bool) -> led_router_core::Result<()> {
    let config = AppConfig::load(path)?;
    tracing::info!(
        ?path,
        devices = config.devices.len(),
        modules = config.modules.len(),
        tick_rate_hz = config.engine.tick_rate_hz,
        "starting router"
    );

    let engine = build_engine(&config)?;
    let sink: Arc<dyn TransportSink> = if dry_run || config.outputs.is_empty() {
        Arc::new(LogSink)
    } else {
        Arc::new(UdpSink::bind(&config.outputs, 2).await?)
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    let devices = engine.devices().snapshot()?;
    let mut producers = Vec::new();
    for capability in &config.modules {
        producers.push(demo::spawn_producer(
            engine.clone(),
            devices.clone(),
            capability.clone(),
            stop_rx.clone(),
        )?);
    }

    let events = tokio::spawn(log_events(engine.subscribe()));
    let dispatch = spawn_dispatch_loop(engine.clone(), sink)?;

    match seconds {
        Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
        None => tokio::signal::ctrl_c().await?,
    }

    tracing::info!("shutting down");
    let _ = stop_tx.send(true);
    for producer in producers {
        producer
            .await
            .map_err(|err| LedRouterError::msg(format!("producer task failed: {err}")))?;
    }
    dispatch.shutdown().await?;
    events.abort();
    Ok(())
}

fn print_routes(
    path: &Path,
    focus: Option<String>,
    pins: Vec<String>,
) -> led_router_core::Result<()> {
    let config = AppConfig::load(path)?;
    let engine = build_engine(&config)?;
    for capability in &config.modules {
        engine.register_capability(capability.clone())?;
    }

    let mut overrides = RoutingOverrides::default();
    for pin in pins {
        let (device, module) = pin.split_once('=').ok_or_else(|| {
            LedRouterError::msg(format!("pin `{pin}` must look like device=module"))
        })?;
        overrides.pins.insert(device.to_string(), module.to_string());
    }
    engine.set_overrides(overrides)?;
    engine.set_focused_module(focus)?;

    let assignments = engine.route()?;
    println!("{}", serde_json::to_string_pretty(&assignments)?);
    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<EngineEvent>) {
    loop {
        match events.recv().await {
            Ok(EngineEvent::CompatibilityWarning {
                device_id,
                module_a,
                module_b,
                reason,
            }) => {
                tracing::warn!(%device_id, %module_a, %module_b, %reason, "compatibility warning")
            }
            Ok(EngineEvent::DispatchError { device_id, error }) => {
                tracing::warn!(%device_id, %error, "dispatch error")
            }
            Ok(event) => tracing::debug!(?event, "engine event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "event log lagging")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Routes and composites module visuals onto shared LED hardware",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the dispatch loop with demo producers for every configured module.
    Run {
        /// JSON configuration with engine settings, devices, modules and outputs.
        #[arg(short, long)]
        config: PathBuf,
        /// Stop after this many seconds instead of waiting for Ctrl-C.
        #[arg(short, long)]
        seconds: Option<u64>,
        /// Log frames instead of sending them over UDP.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the routing assignments for a configuration as JSON.
    Route {
        #[arg(short, long)]
        config: PathBuf,
        /// Module treated as focused while routing.
        #[arg(short, long)]
        focus: Option<String>,
        /// Pin a device to a module, as `device=module`. Repeatable.
        #[arg(long)]
        pin: Vec<String>,
    },
}

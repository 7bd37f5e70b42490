//! HTTP server for the pan mount.
//!
//! Opens the Tic (or a simulated stepper with `--mock`), applies the drive
//! settings and serves the control API.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use hardware::mock::{MockStepper, MotionModel};
use hardware::stepper::StepperDriver;
use hardware::tic::Tic;
use pan_mount::config::{DeviceArgs, MountArgs};
use pan_mount::coordinator::MotionCoordinator;
use pan_mount::presets::PresetStore;
use pan_mount::server::{run_server, AppState, ServerArgs};
use pan_mount::tour::TourController;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "HTTP server for the motorized pan mount")]
struct Args {
    #[command(flatten)]
    device: DeviceArgs,

    #[command(flatten)]
    mount: MountArgs,

    #[command(flatten)]
    server: ServerArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let presets = PresetStore::new(&args.mount.presets);
    presets
        .ensure_exists()
        .with_context(|| format!("Failed to create {}", args.mount.presets.display()))?;

    let motion = args.mount.motion_config()?;
    let coordinator = if args.device.mock {
        info!("Using simulated stepper");
        MotionCoordinator::with_driver(
            MockStepper::new().with_motion(MotionModel::Stepping(200)),
            presets,
            motion,
        )
    } else {
        let device = args.device.clone();
        info!("Using Tic {} on {}", device.product, device.port);
        MotionCoordinator::new(
            move || {
                Tic::open(&device.port, device.baud, device.product)
                    .map(|tic| Box::new(tic) as Box<dyn StepperDriver>)
            },
            presets,
            motion,
        )
    };
    let coordinator = Arc::new(coordinator);

    coordinator
        .initialize()
        .context("Failed to initialize stepper")?;

    let tour = TourController::new(Arc::clone(&coordinator), args.mount.tour_config())?;
    let state = AppState {
        coordinator,
        tour: Arc::new(tour),
    };

    run_server(state, args.server).await
}

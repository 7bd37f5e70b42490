//! Command-line tool for driving a Pololu Tic directly.
//!
//! Subcommands:
//! - `status`: Dump the controller's variable block
//! - `energize` / `deenergize`: Motor power
//! - `configure`: Exit safe start and apply current limit, step mode and ramps
//! - `move`: Move to an absolute position, optionally waiting for arrival
//! - `jog`: Run at a constant velocity (0 stops)
//! - `zero`: Halt and declare the current position 0

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hardware::stepper::{StepMode, StepperDriver};
use hardware::tic::{Tic, TicProduct, DEFAULT_BAUD};
use tracing::info;

/// Default serial device of the Tic's USB command port
const DEFAULT_PORT: &str = "/dev/ttyACM0";

/// Pololu Tic control tool
#[derive(Parser, Debug)]
#[command(name = "tic_tool")]
#[command(about = "Query and drive a Pololu Tic stepper controller")]
#[command(version)]
struct Args {
    /// Serial port of the Tic
    #[arg(long, global = true, default_value = DEFAULT_PORT)]
    port: String,

    /// Serial baud rate
    #[arg(long, global = true, default_value_t = DEFAULT_BAUD)]
    baud: u32,

    /// Tic model (sets current-limit encoding)
    #[arg(long, global = true, value_enum, default_value = "t825")]
    product: TicProduct,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the controller status
    Status,

    /// Enable motor current
    Energize,

    /// Disable motor current
    Deenergize,

    /// Exit safe start and apply drive settings
    Configure {
        /// Current limit in mA
        #[arg(long, default_value = "1000")]
        current_limit: u32,

        /// Microstepping mode
        #[arg(long, value_enum, default_value = "half")]
        step_mode: StepMode,

        /// Max acceleration (microsteps per 100 s²)
        #[arg(long)]
        accel: Option<u32>,

        /// Max deceleration (microsteps per 100 s²)
        #[arg(long)]
        decel: Option<u32>,
    },

    /// Move to an absolute position
    Move {
        /// Target position in microsteps
        #[arg(allow_hyphen_values = true)]
        position: i32,

        /// Arrival tolerance in microsteps
        #[arg(long, default_value = "2")]
        tolerance: u32,

        /// Timeout in seconds for motion to complete
        #[arg(short, long, default_value = "20")]
        timeout: u64,

        /// Don't wait for motion to complete
        #[arg(long)]
        no_wait: bool,
    },

    /// Run at a constant velocity (microsteps per 10,000 s)
    Jog {
        #[arg(allow_hyphen_values = true)]
        velocity: i32,
    },

    /// Halt and set the current position to zero
    Zero,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    info!("Connecting to Tic on {}...", args.port);
    let mut tic = Tic::open(&args.port, args.baud, args.product)
        .with_context(|| format!("Failed to open Tic on {}", args.port))?;

    match args.command {
        Command::Status => cmd_status(&mut tic),
        Command::Energize => {
            tic.energize()?;
            info!("Energized");
            Ok(())
        }
        Command::Deenergize => {
            tic.deenergize()?;
            info!("De-energized");
            Ok(())
        }
        Command::Configure {
            current_limit,
            step_mode,
            accel,
            decel,
        } => cmd_configure(&mut tic, current_limit, step_mode, accel, decel),
        Command::Move {
            position,
            tolerance,
            timeout,
            no_wait,
        } => cmd_move(&mut tic, position, tolerance, timeout, no_wait),
        Command::Jog { velocity } => {
            tic.exit_safe_start()?;
            tic.set_target_velocity(velocity)?;
            info!("Target velocity set to {}", velocity);
            Ok(())
        }
        Command::Zero => {
            tic.halt_and_set_position(0)?;
            info!("Position reset to 0");
            Ok(())
        }
    }
}

fn cmd_status(tic: &mut Tic) -> Result<()> {
    let status = tic.status()?;

    info!("Product:          {}", tic.product());
    info!("Operation state:  {}", status.operation_state);
    info!("Error status:     0x{:04X}", status.error_status);
    info!("Current position: {}", status.current_position);
    info!("Target position:  {}", status.target_position);
    info!("Current velocity: {}", status.current_velocity);
    info!(
        "Max accel/decel:  {} / {}",
        status.max_accel, status.max_decel
    );
    info!("VIN:              {:.2} V", status.vin_mv as f64 / 1000.0);
    Ok(())
}

fn cmd_configure(
    tic: &mut Tic,
    current_limit: u32,
    step_mode: StepMode,
    accel: Option<u32>,
    decel: Option<u32>,
) -> Result<()> {
    tic.exit_safe_start()?;

    tic.set_current_limit(current_limit)?;
    info!(
        "Current limit: {} mA (programmed {} mA)",
        current_limit,
        tic.product()
            .current_limit_ma(tic.product().current_limit_code(current_limit))
    );

    tic.set_step_mode(step_mode)?;
    info!("Step mode: {}", step_mode);

    if let Some(accel) = accel {
        tic.set_max_accel(accel)?;
        info!("Max accel: {}", accel);
    }
    if let Some(decel) = decel {
        tic.set_max_decel(decel)?;
        info!("Max decel: {}", decel);
    }

    Ok(())
}

fn cmd_move(
    tic: &mut Tic,
    position: i32,
    tolerance: u32,
    timeout: u64,
    no_wait: bool,
) -> Result<()> {
    let start_pos = tic.get_current_position()?;
    info!("Current position: {}", start_pos);

    tic.exit_safe_start()?;
    tic.energize()?;

    info!("Moving to {}...", position);
    tic.set_target_position(position)?;

    if no_wait {
        info!("Motion command sent (not waiting for completion)");
        return Ok(());
    }

    let timeout_dur = Duration::from_secs(timeout);
    info!("Waiting for motion to complete (timeout: {}s)...", timeout);

    let start = Instant::now();
    loop {
        let current = tic.get_current_position()?;
        if current.abs_diff(position) <= tolerance {
            info!(
                "Motion complete! Final position: {} (error: {})",
                current,
                i64::from(current) - i64::from(position)
            );
            return Ok(());
        }

        if start.elapsed() > timeout_dur {
            bail!("Timeout waiting for motion to complete (at {current})");
        }

        std::thread::sleep(Duration::from_millis(50));
    }
}

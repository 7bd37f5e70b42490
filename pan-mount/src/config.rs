//! Runtime configuration for the pan mount.
//!
//! Defaults match the mount as built: a Tic T825 driving the pan axis at
//! half stepping, 1 A coil current and gentle ramps.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use hardware::stepper::StepMode;
use hardware::tic::{TicProduct, DEFAULT_BAUD};

use crate::convergence::ConvergenceParams;
use crate::error::{MountError, MountResult};

/// Pan velocity magnitude (microsteps per 10,000 s).
pub const DEFAULT_PAN_SPEED: i32 = 25_000;
pub const DEFAULT_CURRENT_LIMIT_MA: u32 = 1000;
/// Max acceleration and deceleration (microsteps per 100 s²).
pub const DEFAULT_ACCEL: u32 = 3000;

pub const DEFAULT_TOUR_DELAY_S: f64 = 10.0;
pub const MIN_TOUR_DELAY_S: f64 = 1.0;
pub const MAX_TOUR_DELAY_S: f64 = 20.0;
/// Pause between commanding a tour stop and re-asserting it.
pub const DEFAULT_SETTLE: Duration = Duration::from_secs(1);

/// Settings applied to the stepper when it is first opened, plus the pan speed.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionConfig {
    pub pan_speed: i32,
    pub current_limit_ma: u32,
    pub step_mode: StepMode,
    pub max_accel: u32,
    pub max_decel: u32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            pan_speed: DEFAULT_PAN_SPEED,
            current_limit_ma: DEFAULT_CURRENT_LIMIT_MA,
            step_mode: StepMode::Half,
            max_accel: DEFAULT_ACCEL,
            max_decel: DEFAULT_ACCEL,
        }
    }
}

impl MotionConfig {
    /// Check that the pan speed is a positive magnitude.
    pub fn validate(&self) -> MountResult<()> {
        if self.pan_speed <= 0 {
            return Err(MountError::InvalidConfig(format!(
                "pan speed must be positive, got {}",
                self.pan_speed
            )));
        }
        Ok(())
    }
}

/// Timing of the preset tour.
#[derive(Debug, Clone, PartialEq)]
pub struct TourConfig {
    /// Dwell at each stop before the first `set_tour_delay`.
    pub initial_delay_s: f64,
    pub min_delay_s: f64,
    pub max_delay_s: f64,
    pub settle: Duration,
    pub convergence: ConvergenceParams,
}

impl Default for TourConfig {
    fn default() -> Self {
        Self {
            initial_delay_s: DEFAULT_TOUR_DELAY_S,
            min_delay_s: MIN_TOUR_DELAY_S,
            max_delay_s: MAX_TOUR_DELAY_S,
            settle: DEFAULT_SETTLE,
            convergence: ConvergenceParams::default(),
        }
    }
}

impl TourConfig {
    /// Check that the delay bounds form a usable range.
    pub fn validate(&self) -> MountResult<()> {
        let bounds = [self.initial_delay_s, self.min_delay_s, self.max_delay_s];
        if bounds.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(MountError::InvalidConfig(format!(
                "tour delays must be finite and non-negative, got {bounds:?}"
            )));
        }
        if self.min_delay_s > self.max_delay_s {
            return Err(MountError::InvalidConfig(format!(
                "min tour delay {} exceeds max {}",
                self.min_delay_s, self.max_delay_s
            )));
        }
        Ok(())
    }

    /// Clamp a requested dwell into `[min_delay_s, max_delay_s]`.
    pub fn clamp_delay(&self, seconds: f64) -> f64 {
        seconds.max(self.min_delay_s).min(self.max_delay_s)
    }
}

/// Serial connection to the Tic.
#[derive(Args, Debug, Clone)]
pub struct DeviceArgs {
    /// Serial port of the Tic
    #[arg(long, default_value = "/dev/ttyACM0")]
    pub port: String,

    /// Serial baud rate
    #[arg(long, default_value_t = DEFAULT_BAUD)]
    pub baud: u32,

    /// Tic model (sets current-limit encoding)
    #[arg(long, value_enum, default_value = "t825")]
    pub product: TicProduct,

    /// Run against a simulated stepper instead of hardware
    #[arg(long, default_value_t = false)]
    pub mock: bool,
}

/// Motion and tour settings.
#[derive(Args, Debug, Clone)]
pub struct MountArgs {
    /// Pan velocity magnitude (microsteps per 10,000 s)
    #[arg(
        long,
        default_value_t = DEFAULT_PAN_SPEED,
        value_parser = clap::value_parser!(i32).range(1..)
    )]
    pub pan_speed: i32,

    /// Coil current limit in mA
    #[arg(long, default_value_t = DEFAULT_CURRENT_LIMIT_MA)]
    pub current_limit: u32,

    /// Microstepping mode
    #[arg(long, value_enum, default_value = "half")]
    pub step_mode: StepMode,

    /// Max acceleration (microsteps per 100 s²)
    #[arg(long, default_value_t = DEFAULT_ACCEL)]
    pub max_accel: u32,

    /// Max deceleration (microsteps per 100 s²)
    #[arg(long, default_value_t = DEFAULT_ACCEL)]
    pub max_decel: u32,

    /// Initial dwell at each tour stop in seconds
    #[arg(long, default_value_t = DEFAULT_TOUR_DELAY_S)]
    pub tour_delay: f64,

    /// Preset file (created on first run)
    #[arg(long, default_value = "presets.json")]
    pub presets: PathBuf,
}

impl MountArgs {
    pub fn motion_config(&self) -> MountResult<MotionConfig> {
        let config = MotionConfig {
            pan_speed: self.pan_speed,
            current_limit_ma: self.current_limit,
            step_mode: self.step_mode,
            max_accel: self.max_accel,
            max_decel: self.max_decel,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn tour_config(&self) -> TourConfig {
        TourConfig {
            initial_delay_s: self.tour_delay,
            ..TourConfig::default()
        }
    }
}

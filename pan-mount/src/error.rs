//! Error types for the pan mount.

use hardware::stepper::StepperError;
use thiserror::Error;

use crate::presets::PresetError;

/// Errors returned by the motion coordinator and tour controller.
///
/// Device and preset-store failures are real failures and reach the caller.
/// Conditions with nothing to do (missing preset, empty tour) are not errors;
/// they are logged and reported through return values instead.
#[derive(Error, Debug)]
pub enum MountError {
    /// The stepper could not be opened or rejected a command.
    #[error("Stepper error: {0}")]
    Device(#[from] StepperError),

    /// The preset file could not be read or written.
    #[error("Preset store error: {0}")]
    Presets(#[from] PresetError),

    #[error("Invalid pan direction {0} (expected -1, 0 or 1)")]
    InvalidDirection(i32),

    #[error("Invalid tour delay: {0}")]
    InvalidDelay(f64),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The tour worker thread could not be spawned.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for pan mount operations.
pub type MountResult<T> = Result<T, MountError>;

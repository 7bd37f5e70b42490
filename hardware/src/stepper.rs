//! Stepper driver interface shared by the motion-control code.
//!
//! The pan mount only needs a narrow slice of what a stepper controller can do:
//! velocity and position targets, position readback, energize control and a
//! handful of one-time configuration commands. [`StepperDriver`] captures that
//! slice so the coordinator can run against real hardware or [`MockStepper`].
//!
//! [`MockStepper`]: crate::mock::MockStepper

use bitflags::bitflags;
use clap::ValueEnum;
use thiserror::Error;

/// Errors reported by stepper drivers.
#[derive(Error, Debug)]
pub enum StepperError {
    /// Low-level I/O error (serial read/write failure).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The device could not be opened.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// No complete response arrived within the port timeout.
    #[error("Timeout waiting for response")]
    Timeout,

    /// Response from the controller doesn't match the expected format.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// A command argument is outside what the controller accepts.
    #[error("Value out of range: {0}")]
    OutOfRange(String),

    /// The driver does not implement an optional command.
    #[error("Unsupported command: {0}")]
    Unsupported(&'static str),
}

/// Result type for stepper operations.
pub type StepperResult<T> = Result<T, StepperError>;

bitflags! {
    /// Optional features a driver may support.
    ///
    /// Probed once when the device is initialized; commands for missing
    /// capabilities are skipped instead of attempted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u8 {
        /// `set_max_accel` is available.
        const MAX_ACCEL = 0b0000_0001;
        /// `set_max_decel` is available.
        const MAX_DECEL = 0b0000_0010;
    }
}

impl Capabilities {
    /// True when both acceleration and deceleration limits can be applied.
    pub fn has_accel_limits(self) -> bool {
        self.contains(Capabilities::MAX_ACCEL | Capabilities::MAX_DECEL)
    }
}

/// Microstepping resolution.
///
/// Discriminants are the Tic "set step mode" codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, strum::EnumIter, strum::Display)]
#[repr(u8)]
pub enum StepMode {
    #[value(name = "full")]
    #[strum(to_string = "full")]
    Full = 0,
    #[value(name = "half")]
    #[strum(to_string = "1/2")]
    Half = 1,
    #[value(name = "quarter")]
    #[strum(to_string = "1/4")]
    Quarter = 2,
    #[value(name = "eighth")]
    #[strum(to_string = "1/8")]
    Eighth = 3,
    #[value(name = "sixteenth")]
    #[strum(to_string = "1/16")]
    Sixteenth = 4,
    #[value(name = "thirty-second")]
    #[strum(to_string = "1/32")]
    ThirtySecond = 5,
}

impl StepMode {
    /// Code sent to the controller.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Microsteps per full step.
    pub fn microsteps(self) -> u32 {
        1 << self.code()
    }
}

/// Interface for single-axis stepper control.
///
/// Positions are signed microstep counts. Velocities and accelerations use the
/// driver's native units; for the Tic those are microsteps per 10,000 s and
/// microsteps per 100 s² respectively.
///
/// Implementations are not expected to be internally synchronized: callers
/// serialize access (see the pan mount's motion coordinator).
pub trait StepperDriver: Send {
    /// Optional features this driver supports.
    fn capabilities(&self) -> Capabilities;

    /// Release the safe-start interlock so motion commands are accepted.
    fn exit_safe_start(&mut self) -> StepperResult<()>;

    /// Set the coil current limit in milliamps.
    fn set_current_limit(&mut self, milliamps: u32) -> StepperResult<()>;

    /// Set the microstepping resolution.
    fn set_step_mode(&mut self, mode: StepMode) -> StepperResult<()>;

    /// Set the maximum acceleration.
    fn set_max_accel(&mut self, _accel: u32) -> StepperResult<()> {
        Err(StepperError::Unsupported("set_max_accel"))
    }

    /// Set the maximum deceleration.
    fn set_max_decel(&mut self, _decel: u32) -> StepperResult<()> {
        Err(StepperError::Unsupported("set_max_decel"))
    }

    /// Enable motor current.
    fn energize(&mut self) -> StepperResult<()>;

    /// Disable motor current. Safe to call when already de-energized.
    fn deenergize(&mut self) -> StepperResult<()>;

    /// Run continuously at `velocity` (0 stops).
    fn set_target_velocity(&mut self, velocity: i32) -> StepperResult<()>;

    /// Move to an absolute position.
    fn set_target_position(&mut self, position: i32) -> StepperResult<()>;

    /// Position the controller believes the motor is at.
    fn get_current_position(&mut self) -> StepperResult<i32>;

    /// Position commanded by the last `set_target_position`.
    fn get_target_position(&mut self) -> StepperResult<i32>;

    /// Stop abruptly and redefine the current position as `position`.
    fn halt_and_set_position(&mut self, position: i32) -> StepperResult<()>;
}

impl<D: StepperDriver + ?Sized> StepperDriver for Box<D> {
    fn capabilities(&self) -> Capabilities {
        (**self).capabilities()
    }

    fn exit_safe_start(&mut self) -> StepperResult<()> {
        (**self).exit_safe_start()
    }

    fn set_current_limit(&mut self, milliamps: u32) -> StepperResult<()> {
        (**self).set_current_limit(milliamps)
    }

    fn set_step_mode(&mut self, mode: StepMode) -> StepperResult<()> {
        (**self).set_step_mode(mode)
    }

    fn set_max_accel(&mut self, accel: u32) -> StepperResult<()> {
        (**self).set_max_accel(accel)
    }

    fn set_max_decel(&mut self, decel: u32) -> StepperResult<()> {
        (**self).set_max_decel(decel)
    }

    fn energize(&mut self) -> StepperResult<()> {
        (**self).energize()
    }

    fn deenergize(&mut self) -> StepperResult<()> {
        (**self).deenergize()
    }

    fn set_target_velocity(&mut self, velocity: i32) -> StepperResult<()> {
        (**self).set_target_velocity(velocity)
    }

    fn set_target_position(&mut self, position: i32) -> StepperResult<()> {
        (**self).set_target_position(position)
    }

    fn get_current_position(&mut self) -> StepperResult<i32> {
        (**self).get_current_position()
    }

    fn get_target_position(&mut self) -> StepperResult<i32> {
        (**self).get_target_position()
    }

    fn halt_and_set_position(&mut self, position: i32) -> StepperResult<()> {
        (**self).halt_and_set_position(position)
    }
}

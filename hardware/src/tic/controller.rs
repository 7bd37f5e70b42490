//! Pololu Tic stepper motor controller driver.
//!
//! High-level interface over [`CompactSerial`](super::CompactSerial) exposing the
//! commands a single-axis mount needs:
//!
//! - **Motion**: [`set_target_position`](Tic::set_target_position),
//!   [`set_target_velocity`](Tic::set_target_velocity),
//!   [`halt_and_set_position`](Tic::halt_and_set_position)
//! - **Power**: [`energize`](Tic::energize), [`deenergize`](Tic::deenergize),
//!   [`exit_safe_start`](Tic::exit_safe_start)
//! - **Tuning**: current limit, step mode, acceleration limits
//! - **Status**: [`status`](Tic::status) snapshot of the variable block
//!
//! # Units
//!
//! - Positions: microsteps
//! - Velocities: microsteps per 10,000 s
//! - Accelerations: microsteps per 100 s²
//!
//! # Command Timeout
//!
//! The Tic's factory settings stop the motor if no command arrives for one
//! second. Long unattended moves (tours with multi-second pauses) need the
//! command timeout disabled in the Tic Control Center.
//!
//! # Example
//!
//! ```no_run
//! use hardware::stepper::{StepMode, StepperDriver};
//! use hardware::tic::{Tic, TicProduct};
//!
//! let mut tic = Tic::open("/dev/ttyACM0", 9600, TicProduct::T825)?;
//! tic.exit_safe_start()?;
//! tic.set_current_limit(1000)?;
//! tic.set_step_mode(StepMode::Half)?;
//! tic.energize()?;
//! tic.set_target_position(800)?;
//! # Ok::<(), hardware::stepper::StepperError>(())
//! ```

use std::io::{Read, Write};

use clap::ValueEnum;
use serialport::SerialPort;
use tracing::{debug, info};

use super::compact::{variables, CompactSerial, TicCommand};
use crate::stepper::{Capabilities, StepMode, StepperDriver, StepperError, StepperResult};

/// Tic hardware variant. Determines how current limits are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, strum::EnumIter, strum::Display)]
pub enum TicProduct {
    #[value(name = "t825")]
    T825,
    #[value(name = "t834")]
    T834,
    #[value(name = "t249")]
    T249,
    #[value(name = "36v4")]
    #[strum(to_string = "36v4")]
    Tic36v4,
}

impl TicProduct {
    /// Current represented by one unit of the current-limit code, in µA.
    fn current_unit_ua(self) -> u32 {
        match self {
            TicProduct::T825 | TicProduct::T834 => 32_000,
            TicProduct::T249 => 40_000,
            TicProduct::Tic36v4 => 71_615,
        }
    }

    /// Largest current-limit code the product accepts.
    fn max_current_code(self) -> u8 {
        match self {
            TicProduct::T825 | TicProduct::T834 => 124,
            TicProduct::T249 => 63,
            TicProduct::Tic36v4 => 127,
        }
    }

    /// Convert a current limit in mA to the code sent with "set current limit".
    ///
    /// Rounds down so the programmed limit never exceeds the request, and
    /// saturates at the product maximum.
    pub fn current_limit_code(self, milliamps: u32) -> u8 {
        let code = (milliamps as u64 * 1000) / self.current_unit_ua() as u64;
        code.min(self.max_current_code() as u64) as u8
    }

    /// Current limit in mA that a code represents.
    pub fn current_limit_ma(self, code: u8) -> u32 {
        (code as u32 * self.current_unit_ua()) / 1000
    }
}

/// Tic operation state (variable 0x00).
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum OperationState {
    Reset,
    Deenergized,
    SoftError,
    WaitingForErrLine,
    StartingUp,
    Normal,
    Unknown(u8),
}

impl From<u8> for OperationState {
    fn from(value: u8) -> Self {
        match value {
            0 => OperationState::Reset,
            2 => OperationState::Deenergized,
            4 => OperationState::SoftError,
            6 => OperationState::WaitingForErrLine,
            8 => OperationState::StartingUp,
            10 => OperationState::Normal,
            other => OperationState::Unknown(other),
        }
    }
}

/// Snapshot of the most useful Tic variables.
#[derive(Debug, Clone, PartialEq)]
pub struct TicStatus {
    pub operation_state: OperationState,
    /// Bitmask of currently active errors (see the Tic user guide).
    pub error_status: u16,
    pub current_position: i32,
    pub target_position: i32,
    pub current_velocity: i32,
    pub max_accel: u32,
    pub max_decel: u32,
    pub vin_mv: u16,
}

/// High-level driver for a Pololu Tic on a serial port.
pub struct Tic<T = Box<dyn SerialPort>> {
    link: CompactSerial<T>,
    product: TicProduct,
}

impl Tic {
    /// Open a Tic on the given serial port.
    pub fn open(path: &str, baud: u32, product: TicProduct) -> StepperResult<Self> {
        let link = CompactSerial::open(path, baud)?;
        let mut tic = Self { link, product };

        // Confirms something that speaks the protocol is on the other end.
        let state = tic.operation_state()?;
        info!("Connected to Tic {} on {} (state: {})", product, path, state);
        Ok(tic)
    }
}

impl<T: Read + Write> Tic<T> {
    /// Wrap an already-open link.
    pub fn with_link(link: CompactSerial<T>, product: TicProduct) -> Self {
        Self { link, product }
    }

    pub fn product(&self) -> TicProduct {
        self.product
    }

    pub fn into_link(self) -> CompactSerial<T> {
        self.link
    }

    // ==================== Status ====================

    pub fn operation_state(&mut self) -> StepperResult<OperationState> {
        Ok(self.link.read_u8(variables::OPERATION_STATE)?.into())
    }

    pub fn error_status(&mut self) -> StepperResult<u16> {
        self.link.read_u16(variables::ERROR_STATUS)
    }

    pub fn current_velocity(&mut self) -> StepperResult<i32> {
        self.link.read_i32(variables::CURRENT_VELOCITY)
    }

    /// Input voltage in millivolts.
    pub fn vin_voltage_mv(&mut self) -> StepperResult<u16> {
        self.link.read_u16(variables::VIN_VOLTAGE)
    }

    /// Read the commonly inspected variables.
    pub fn status(&mut self) -> StepperResult<TicStatus> {
        Ok(TicStatus {
            operation_state: self.operation_state()?,
            error_status: self.error_status()?,
            current_position: self.link.read_i32(variables::CURRENT_POSITION)?,
            target_position: self.link.read_i32(variables::TARGET_POSITION)?,
            current_velocity: self.current_velocity()?,
            max_accel: self.link.read_u32(variables::MAX_ACCEL)?,
            max_decel: self.link.read_u32(variables::MAX_DECEL)?,
            vin_mv: self.vin_voltage_mv()?,
        })
    }
}

fn to_i32(value: u32, what: &str) -> StepperResult<i32> {
    i32::try_from(value).map_err(|_| StepperError::OutOfRange(format!("{what} {value}")))
}

impl<T: Read + Write + Send> StepperDriver for Tic<T> {
    fn capabilities(&self) -> Capabilities {
        Capabilities::MAX_ACCEL | Capabilities::MAX_DECEL
    }

    fn exit_safe_start(&mut self) -> StepperResult<()> {
        self.link.quick(TicCommand::ExitSafeStart)
    }

    fn set_current_limit(&mut self, milliamps: u32) -> StepperResult<()> {
        let code = self.product.current_limit_code(milliamps);
        debug!(
            "Current limit {} mA -> code {} ({} mA)",
            milliamps,
            code,
            self.product.current_limit_ma(code)
        );
        self.link.write_7(TicCommand::SetCurrentLimit, code)
    }

    fn set_step_mode(&mut self, mode: StepMode) -> StepperResult<()> {
        self.link.write_7(TicCommand::SetStepMode, mode.code())
    }

    fn set_max_accel(&mut self, accel: u32) -> StepperResult<()> {
        self.link.write_32(TicCommand::SetMaxAccel, to_i32(accel, "max accel")?)
    }

    fn set_max_decel(&mut self, decel: u32) -> StepperResult<()> {
        self.link.write_32(TicCommand::SetMaxDecel, to_i32(decel, "max decel")?)
    }

    fn energize(&mut self) -> StepperResult<()> {
        self.link.quick(TicCommand::Energize)
    }

    fn deenergize(&mut self) -> StepperResult<()> {
        self.link.quick(TicCommand::Deenergize)
    }

    fn set_target_velocity(&mut self, velocity: i32) -> StepperResult<()> {
        self.link.write_32(TicCommand::SetTargetVelocity, velocity)
    }

    fn set_target_position(&mut self, position: i32) -> StepperResult<()> {
        self.link.write_32(TicCommand::SetTargetPosition, position)
    }

    fn get_current_position(&mut self) -> StepperResult<i32> {
        self.link.read_i32(variables::CURRENT_POSITION)
    }

    fn get_target_position(&mut self) -> StepperResult<i32> {
        self.link.read_i32(variables::TARGET_POSITION)
    }

    fn halt_and_set_position(&mut self, position: i32) -> StepperResult<()> {
        self.link.write_32(TicCommand::HaltAndSetPosition, position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tic::compact::tests::FakePort;
    use strum::IntoEnumIterator;

    fn tic_with_reply(reply: &[u8]) -> Tic<FakePort> {
        Tic::with_link(
            CompactSerial::from_transport(FakePort::with_reply(reply)),
            TicProduct::T825,
        )
    }

    fn written(tic: Tic<FakePort>) -> Vec<u8> {
        tic.into_link().into_inner().written
    }

    #[test]
    fn test_current_limit_codes() {
        assert_eq!(TicProduct::T825.current_limit_code(1000), 31);
        assert_eq!(TicProduct::T825.current_limit_ma(31), 992);
        assert_eq!(TicProduct::T249.current_limit_code(1000), 25);
        assert_eq!(TicProduct::Tic36v4.current_limit_code(1000), 13);
    }

    #[test]
    fn test_current_limit_saturates() {
        for product in TicProduct::iter() {
            let code = product.current_limit_code(u32::MAX / 1000);
            assert_eq!(code, product.max_current_code(), "{product}");
            assert!(code <= 0x7F);
        }
    }

    #[test]
    fn test_init_sequence_bytes() {
        let mut tic = tic_with_reply(&[]);
        tic.exit_safe_start().unwrap();
        tic.set_current_limit(1000).unwrap();
        tic.set_step_mode(StepMode::Half).unwrap();

        assert_eq!(written(tic), vec![0x83, 0x91, 31, 0x94, 0x01]);
    }

    #[test]
    fn test_velocity_command() {
        let mut tic = tic_with_reply(&[]);
        tic.set_target_velocity(-25000).unwrap();

        // -25000 = 0xFFFF9E58
        assert_eq!(written(tic), vec![0xE3, 0x0E, 0x58, 0x1E, 0x7F, 0x7F]);
    }

    #[test]
    fn test_accel_out_of_range() {
        let mut tic = tic_with_reply(&[]);
        assert!(matches!(
            tic.set_max_accel(u32::MAX),
            Err(StepperError::OutOfRange(_))
        ));
    }

    #[test]
    fn test_read_positions() {
        let mut reply = Vec::new();
        reply.extend_from_slice(&480i32.to_le_bytes());
        reply.extend_from_slice(&900i32.to_le_bytes());
        let mut tic = tic_with_reply(&reply);

        assert_eq!(tic.get_current_position().unwrap(), 480);
        assert_eq!(tic.get_target_position().unwrap(), 900);
        assert_eq!(written(tic), vec![0xA1, 0x22, 0x04, 0xA1, 0x0A, 0x04]);
    }

    #[test]
    fn test_operation_state_decoding() {
        assert_eq!(OperationState::from(10), OperationState::Normal);
        assert_eq!(OperationState::from(2), OperationState::Deenergized);
        assert_eq!(OperationState::from(3), OperationState::Unknown(3));
    }

    #[test]
    fn test_tic_reports_accel_capabilities() {
        let tic = tic_with_reply(&[]);
        assert!(tic.capabilities().has_accel_limits());
    }
}

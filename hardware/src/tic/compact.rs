//! Pololu Tic compact serial protocol.
//!
//! The Tic accepts binary commands over its TTL serial / USB virtual COM port.
//! In the compact protocol every message starts with a command byte (bit 7 set)
//! followed by zero or more data bytes that always have bit 7 cleared.
//!
//! # Framing
//!
//! | Kind       | Bytes on the wire                                  |
//! |------------|----------------------------------------------------|
//! | Quick      | `cmd`                                              |
//! | 7-bit      | `cmd, data`                                        |
//! | 32-bit     | `cmd, msbs, d0 & 0x7F, d1 & 0x7F, d2 & 0x7F, d3 & 0x7F` |
//! | Block read | `cmd, offset, length` → `length` raw response bytes |
//!
//! For 32-bit writes the value is split into little-endian bytes `d0..d3`; bit 7
//! of each byte is moved into bits 0..3 of the `msbs` byte.
//!
//! Responses to block reads are plain bytes (bit 7 may be set) and multi-byte
//! variables are little endian.
//!
//! # Example
//!
//! ```no_run
//! use hardware::tic::{CompactSerial, TicCommand, variables};
//!
//! let mut link = CompactSerial::open("/dev/ttyACM0", 9600)?;
//! link.quick(TicCommand::ExitSafeStart)?;
//! link.write_32(TicCommand::SetTargetPosition, 1200)?;
//! let pos = link.read_i32(variables::CURRENT_POSITION)?;
//! println!("Current position: {pos}");
//! # Ok::<(), hardware::stepper::StepperError>(())
//! ```

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use serialport::SerialPort;
use tracing::{debug, trace};

use crate::stepper::{StepperError, StepperResult};

/// Baud rate the Tic ships with.
pub const DEFAULT_BAUD: u32 = 9600;

/// Serial read timeout. Tic replies arrive within a few milliseconds.
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// Largest block the Tic returns for one serial "get variable" request.
const MAX_BLOCK_LEN: u8 = 15;

/// Command bytes used by this driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TicCommand {
    SetTargetPosition = 0xE0,
    SetTargetVelocity = 0xE3,
    HaltAndSetPosition = 0xEC,
    Deenergize = 0x86,
    Energize = 0x85,
    ExitSafeStart = 0x83,
    SetMaxAccel = 0xEA,
    SetMaxDecel = 0xE9,
    SetStepMode = 0x94,
    SetCurrentLimit = 0x91,
    GetVariable = 0xA1,
}

impl TicCommand {
    pub fn byte(self) -> u8 {
        self as u8
    }
}

/// Offsets of the Tic variables this driver reads.
pub mod variables {
    pub const OPERATION_STATE: u8 = 0x00;
    pub const ERROR_STATUS: u8 = 0x02;
    pub const TARGET_POSITION: u8 = 0x0A;
    pub const MAX_DECEL: u8 = 0x1A;
    pub const MAX_ACCEL: u8 = 0x1E;
    pub const CURRENT_POSITION: u8 = 0x22;
    pub const CURRENT_VELOCITY: u8 = 0x26;
    pub const VIN_VOLTAGE: u8 = 0x33;
    pub const UP_TIME: u8 = 0x35;
}

/// Encode a 32-bit write command.
///
/// # Example
///
/// ```
/// use hardware::tic::{encode_32, TicCommand};
///
/// // -200 as a target position
/// let frame = encode_32(TicCommand::SetTargetPosition, -200i32 as u32);
/// assert_eq!(frame, [0xE0, 0x0E, 0x38, 0x7F, 0x7F, 0x7F]);
/// ```
pub fn encode_32(command: TicCommand, data: u32) -> [u8; 6] {
    let bytes = data.to_le_bytes();
    let msbs = bytes
        .iter()
        .enumerate()
        .fold(0u8, |acc, (i, b)| acc | ((b >> 7) << i));
    [
        command.byte(),
        msbs,
        bytes[0] & 0x7F,
        bytes[1] & 0x7F,
        bytes[2] & 0x7F,
        bytes[3] & 0x7F,
    ]
}

/// Low-level compact-protocol link to a Tic.
///
/// Generic over the byte transport so the framing can be exercised without a
/// serial port. [`open`](CompactSerial::open) gives the usual serial-port backed link.
pub struct CompactSerial<T> {
    port: T,
}

impl CompactSerial<Box<dyn SerialPort>> {
    /// Open the Tic's serial port at `path`.
    ///
    /// On Linux the Tic's USB command port usually enumerates as
    /// `/dev/ttyACM0`.
    pub fn open(path: &str, baud: u32) -> StepperResult<Self> {
        let port = serialport::new(path, baud)
            .timeout(DEFAULT_TIMEOUT)
            .open()
            .map_err(|e| StepperError::ConnectionFailed(format!("{path}: {e}")))?;

        debug!("Opened Tic serial port {} at {} baud", path, baud);
        Ok(Self { port })
    }
}

impl<T: Read + Write> CompactSerial<T> {
    /// Wrap an already-open transport.
    pub fn from_transport(port: T) -> Self {
        Self { port }
    }

    /// Give back the underlying transport.
    pub fn into_inner(self) -> T {
        self.port
    }

    fn send(&mut self, frame: &[u8]) -> StepperResult<()> {
        trace!("Tic send: {:02X?}", frame);
        self.port.write_all(frame)?;
        self.port.flush()?;
        Ok(())
    }

    /// Send a command with no data bytes.
    pub fn quick(&mut self, command: TicCommand) -> StepperResult<()> {
        self.send(&[command.byte()])
    }

    /// Send a command with one 7-bit data byte.
    pub fn write_7(&mut self, command: TicCommand, data: u8) -> StepperResult<()> {
        if data > 0x7F {
            return Err(StepperError::OutOfRange(format!(
                "{command:?} data {data} exceeds 7 bits"
            )));
        }
        self.send(&[command.byte(), data])
    }

    /// Send a command with a 32-bit data word.
    pub fn write_32(&mut self, command: TicCommand, data: i32) -> StepperResult<()> {
        self.send(&encode_32(command, data as u32))
    }

    /// Read `len` bytes of the variable block starting at `offset`.
    pub fn block_read(&mut self, offset: u8, len: u8) -> StepperResult<Vec<u8>> {
        if len == 0 || len > MAX_BLOCK_LEN {
            return Err(StepperError::OutOfRange(format!(
                "block length {len} must be 1..={MAX_BLOCK_LEN}"
            )));
        }
        self.send(&[TicCommand::GetVariable.byte(), offset, len])?;

        let mut buf = vec![0u8; len as usize];
        match self.port.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                return Err(StepperError::Timeout);
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(StepperError::InvalidResponse(format!(
                    "short read for variable 0x{offset:02X}"
                )));
            }
            Err(e) => return Err(e.into()),
        }

        trace!("Tic recv: {:02X?}", buf);
        Ok(buf)
    }

    pub fn read_u8(&mut self, offset: u8) -> StepperResult<u8> {
        Ok(self.block_read(offset, 1)?[0])
    }

    pub fn read_u16(&mut self, offset: u8) -> StepperResult<u16> {
        let b = self.block_read(offset, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self, offset: u8) -> StepperResult<u32> {
        let b = self.block_read(offset, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self, offset: u8) -> StepperResult<i32> {
        Ok(self.read_u32(offset)? as i32)
    }
}

//! Pololu Tic stepper motor controllers.
//!
//! - [`compact`] - serial framing for the Tic compact protocol
//! - [`controller`] - high-level [`Tic`] driver implementing
//!   [`StepperDriver`](crate::stepper::StepperDriver)

pub mod compact;
pub mod controller;

pub use compact::{encode_32, variables, CompactSerial, TicCommand, DEFAULT_BAUD};
pub use controller::{OperationState, Tic, TicProduct, TicStatus};

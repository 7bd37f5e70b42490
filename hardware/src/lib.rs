//! Hardware drivers for the pan mount.
//!
//! This crate provides the stepper driver interface used by the motion-control
//! code, a Pololu Tic implementation of it, and a simulated stepper for tests.
//! Real-hardware drivers are feature-gated for optional compilation.
//!
//! # Modules
//!
//! - [`stepper`] - the [`StepperDriver`](stepper::StepperDriver) trait, step modes
//!   and capability flags
//! - [`mock`] - recording [`MockStepper`](mock::MockStepper)
//! - `tic` - Pololu Tic serial driver (feature `tic`)
//!
//! # Features
//!
//! - `tic` - Pololu Tic compact-protocol driver over a serial port

pub mod mock;
pub mod stepper;

#[cfg(feature = "tic")]
pub mod tic;

//! Motorized pan mount control.
//!
//! One stepper on a Pololu Tic turns the mount. This crate layers the
//! application on top of the [`hardware`] driver:
//!
//! - [`coordinator`]: serialized device access, pan/stop/energize and presets
//! - [`convergence`]: polling until the motor reaches its target
//! - [`tour`]: background sweep through the saved presets
//! - [`presets`]: JSON preset file
//! - [`server`]: HTTP API for the web UI

pub mod cancel;
pub mod config;
pub mod convergence;
pub mod coordinator;
pub mod error;
pub mod presets;
pub mod server;
pub mod tour;

pub use error::{MountError, MountResult};

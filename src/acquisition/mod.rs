//! Acquisition control: config validation and the arm/start/poll/abort
//! state machine.

pub mod controller;
pub mod state;
pub mod validate;

pub use controller::{
    AbortOutcome, AbortReport, AcquisitionController, AcquisitionOutput, PollOutcome,
};
pub use state::AcquisitionState;
pub use validate::{validate, AcquisitionMode, ValidatedConfig};

//! Camera hardware abstraction.
//!
//! - [`codes`]: vendor status-code table
//! - [`device`]: the [`DevicePort`] trait and the records it exchanges
//! - [`mock`]: [`SimulatedCamera`], an in-process port for tests and the CLI

pub mod codes;
pub mod device;
pub mod mock;

pub use codes::{CodeCategory, StatusCode};
pub use device::{
    AcquisitionModeCode, AcquisitionStatus, AcquisitionTimings, ArmSettings, DeviceCapabilities,
    DevicePort, EmGainMode, FanMode, FastKineticsSetup, ImageSetup, PortResult, ReadoutSettings,
    Roi, ShutterMode, ShutterSettings, TriggerMode, READ_MODE_IMAGE,
};
pub use mock::{SimHandle, SimulatedCamera};

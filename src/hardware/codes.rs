//! Vendor status codes returned by every camera call.
//!
//! The camera SDK reports the outcome of each call as a bare integer. This
//! module gives those integers a name, a human-readable message, and a coarse
//! category so that the rest of the crate can decide whether a reply is a
//! success, a benign status, or an error worth surfacing.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A raw status code as returned by the camera SDK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(pub u32);

/// Coarse grouping of status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeCategory {
    /// The call succeeded.
    Success,
    /// Acquisition status reply (idle, acquiring, temperature cycle).
    Status,
    /// Temperature status reply from a temperature query.
    Temperature,
    /// One of the call parameters was rejected.
    InvalidParameter,
    /// The host could not talk to the camera.
    Communication,
    /// Driver or firmware files missing, memory lock failure, no camera.
    Fatal,
    /// A code missing from the table.
    Unknown,
}

// Names mirror the SDK constants without the DRV_ prefix.
#[allow(missing_docs)]
impl StatusCode {
    pub const SUCCESS: Self = Self(20002);
    pub const VXD_NOT_INSTALLED: Self = Self(20003);
    pub const ERROR_FILELOAD: Self = Self(20006);
    pub const ERROR_PAGELOCK: Self = Self(20010);
    pub const ERROR_ACK: Self = Self(20013);
    pub const NO_NEW_DATA: Self = Self(20024);
    pub const TEMP_OFF: Self = Self(20034);
    pub const TEMP_NOT_STABILIZED: Self = Self(20035);
    pub const TEMP_STABILIZED: Self = Self(20036);
    pub const TEMP_NOT_REACHED: Self = Self(20037);
    pub const TEMP_OUT_RANGE: Self = Self(20038);
    pub const TEMP_NOT_SUPPORTED: Self = Self(20039);
    pub const TEMP_DRIFT: Self = Self(20040);
    pub const FLEX_ERROR: Self = Self(20053);
    pub const P1_INVALID: Self = Self(20066);
    pub const P2_INVALID: Self = Self(20067);
    pub const P3_INVALID: Self = Self(20068);
    pub const P4_INVALID: Self = Self(20069);
    pub const INI_ERROR: Self = Self(20070);
    pub const COF_ERROR: Self = Self(20071);
    pub const ACQUIRING: Self = Self(20072);
    pub const IDLE: Self = Self(20073);
    pub const TEMP_CYCLE: Self = Self(20074);
    pub const NOT_INITIALIZED: Self = Self(20075);
    pub const P5_INVALID: Self = Self(20076);
    pub const P6_INVALID: Self = Self(20077);
    pub const P7_INVALID: Self = Self(20083);
    pub const USB_ERROR: Self = Self(20089);
    pub const ERROR_NOCAMERA: Self = Self(20990);
}

impl StatusCode {
    /// Raw integer value.
    pub fn code(self) -> u32 {
        self.0
    }

    /// Returns true for the single success code.
    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// SDK constant name, or `"UNKNOWN"` for codes outside the table.
    pub fn name(self) -> &'static str {
        match self {
            Self::SUCCESS => "DRV_SUCCESS",
            Self::VXD_NOT_INSTALLED => "DRV_VXDNOTINSTALLED",
            Self::ERROR_FILELOAD => "DRV_ERROR_FILELOAD",
            Self::ERROR_PAGELOCK => "DRV_ERROR_PAGELOCK",
            Self::ERROR_ACK => "DRV_ERROR_ACK",
            Self::NO_NEW_DATA => "DRV_NO_NEW_DATA",
            Self::TEMP_OFF => "DRV_TEMP_OFF",
            Self::TEMP_NOT_STABILIZED => "DRV_TEMP_NOT_STABILIZED",
            Self::TEMP_STABILIZED => "DRV_TEMP_STABILIZED",
            Self::TEMP_NOT_REACHED => "DRV_TEMP_NOT_REACHED",
            Self::TEMP_OUT_RANGE => "DRV_TEMP_OUT_RANGE",
            Self::TEMP_NOT_SUPPORTED => "DRV_TEMP_NOT_SUPPORTED",
            Self::TEMP_DRIFT => "DRV_TEMP_DRIFT",
            Self::FLEX_ERROR => "DRV_FLEXERROR",
            Self::P1_INVALID => "DRV_P1INVALID",
            Self::P2_INVALID => "DRV_P2INVALID",
            Self::P3_INVALID => "DRV_P3INVALID",
            Self::P4_INVALID => "DRV_P4INVALID",
            Self::INI_ERROR => "DRV_INIERROR",
            Self::COF_ERROR => "DRV_COFERROR",
            Self::ACQUIRING => "DRV_ACQUIRING",
            Self::IDLE => "DRV_IDLE",
            Self::TEMP_CYCLE => "DRV_TEMPCYCLE",
            Self::NOT_INITIALIZED => "DRV_NOT_INITIALIZED",
            Self::P5_INVALID => "DRV_P5INVALID",
            Self::P6_INVALID => "DRV_P6INVALID",
            Self::P7_INVALID => "DRV_P7INVALID",
            Self::USB_ERROR => "DRV_USBERROR",
            Self::ERROR_NOCAMERA => "DRV_ERROR_NOCAMERA",
            _ => "UNKNOWN",
        }
    }

    /// Human-readable message for the code.
    pub fn describe(self) -> String {
        let text = match self {
            Self::SUCCESS => "Success",
            Self::VXD_NOT_INSTALLED => "VxD not installed",
            Self::INI_ERROR => "Unable to load \"DETECTOR.INI\"",
            Self::COF_ERROR => "Unable to load \"*.COF\"",
            Self::FLEX_ERROR => "Unable to load \"*.RBF\"",
            Self::ERROR_FILELOAD => "Unable to load \"*.COF\" or \"*.RBF\" files",
            Self::ERROR_PAGELOCK => "Unable to acquire lock on requested memory",
            Self::USB_ERROR => "Unable to detect USB device or not USB2.0",
            Self::ERROR_NOCAMERA => "No camera found",
            Self::ERROR_ACK => "Unable to communicate with card",
            Self::NOT_INITIALIZED => "System not initialized",
            Self::NO_NEW_DATA => "No new data available",
            Self::ACQUIRING => "Acquisition in progress",
            Self::IDLE => "Camera is idle",
            Self::TEMP_CYCLE => "Executing temperature cycle",
            Self::TEMP_OFF => "Cooler is off",
            Self::TEMP_NOT_STABILIZED => "Temperature reached but not stabilized",
            Self::TEMP_STABILIZED => "Temperature stabilized",
            Self::TEMP_NOT_REACHED => "Temperature not reached",
            Self::TEMP_OUT_RANGE => "Temperature out of range",
            Self::TEMP_NOT_SUPPORTED => "Temperature control not supported",
            Self::TEMP_DRIFT => "Temperature drifted from target",
            Self::P1_INVALID => "Parameter 1 invalid",
            Self::P2_INVALID => "Parameter 2 invalid",
            Self::P3_INVALID => "Parameter 3 invalid",
            Self::P4_INVALID => "Parameter 4 invalid",
            Self::P5_INVALID => "Parameter 5 invalid",
            Self::P6_INVALID => "Parameter 6 invalid",
            Self::P7_INVALID => "Parameter 7 invalid",
            other => return format!("Error code: {}", other.0),
        };
        text.to_string()
    }

    /// Category used to decide how a reply is handled.
    pub fn category(self) -> CodeCategory {
        match self {
            Self::SUCCESS => CodeCategory::Success,
            Self::ACQUIRING | Self::IDLE | Self::TEMP_CYCLE | Self::NO_NEW_DATA => {
                CodeCategory::Status
            }
            Self::TEMP_OFF
            | Self::TEMP_NOT_STABILIZED
            | Self::TEMP_STABILIZED
            | Self::TEMP_NOT_REACHED
            | Self::TEMP_OUT_RANGE
            | Self::TEMP_NOT_SUPPORTED
            | Self::TEMP_DRIFT => CodeCategory::Temperature,
            Self::P1_INVALID
            | Self::P2_INVALID
            | Self::P3_INVALID
            | Self::P4_INVALID
            | Self::P5_INVALID
            | Self::P6_INVALID
            | Self::P7_INVALID => CodeCategory::InvalidParameter,
            Self::ERROR_ACK | Self::NOT_INITIALIZED | Self::USB_ERROR => {
                CodeCategory::Communication
            }
            Self::VXD_NOT_INSTALLED
            | Self::ERROR_FILELOAD
            | Self::ERROR_PAGELOCK
            | Self::FLEX_ERROR
            | Self::INI_ERROR
            | Self::COF_ERROR
            | Self::ERROR_NOCAMERA => CodeCategory::Fatal,
            _ => CodeCategory::Unknown,
        }
    }

    /// The error flag raised for a plain command reply: anything but success.
    pub fn error_flag(self) -> bool {
        !self.is_success()
    }

    /// Codes that only mean "try again on the next poll".
    pub fn is_transient(self) -> bool {
        matches!(self, Self::ERROR_ACK | Self::NO_NEW_DATA)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            "UNKNOWN" => write!(f, "code {}", self.0),
            name => write!(f, "{name} ({})", self.0),
        }
    }
}

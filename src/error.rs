//! Custom error types for the crate.
//!
//! This module defines the primary error type, `CamError`, used by every layer
//! from settings loading down to the device port. Using the `thiserror` crate,
//! it keeps the error taxonomy in one place so the acquisition controller, the
//! thermal monitor and the shutdown sequence all report failures the same way.
//!
//! ## Error Hierarchy
//!
//! - **`Settings`**: Wraps `figment` errors raised while merging defaults, the
//!   TOML file and `KRBCAM_` environment variables.
//! - **`Config`**: An acquisition or settings value that cannot be repaired by
//!   clamping, typically because the camera did not report the capability data
//!   needed to clamp it.
//! - **`Device`**: A non-success status code from the camera, together with the
//!   operation that produced it.
//! - **`Shape`**: A raw buffer or frame whose dimensions do not match what the
//!   acquisition was armed for. Always fatal to the running acquisition.
//! - **`TempRead`**: The temperature query failed; automatic polling stops
//!   until it is restarted.
//! - **`SafetyViolation`**: A shutdown was attempted while the sensor is colder
//!   than the safe threshold and the operator did not override it.
//! - **`ShutdownDeclined`**: The operator answered no to a safe shutdown.
//! - **`ShutdownFailed`**: The shutdown sequence ran to the end but one or more
//!   guarded steps failed along the way.
//!
//! Every variant carries a short header through [`CamError::header`]; together
//! with the `Display` text it forms the (header, detail) pair written to the
//! status log for fatal conditions.

use crate::acquisition::AcquisitionState;
use crate::hardware::StatusCode;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type CamResult<T> = std::result::Result<T, CamError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum CamError {
    #[error("Settings error: {0}")]
    Settings(#[from] figment::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("{operation} error: {message} [{code}]")]
    Device {
        operation: &'static str,
        code: StatusCode,
        message: String,
    },

    #[error("Frame shape mismatch: {0}")]
    Shape(String),

    #[error("GetTemperature error: {message} [{code}]")]
    TempRead { code: StatusCode, message: String },

    #[error("{}", safety_message(.temperature, .threshold))]
    SafetyViolation {
        temperature: Option<f64>,
        threshold: f64,
    },

    #[error("Cannot {operation} while acquisition is {state}")]
    InvalidState {
        operation: &'static str,
        state: AcquisitionState,
    },

    #[error("Shutdown cancelled by operator")]
    ShutdownDeclined,

    #[error("Camera session is closed")]
    SessionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Shutdown finished with {} failed step(s)", .0.len())]
    ShutdownFailed(Vec<CamError>),
}

fn safety_message(temperature: &Option<f64>, threshold: &f64) -> String {
    match temperature {
        Some(t) => format!(
            "Current temp is {t:.1} C, safe temp is >{threshold:.1} C. The camera should be warming up."
        ),
        None => format!(
            "CCD temperature could not be read; cannot confirm it is above {threshold:.1} C."
        ),
    }
}

impl CamError {
    /// Wrap a status code returned by `operation`.
    pub fn device(operation: &'static str, code: StatusCode) -> Self {
        CamError::Device {
            operation,
            code,
            message: code.describe(),
        }
    }

    /// Short header paired with the detailed `Display` text.
    pub fn header(&self) -> &'static str {
        match self {
            CamError::Settings(_) => "Settings could not be loaded.",
            CamError::Config(_) => "Invalid acquisition settings.",
            CamError::Device { operation, .. } => match *operation {
                "GetStatus" => "Error in acquisition loop.",
                "GetImages" => "Error reading out data.",
                _ => "Camera error!",
            },
            CamError::Shape(_) => "Unexpected frame data.",
            CamError::TempRead { .. } => "Error getting CCD temperature.",
            CamError::SafetyViolation { .. } => "CCD temperature is too low.",
            CamError::InvalidState { .. } => "Camera is busy.",
            CamError::ShutdownDeclined => "Shutdown cancelled.",
            CamError::SessionClosed => "Camera is shut down.",
            CamError::Io(_) => "File system error.",
            CamError::Storage(_) => "Error saving data.",
            CamError::FeatureNotEnabled(_) => "Feature not available.",
            CamError::ShutdownFailed(_) => "Shutdown incomplete.",
        }
    }

    /// Whether the session can carry on after this error.
    pub fn can_recover(&self) -> bool {
        match self {
            CamError::Config(_)
            | CamError::Device { .. }
            | CamError::Shape(_)
            | CamError::TempRead { .. }
            | CamError::SafetyViolation { .. }
            | CamError::InvalidState { .. }
            | CamError::ShutdownDeclined
            | CamError::Storage(_) => true,
            CamError::Settings(_)
            | CamError::SessionClosed
            | CamError::Io(_)
            | CamError::FeatureNotEnabled(_)
            | CamError::ShutdownFailed(_) => false,
        }
    }

    /// The camera status code behind this error, if any.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            CamError::Device { code, .. } | CamError::TempRead { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_error_carries_code_and_message() {
        let err = CamError::device("StartAcquisition", StatusCode::P1_INVALID);
        assert_eq!(err.status_code(), Some(StatusCode::P1_INVALID));
        let text = err.to_string();
        assert!(text.starts_with("StartAcquisition error: Parameter 1 invalid"));
        assert!(text.contains("20066"));
        assert_eq!(err.header(), "Camera error!");
        assert!(err.can_recover());
    }

    #[test]
    fn safety_violation_mentions_temperature() {
        let err = CamError::SafetyViolation {
            temperature: Some(-25.0),
            threshold: -20.0,
        };
        assert!(err.to_string().contains("-25.0"));
        assert!(err.to_string().contains("-20.0"));

        let unknown = CamError::SafetyViolation {
            temperature: None,
            threshold: -20.0,
        };
        assert!(unknown.to_string().contains("could not be read"));
    }

    #[test]
    fn invalid_state_names_the_state() {
        let err = CamError::InvalidState {
            operation: "arm",
            state: AcquisitionState::Exposing,
        };
        assert_eq!(err.to_string(), "Cannot arm while acquisition is Exposing");
    }

    #[test]
    fn shutdown_failed_counts_steps() {
        let err = CamError::ShutdownFailed(vec![
            CamError::device("SetShutter", StatusCode::ERROR_ACK),
            CamError::device("ShutDown", StatusCode::NOT_INITIALIZED),
        ]);
        assert_eq!(err.to_string(), "Shutdown finished with 2 failed step(s)");
        assert!(!err.can_recover());
    }

    #[test]
    fn loop_errors_have_their_own_headers() {
        assert_eq!(
            CamError::device("GetStatus", StatusCode::TEMP_CYCLE).header(),
            "Error in acquisition loop."
        );
        assert_eq!(
            CamError::device("GetImages", StatusCode::NO_NEW_DATA).header(),
            "Error reading out data."
        );
    }
}

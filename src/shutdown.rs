//! Shutdown gating and reporting.
//!
//! Closing the camera is gated on the sensor temperature. The session builds a
//! [`ShutdownPrompt`] from a fresh reading and asks an [`OperatorPrompt`]
//! whether to continue. Nothing irreversible happens before the answer.

use crate::error::CamError;
use serde::Serialize;

/// Question put to the operator before the camera is shut down.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShutdownPrompt {
    /// The temperature read failed.
    TemperatureUnreadable {
        /// Read error text.
        message: String,
    },
    /// The sensor is colder than the safe threshold.
    BelowSafeThreshold {
        /// Current reading in °C.
        temperature: f64,
        /// Safe threshold in °C.
        threshold: f64,
    },
    /// Safe to shut down; plain confirmation.
    ConfirmSafe {
        /// Current reading in °C.
        temperature: f64,
        /// Safe threshold in °C.
        threshold: f64,
    },
}

impl ShutdownPrompt {
    /// Dialog title.
    pub fn header(&self) -> &'static str {
        match self {
            ShutdownPrompt::TemperatureUnreadable { .. } => "Error getting CCD temperature.",
            ShutdownPrompt::BelowSafeThreshold { .. } => "CCD temperature is too low.",
            ShutdownPrompt::ConfirmSafe { .. } => "Close camera?",
        }
    }

    /// Dialog body.
    pub fn message(&self) -> String {
        match self {
            ShutdownPrompt::TemperatureUnreadable { message } => {
                format!("{message} Force close?")
            }
            ShutdownPrompt::BelowSafeThreshold {
                temperature,
                threshold,
            } => format!(
                "Current temp is {temperature:.1} C, safe temp is >{threshold:.1} C. \
                 The camera should be warming up. Close anyway?"
            ),
            ShutdownPrompt::ConfirmSafe { temperature, .. } => format!(
                "CCD temperature is {temperature:.1} C. Turn off cooler and shut down the camera?"
            ),
        }
    }

    /// True when continuing would skip the temperature safeguard.
    pub fn is_override(&self) -> bool {
        !matches!(self, ShutdownPrompt::ConfirmSafe { .. })
    }
}

/// Answers shutdown prompts.
pub trait OperatorPrompt {
    /// `true` to continue with the shutdown.
    fn confirm(&self, prompt: &ShutdownPrompt) -> bool;
}

/// Confirms only a safe shutdown.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyUnsafe;

impl OperatorPrompt for DenyUnsafe {
    fn confirm(&self, prompt: &ShutdownPrompt) -> bool {
        !prompt.is_override()
    }
}

/// Confirms every prompt, including unsafe ones. Explicit operator override.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForceShutdown;

impl OperatorPrompt for ForceShutdown {
    fn confirm(&self, _prompt: &ShutdownPrompt) -> bool {
        true
    }
}

impl<F> OperatorPrompt for F
where
    F: Fn(&ShutdownPrompt) -> bool,
{
    fn confirm(&self, prompt: &ShutdownPrompt) -> bool {
        self(prompt)
    }
}

/// One step of the shutdown sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShutdownStep {
    /// Step name, e.g. `"CoolerOFF"`.
    pub name: &'static str,
    /// Error text when the step failed.
    pub error: Option<String>,
}

/// What the shutdown sequence did.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Steps in execution order.
    pub steps: Vec<ShutdownStep>,
    /// Errors of the failed steps.
    pub errors: Vec<CamError>,
    /// Temperature read before the gate.
    pub temperature: Option<f64>,
    /// True when the operator overrode the temperature gate.
    pub overridden: bool,
}

impl ShutdownReport {
    /// Record a step outcome. Failures are kept; the sequence carries on.
    pub fn record(&mut self, name: &'static str, result: Result<(), CamError>) {
        let error = match result {
            Ok(()) => None,
            Err(err) => {
                let text = err.to_string();
                self.errors.push(err);
                Some(text)
            }
        };
        self.steps.push(ShutdownStep { name, error });
    }

    /// Names of the steps that ran.
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name).collect()
    }

    /// True when every step succeeded.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// `Err(ShutdownFailed)` when any step failed.
    pub fn into_result(self) -> Result<Self, CamError> {
        if self.errors.is_empty() {
            Ok(self)
        } else {
            Err(CamError::ShutdownFailed(self.errors))
        }
    }
}

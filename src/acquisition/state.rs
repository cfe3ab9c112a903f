//! Acquisition state.

use serde::{Deserialize, Serialize};

/// Where the acquisition controller is in its cycle.
///
/// Owned by [`AcquisitionController`](super::AcquisitionController); only its
/// transitions change it.
///
/// # State Machine
///
/// ```text
/// Idle ──arm──> Armed ──start──> Exposing ──poll: busy──> Exposing
///  ▲              ▲                 │
///  │              │            poll: idle
///  │              │                 ▼
///  │              └──more shots── LoopPending <──read ok── Retrieving
///  │                                │
///  │                           last shot
///  │                                ▼
///  └──────────(or re-arm)────── Complete
///
/// any ──abort──> Aborting ──> Idle
/// any ──device error──> Faulted ──arm──> Armed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcquisitionState {
    /// Nothing armed.
    Idle,
    /// Camera configured, not started.
    Armed,
    /// Started; waiting for the camera to go idle.
    Exposing,
    /// Reading the raw buffer.
    Retrieving,
    /// Shot stored; deciding whether to loop.
    LoopPending,
    /// Last shot stored; deriving images.
    Complete,
    /// Abort in progress.
    Aborting,
    /// Device error; needs a new arm.
    Faulted,
}

impl std::fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcquisitionState::Idle => write!(f, "Idle"),
            AcquisitionState::Armed => write!(f, "Armed"),
            AcquisitionState::Exposing => write!(f, "Exposing"),
            AcquisitionState::Retrieving => write!(f, "Retrieving"),
            AcquisitionState::LoopPending => write!(f, "LoopPending"),
            AcquisitionState::Complete => write!(f, "Complete"),
            AcquisitionState::Aborting => write!(f, "Aborting"),
            AcquisitionState::Faulted => write!(f, "Faulted"),
        }
    }
}

impl AcquisitionState {
    /// Check if the state allows arming.
    pub fn can_arm(&self) -> bool {
        matches!(
            self,
            AcquisitionState::Idle | AcquisitionState::Armed | AcquisitionState::Faulted
        )
    }

    /// Check if the state allows starting.
    pub fn can_start(&self) -> bool {
        matches!(self, AcquisitionState::Armed)
    }

    /// Check if the controller may move from this state to `to`.
    ///
    /// Abort and device errors are accepted from anywhere. A failed arm or
    /// start falls back to `Idle`.
    pub fn can_transition_to(&self, to: AcquisitionState) -> bool {
        use AcquisitionState::*;
        match (*self, to) {
            (_, Aborting | Faulted) => true,
            (Aborting, Idle) => true,
            (Idle | Armed | Faulted, Armed | Idle) => true,
            (Armed, Exposing) => true,
            (Exposing, Retrieving) => true,
            (Retrieving, LoopPending) => true,
            (LoopPending, Armed | Complete) => true,
            (Complete, Armed | Idle) => true,
            _ => false,
        }
    }

    /// True while the controller owns the device port exclusively.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            AcquisitionState::Exposing
                | AcquisitionState::Retrieving
                | AcquisitionState::LoopPending
        )
    }
}

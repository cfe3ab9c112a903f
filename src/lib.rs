//! # krbcam
//!
//! Control library for an EMCCD camera on a cold-atom experiment. It configures
//! acquisitions, drives single-frame and fast-kinetics exposure loops, turns
//! the raw sensor buffer into frames, derives optical-density and fluorescence
//! images, and keeps the sensor from being powered down while it is cold.
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: Config validation and the `AcquisitionController` state
//!   machine (arm, start, poll, loop, abort).
//! - **`config`**: `CameraSettings` loaded through figment (defaults, TOML,
//!   `KRBCAM_` environment) and the per-acquisition `AcquisitionConfig`.
//! - **`error`**: The `CamError` enum shared by every layer.
//! - **`frames`**: Frame assembly from raw buffers and derived image computation.
//! - **`hardware`**: The `DevicePort` trait, status code table and the
//!   `SimulatedCamera` used by tests and the CLI.
//! - **`logging`**: tracing-subscriber initialization.
//! - **`runtime`**: tokio task driving a session from commands and wall-clock time.
//! - **`scheduler`**: Deferred-callback queue with idempotent cancellation.
//! - **`session`**: `CameraSession`, the owner of one opened camera.
//! - **`shutdown`**: Temperature-gated shutdown prompts and reports.
//! - **`status`**: Operator-facing status log.
//! - **`storage`**: `FrameSink` trait and the CSV writer.
//! - **`thermal`**: Cooler control and the thermal safety monitor.

pub mod acquisition;
pub mod config;
pub mod error;
pub mod frames;
pub mod hardware;
pub mod logging;
pub mod runtime;
pub mod scheduler;
pub mod session;
pub mod shutdown;
pub mod status;
pub mod storage;
pub mod thermal;

pub use error::{CamError, CamResult};

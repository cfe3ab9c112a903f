//! Device port: the narrow command surface the core drives the camera through.
//!
//! Every call answers with a vendor [`StatusCode`]. Calls that succeed return
//! `Ok`, anything else returns the raw code as `Err` so callers can map it to
//! a [`CamError`](crate::error::CamError) with the operation name attached.
//!
//! The trait is deliberately synchronous. The acquisition controller and the
//! thermal monitor never block on the port; waiting is expressed through the
//! [`TimerQueue`](crate::scheduler::TimerQueue) instead.

use super::codes::StatusCode;
use serde::{Deserialize, Serialize};

/// Result of a single port call.
pub type PortResult<T> = Result<T, StatusCode>;

// =============================================================================
// Mode enums
// =============================================================================

/// Trigger source for an acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Camera starts each exposure itself.
    Internal,
    /// Exposure waits for an external TTL edge.
    External,
}

impl TriggerMode {
    /// SDK integer for the mode.
    pub fn code(self) -> i32 {
        match self {
            TriggerMode::Internal => 0,
            TriggerMode::External => 1,
        }
    }

    /// Display name.
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerMode::Internal => "internal",
            TriggerMode::External => "external",
        }
    }
}

/// Cooling fan speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanMode {
    /// Full speed.
    Full,
    /// Low speed.
    Low,
    /// Fan off; the head relies on liquid cooling.
    Off,
}

impl FanMode {
    /// SDK integer for the mode.
    pub fn code(self) -> i32 {
        match self {
            FanMode::Full => 0,
            FanMode::Low => 1,
            FanMode::Off => 2,
        }
    }

    /// Display name.
    pub fn as_str(self) -> &'static str {
        match self {
            FanMode::Full => "full",
            FanMode::Low => "low",
            FanMode::Off => "off",
        }
    }
}

/// How the EM gain value is interpreted by the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmGainMode {
    /// DAC 0-255.
    Default,
    /// DAC 0-4095.
    Extended,
    /// Linear mode.
    Linear,
    /// Real EM gain.
    RealGain,
}

impl EmGainMode {
    /// SDK integer for the mode.
    pub fn code(self) -> i32 {
        match self {
            EmGainMode::Default => 0,
            EmGainMode::Extended => 1,
            EmGainMode::Linear => 2,
            EmGainMode::RealGain => 3,
        }
    }
}

/// Internal shutter behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutterMode {
    /// Camera opens and closes the shutter around each exposure.
    Auto,
    /// Shutter held open.
    Open,
    /// Shutter held closed.
    Closed,
}

impl ShutterMode {
    /// SDK integer for the mode.
    pub fn code(self) -> i32 {
        match self {
            ShutterMode::Auto => 0,
            ShutterMode::Open => 1,
            ShutterMode::Closed => 2,
        }
    }
}

/// Acquisition mode as understood by the SDK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionModeCode {
    /// One frame per start.
    Single,
    /// Fast-kinetics series per start.
    FastKinetics,
}

impl AcquisitionModeCode {
    /// SDK integer for the mode.
    pub fn code(self) -> i32 {
        match self {
            AcquisitionModeCode::Single => 1,
            AcquisitionModeCode::FastKinetics => 4,
        }
    }
}

/// SDK read mode for full images.
pub const READ_MODE_IMAGE: i32 = 4;

// =============================================================================
// Records exchanged with the port
// =============================================================================

/// Static facts read from the camera when the session opens.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCapabilities {
    /// Head model string.
    pub model: String,
    /// Detector width in pixels.
    pub detector_width: u32,
    /// Detector height in pixels.
    pub detector_height: u32,
    /// True when the head has an internal mechanical shutter.
    pub internal_shutter: bool,
    /// Minimum shutter (closing, opening) times in milliseconds.
    pub shutter_min_times_ms: (i32, i32),
    /// Supported cooler set-point range in degrees Celsius.
    pub temperature_range: (i32, i32),
    /// Vertical shift speeds for image mode, in microseconds per row.
    pub vertical_speeds_us: Vec<f32>,
    /// Vertical shift speeds for fast-kinetics mode, in microseconds per row.
    pub fk_vertical_speeds_us: Vec<f32>,
    /// Horizontal shift speeds, in MHz.
    pub horizontal_speeds_mhz: Vec<f32>,
    /// Number of AD channels.
    pub ad_channels: u32,
    /// Available pre-amp gains.
    pub preamp_gains: Vec<f32>,
}

impl DeviceCapabilities {
    /// True when the detector geometry is known.
    pub fn has_geometry(&self) -> bool {
        self.detector_width > 0 && self.detector_height > 0
    }
}

/// Shutter settings sent while arming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutterSettings {
    /// Requested mode.
    pub mode: ShutterMode,
    /// Closing time in milliseconds.
    pub closing_ms: i32,
    /// Opening time in milliseconds.
    pub opening_ms: i32,
}

/// Everything the arm command needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmSettings {
    /// Acquisition mode.
    pub acquisition_mode: AcquisitionModeCode,
    /// Read mode (always image).
    pub read_mode: i32,
    /// Shutter settings.
    pub shutter: ShutterSettings,
    /// Trigger source.
    pub trigger: TriggerMode,
    /// EM gain interpretation.
    pub em_gain_mode: EmGainMode,
}

/// Readout chain selection, by index into the capability tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadoutSettings {
    /// Vertical shift speed index.
    pub vss_index: u32,
    /// Horizontal shift speed index.
    pub hss_index: u32,
    /// AD channel.
    pub ad_channel: u32,
    /// Pre-amp gain index.
    pub preamp_index: u32,
}

/// Region of interest in unbinned detector pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roi {
    /// Column offset.
    pub x: u32,
    /// Row offset.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Roi {
    /// True when the region lies inside a `width` x `height` detector.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.width > 0
            && self.height > 0
            && self.x.saturating_add(self.width) <= width
            && self.y.saturating_add(self.height) <= height
    }
}

/// Fast-kinetics series setup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FastKineticsSetup {
    /// Exposed rows (unbinned) per sub-frame.
    pub exposed_rows: u32,
    /// Sub-frames per start.
    pub series_length: u32,
    /// Exposure per sub-frame, seconds.
    pub exposure_s: f32,
    /// Bin factor applied on both axes.
    pub bin: u32,
    /// Row offset of the exposed region.
    pub y_offset: u32,
}

/// Single-image setup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageSetup {
    /// Readout region.
    pub roi: Roi,
    /// Bin factor applied on both axes.
    pub bin: u32,
    /// Exposure, seconds.
    pub exposure_s: f32,
}

/// Timings the camera actually applied after setup.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AcquisitionTimings {
    /// Exposure, seconds.
    pub exposure_s: f32,
    /// Accumulate cycle, seconds.
    pub accumulate_s: f32,
    /// Kinetic cycle, seconds.
    pub kinetic_s: f32,
    /// Readout time, seconds.
    pub readout_s: f32,
}

/// Reply to an acquisition status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionStatus {
    /// Still exposing or reading out.
    Busy,
    /// Data is ready.
    Idle,
    /// Any other status reply.
    Error(StatusCode),
}

impl AcquisitionStatus {
    /// Map a raw status reply.
    pub fn from_code(code: StatusCode) -> Self {
        match code {
            StatusCode::ACQUIRING => AcquisitionStatus::Busy,
            StatusCode::IDLE => AcquisitionStatus::Idle,
            other => AcquisitionStatus::Error(other),
        }
    }
}

// =============================================================================
// Port trait
// =============================================================================

/// Command surface of the camera.
///
/// Implementations own the underlying handle. Dropping a port must not shut
/// the camera down; teardown only happens through [`DevicePort::shutdown`]
/// once the thermal safety gate has passed.
pub trait DevicePort: Send {
    /// Initialise the SDK and the camera head.
    fn initialize(&mut self) -> PortResult<()>;

    /// Read the static capability tables.
    fn capabilities(&mut self) -> PortResult<DeviceCapabilities>;

    /// Set the cooling fan speed.
    fn set_fan_mode(&mut self, mode: FanMode) -> PortResult<()>;

    /// Set acquisition, read, shutter, trigger and EM gain modes.
    fn arm(&mut self, settings: &ArmSettings) -> PortResult<()>;

    /// EM gain range for the current gain mode.
    fn em_gain_range(&mut self) -> PortResult<(i32, i32)>;

    /// Set the EM gain (0 disables multiplication).
    fn set_em_gain(&mut self, gain: i32) -> PortResult<()>;

    /// Select the readout chain.
    fn set_readout(&mut self, readout: &ReadoutSettings) -> PortResult<()>;

    /// Configure a fast-kinetics series.
    fn set_fast_kinetics(&mut self, setup: &FastKineticsSetup) -> PortResult<()>;

    /// Configure a single-image readout.
    fn set_image(&mut self, setup: &ImageSetup) -> PortResult<()>;

    /// Timings the camera settled on.
    fn acquisition_timings(&mut self) -> PortResult<AcquisitionTimings>;

    /// Start the armed acquisition.
    fn start(&mut self) -> PortResult<()>;

    /// Query acquisition status.
    fn poll_status(&mut self) -> PortResult<AcquisitionStatus>;

    /// Read `len` pixels of the completed acquisition.
    fn read_buffer(&mut self, len: usize) -> PortResult<Vec<i32>>;

    /// Abort the running acquisition. Replies `Err(IDLE)` when nothing runs.
    fn abort(&mut self) -> PortResult<()>;

    /// Force the shutter closed.
    fn close_shutter(&mut self) -> PortResult<()>;

    /// Set the cooler target in degrees Celsius.
    fn set_cooler_target(&mut self, celsius: i32) -> PortResult<()>;

    /// Switch the cooler on.
    fn cooler_on(&mut self) -> PortResult<()>;

    /// Switch the cooler off.
    fn cooler_off(&mut self) -> PortResult<()>;

    /// Sensor temperature with the temperature status reply.
    fn temperature(&mut self) -> (StatusCode, f64);

    /// Release the camera and the SDK.
    fn shutdown(&mut self) -> PortResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roi_bounds() {
        let roi = Roi {
            x: 10,
            y: 0,
            width: 502,
            height: 512,
        };
        assert!(roi.fits_within(512, 512));
        assert!(!roi.fits_within(511, 512));
        let empty = Roi { width: 0, ..roi };
        assert!(!empty.fits_within(512, 512));
    }

    #[test]
    fn status_reply_mapping() {
        assert_eq!(
            AcquisitionStatus::from_code(StatusCode::ACQUIRING),
            AcquisitionStatus::Busy
        );
        assert_eq!(
            AcquisitionStatus::from_code(StatusCode::IDLE),
            AcquisitionStatus::Idle
        );
        assert_eq!(
            AcquisitionStatus::from_code(StatusCode::TEMP_CYCLE),
            AcquisitionStatus::Error(StatusCode::TEMP_CYCLE)
        );
    }

    #[test]
    fn sdk_mode_codes() {
        assert_eq!(TriggerMode::External.code(), 1);
        assert_eq!(FanMode::Off.code(), 2);
        assert_eq!(EmGainMode::RealGain.code(), 3);
        assert_eq!(AcquisitionModeCode::FastKinetics.code(), 4);
        assert_eq!(ShutterMode::Closed.code(), 2);
    }
}

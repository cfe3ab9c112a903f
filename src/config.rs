//! Configuration using Figment.
//!
//! Two kinds of configuration live here:
//!
//! - [`CameraSettings`]: process-wide settings that used to be scattered
//!   constants (trigger mode, fan mode, safe shutdown temperature, save path).
//!   Loaded once at startup and passed by reference into session construction.
//!   Sources, lowest to highest precedence:
//!   1. built-in defaults
//!   2. a TOML file (`config/krbcam.toml` by default)
//!   3. environment variables prefixed with `KRBCAM_`, `__` separating sections
//!      (`KRBCAM_THERMAL__SAFE_SHUTDOWN_C=-15`)
//! - [`AcquisitionConfig`]: the per-acquisition record supplied by the
//!   operator as JSON, with the field names the lab's existing config files use.
//!
//! # Example
//! ```no_run
//! use krbcam::config::CameraSettings;
//!
//! let settings = CameraSettings::load()?;
//! settings.validate()?;
//! println!("Saving under {}", settings.storage.save_root.display());
//! # Ok::<(), krbcam::error::CamError>(())
//! ```

use crate::error::{CamError, CamResult};
use crate::hardware::{EmGainMode, FanMode, ShutterMode, TriggerMode};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default settings file.
pub const DEFAULT_SETTINGS_PATH: &str = "config/krbcam.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "KRBCAM_";

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CameraSettings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationSettings,
    /// Acquisition sequencing
    #[serde(default)]
    pub acquisition: AcquisitionSettings,
    /// Cooling and shutdown safety
    #[serde(default)]
    pub thermal: ThermalSettings,
    /// Derived image constants
    #[serde(default)]
    pub imaging: ImagingSettings,
    /// Where and how data is saved
    #[serde(default)]
    pub storage: StorageSettings,
}

/// Application-level settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Acquisition sequencing settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionSettings {
    /// Trigger source
    #[serde(default = "default_trigger_mode")]
    pub trigger_mode: TriggerMode,
    /// EM gain interpretation
    #[serde(default = "default_em_gain_mode")]
    pub em_gain_mode: EmGainMode,
    /// Shutter mode used while acquiring
    #[serde(default = "default_shutter_mode")]
    pub shutter_mode: ShutterMode,
    /// Maximum exposed rows in fast-kinetics mode
    #[serde(default = "default_exposed_rows")]
    pub exposed_rows: u32,
    /// Bin factor applied when binning is enabled
    #[serde(default = "default_bin_size")]
    pub bin_size: u32,
    /// Status poll interval with an external trigger
    #[serde(default = "default_external_poll_ms")]
    pub external_poll_interval_ms: u64,
    /// Status poll interval with the internal trigger
    #[serde(default = "default_internal_poll_ms")]
    pub internal_poll_interval_ms: u64,
    /// Re-arm after every completed loop (external trigger only)
    #[serde(default = "default_true")]
    pub continuous_loop: bool,
}

/// Cooling and shutdown safety settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermalSettings {
    /// Cooler target used at startup
    #[serde(default = "default_target_c")]
    pub default_target_c: i32,
    /// Lowest target ever sent to the camera
    #[serde(default = "default_min_target_c")]
    pub min_target_c: i32,
    /// Highest target ever sent to the camera
    #[serde(default = "default_max_target_c")]
    pub max_target_c: i32,
    /// Sensor must be at least this warm before the camera may be shut down
    #[serde(default = "default_safe_shutdown_c")]
    pub safe_shutdown_c: f64,
    /// Temperature poll interval
    #[serde(default = "default_temperature_poll_ms")]
    pub poll_interval_ms: u64,
    /// Fan mode applied when the session opens
    #[serde(default = "default_fan_mode")]
    pub fan_mode: FanMode,
}

/// Derived image constants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagingSettings {
    /// OD ceiling
    #[serde(default = "default_od_max")]
    pub od_max: f64,
    /// Saturation count constant in the OD correction term
    #[serde(default = "default_saturation_counts")]
    pub saturation_counts: f64,
    /// Number of independently imaged species
    #[serde(default = "default_species_slots")]
    pub species_slots: usize,
}

/// Data saving settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Root directory for saved data
    #[serde(default = "default_save_root")]
    pub save_root: PathBuf,
    /// Folder created inside each dated directory
    #[serde(default = "default_folder")]
    pub folder: String,
    /// File name prefix
    #[serde(default = "default_filename_base")]
    pub filename_base: String,
    /// Write raw frames to disk
    #[serde(default = "default_true")]
    pub save_files: bool,
    /// Insert `YYYY/MM/YYYYMMDD` between the root and the folder
    #[serde(default = "default_true")]
    pub dated_subdirectories: bool,
    /// Also write derived images
    #[serde(default)]
    pub save_derived: bool,
}

fn default_name() -> String {
    "krbcam".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_trigger_mode() -> TriggerMode {
    TriggerMode::External
}

fn default_em_gain_mode() -> EmGainMode {
    EmGainMode::RealGain
}

fn default_shutter_mode() -> ShutterMode {
    ShutterMode::Open
}

fn default_exposed_rows() -> u32 {
    512
}

fn default_bin_size() -> u32 {
    2
}

fn default_external_poll_ms() -> u64 {
    100
}

fn default_internal_poll_ms() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_target_c() -> i32 {
    -20
}

fn default_min_target_c() -> i32 {
    -70
}

fn default_max_target_c() -> i32 {
    20
}

fn default_safe_shutdown_c() -> f64 {
    -20.0
}

fn default_temperature_poll_ms() -> u64 {
    4000
}

fn default_fan_mode() -> FanMode {
    FanMode::Off
}

fn default_od_max() -> f64 {
    10.0
}

fn default_saturation_counts() -> f64 {
    2200.0
}

fn default_species_slots() -> usize {
    2
}

fn default_save_root() -> PathBuf {
    PathBuf::from("data")
}

fn default_folder() -> String {
    "Andor".to_string()
}

fn default_filename_base() -> String {
    "ixon".to_string()
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            trigger_mode: default_trigger_mode(),
            em_gain_mode: default_em_gain_mode(),
            shutter_mode: default_shutter_mode(),
            exposed_rows: default_exposed_rows(),
            bin_size: default_bin_size(),
            external_poll_interval_ms: default_external_poll_ms(),
            internal_poll_interval_ms: default_internal_poll_ms(),
            continuous_loop: true,
        }
    }
}

impl Default for ThermalSettings {
    fn default() -> Self {
        Self {
            default_target_c: default_target_c(),
            min_target_c: default_min_target_c(),
            max_target_c: default_max_target_c(),
            safe_shutdown_c: default_safe_shutdown_c(),
            poll_interval_ms: default_temperature_poll_ms(),
            fan_mode: default_fan_mode(),
        }
    }
}

impl Default for ImagingSettings {
    fn default() -> Self {
        Self {
            od_max: default_od_max(),
            saturation_counts: default_saturation_counts(),
            species_slots: default_species_slots(),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            save_root: default_save_root(),
            folder: default_folder(),
            filename_base: default_filename_base(),
            save_files: true,
            dated_subdirectories: true,
            save_derived: false,
        }
    }
}

impl AcquisitionSettings {
    /// Status poll interval for the configured trigger mode.
    pub fn poll_interval(&self) -> Duration {
        match self.trigger_mode {
            TriggerMode::External => Duration::from_millis(self.external_poll_interval_ms),
            TriggerMode::Internal => Duration::from_millis(self.internal_poll_interval_ms),
        }
    }

    /// Whether a completed loop re-arms itself.
    pub fn loops_continuously(&self) -> bool {
        self.continuous_loop && self.trigger_mode == TriggerMode::External
    }
}

impl ThermalSettings {
    /// Temperature poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl CameraSettings {
    /// Load settings from the default file and the environment.
    pub fn load() -> CamResult<Self> {
        Self::load_from(DEFAULT_SETTINGS_PATH)
    }

    /// Load settings from a specific file path and the environment.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> CamResult<Self> {
        let settings = Self::figment(path.as_ref()).extract()?;
        Ok(settings)
    }

    /// The provider stack used by [`CameraSettings::load_from`].
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(CameraSettings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Reject settings that are well-formed but inconsistent.
    pub fn validate(&self) -> CamResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(CamError::Config(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let acq = &self.acquisition;
        if acq.bin_size == 0 {
            return Err(CamError::Config("bin_size must be at least 1".into()));
        }
        if acq.exposed_rows == 0 {
            return Err(CamError::Config("exposed_rows must be at least 1".into()));
        }
        if acq.external_poll_interval_ms == 0 || acq.internal_poll_interval_ms == 0 {
            return Err(CamError::Config(
                "acquisition poll intervals must be non-zero".into(),
            ));
        }

        let thermal = &self.thermal;
        if thermal.min_target_c > thermal.max_target_c {
            return Err(CamError::Config(format!(
                "min_target_c ({}) is above max_target_c ({})",
                thermal.min_target_c, thermal.max_target_c
            )));
        }
        if thermal.poll_interval_ms == 0 {
            return Err(CamError::Config(
                "temperature poll interval must be non-zero".into(),
            ));
        }
        if !thermal.safe_shutdown_c.is_finite() {
            return Err(CamError::Config("safe_shutdown_c must be finite".into()));
        }

        let imaging = &self.imaging;
        if imaging.saturation_counts.is_nan() || imaging.saturation_counts <= 0.0 {
            return Err(CamError::Config(
                "saturation_counts must be positive".into(),
            ));
        }
        if !imaging.od_max.is_finite() {
            return Err(CamError::Config("od_max must be finite".into()));
        }
        if imaging.species_slots == 0 {
            return Err(CamError::Config("species_slots must be at least 1".into()));
        }

        if self.storage.filename_base.is_empty() {
            return Err(CamError::Config("filename_base must not be empty".into()));
        }

        Ok(())
    }

    /// Render the effective settings as TOML.
    pub fn to_toml(&self) -> CamResult<String> {
        toml::to_string_pretty(self).map_err(|e| CamError::Config(e.to_string()))
    }
}

// =============================================================================
// Per-acquisition configuration
// =============================================================================

/// Parameters of one acquisition, as supplied by the operator.
///
/// Field names follow the JSON files used on the experiment. Missing fields
/// take the documented defaults; unknown fields are ignored. Values are
/// validated and clamped against the camera when the acquisition is armed,
/// see [`crate::acquisition::validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Exposure time in milliseconds.
    #[serde(rename = "expTime")]
    pub exp_time_ms: f64,
    /// ROI column offset.
    #[serde(rename = "xOffset")]
    pub x_offset: u32,
    /// ROI row offset.
    #[serde(rename = "yOffset")]
    pub y_offset: u32,
    /// ROI width, unbinned pixels.
    pub dx: u32,
    /// ROI height, unbinned pixels.
    pub dy: u32,
    /// Bin pixels by the configured bin factor.
    pub binning: bool,
    /// Enable EM gain.
    #[serde(rename = "emEnable")]
    pub em_enable: bool,
    /// EM gain value.
    #[serde(rename = "emGain")]
    pub em_gain: i32,
    /// Fast-kinetics frames per shot. 1 selects single-frame mode.
    #[serde(rename = "kinFrames")]
    pub kin_frames: u32,
    /// Shots per acquisition loop.
    #[serde(rename = "acqLength")]
    pub acq_length: u32,
    /// Vertical shift speed index.
    pub vss: u32,
    /// Horizontal shift speed index.
    pub hss: u32,
    /// AD channel.
    #[serde(rename = "adChannel")]
    pub ad_channel: u32,
    /// Pre-amp gain index.
    #[serde(rename = "preAmpGain")]
    pub pre_amp_gain: u32,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            exp_time_ms: 1.0,
            x_offset: 0,
            y_offset: 0,
            dx: 500,
            dy: 512,
            binning: true,
            em_enable: false,
            em_gain: 1,
            kin_frames: 2,
            acq_length: 3,
            vss: 3,
            hss: 0,
            ad_channel: 0,
            pre_amp_gain: 0,
        }
    }
}

impl AcquisitionConfig {
    /// Parse a JSON record.
    pub fn from_json_str(json: &str) -> CamResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| CamError::Config(format!("acquisition config: {e}")))
    }

    /// Read and parse a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> CamResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let settings = CameraSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.thermal.safe_shutdown_c, -20.0);
        assert_eq!(settings.acquisition.poll_interval(), Duration::from_millis(100));
        assert!(settings.acquisition.loops_continuously());
    }

    #[test]
    fn internal_trigger_polls_slower_and_never_loops() {
        let acq = AcquisitionSettings {
            trigger_mode: TriggerMode::Internal,
            ..AcquisitionSettings::default()
        };
        assert_eq!(acq.poll_interval(), Duration::from_millis(300));
        assert!(!acq.loops_continuously());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = CameraSettings::default();
        settings.application.log_level = "loud".to_string();
        assert!(matches!(settings.validate(), Err(CamError::Config(_))));
    }

    #[test]
    fn inverted_temperature_bounds_are_rejected() {
        let mut settings = CameraSettings::default();
        settings.thermal.min_target_c = 30;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("min_target_c"));
    }

    #[test]
    fn acquisition_config_fills_missing_fields() {
        let config = AcquisitionConfig::from_json_str(r#"{"kinFrames": 1, "expTime": 5.5}"#)
            .unwrap();
        assert_eq!(config.kin_frames, 1);
        assert_eq!(config.exp_time_ms, 5.5);
        assert_eq!(config.acq_length, 3);
        assert_eq!(config.dx, 500);
        assert!(config.binning);
    }

    #[test]
    fn acquisition_config_rejects_bad_json() {
        let err = AcquisitionConfig::from_json_str(r#"{"dx": "wide"}"#).unwrap_err();
        assert!(matches!(err, CamError::Config(_)));
    }

    #[test]
    fn settings_render_as_toml() {
        let text = CameraSettings::default().to_toml().unwrap();
        assert!(text.contains("[thermal]"));
        assert!(text.contains("safe_shutdown_c = -20.0"));
    }
}

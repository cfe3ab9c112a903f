//! Acquisition config validation.
//!
//! [`validate`] repairs an [`AcquisitionConfig`] against what the camera
//! reported, clamping wherever a safe value exists and recording every change
//! it makes. Only missing capability data is fatal.
//!
//! The acquisition mode is decided here, once: `kinFrames == 1` is a
//! single-frame run, anything larger is a fast-kinetics series. The result is
//! the [`AcquisitionMode`] variant the rest of the run dispatches on.

use crate::config::{AcquisitionConfig, AcquisitionSettings};
use crate::error::{CamError, CamResult};
use crate::frames::DerivationMode;
use crate::hardware::{
    AcquisitionModeCode, DeviceCapabilities, FastKineticsSetup, ImageSetup, ReadoutSettings, Roi,
};

/// Mode-specific setup, chosen at arm time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AcquisitionMode {
    /// Fast-kinetics series; absorption imaging.
    FastKinetics(FastKineticsSetup),
    /// Single frame per start; fluorescence imaging.
    Single(ImageSetup),
}

impl AcquisitionMode {
    /// SDK acquisition mode.
    pub fn code(&self) -> AcquisitionModeCode {
        match self {
            AcquisitionMode::FastKinetics(_) => AcquisitionModeCode::FastKinetics,
            AcquisitionMode::Single(_) => AcquisitionModeCode::Single,
        }
    }

    /// Derived image computation for this mode.
    pub fn derivation(&self) -> DerivationMode {
        match self {
            AcquisitionMode::FastKinetics(_) => DerivationMode::Absorption,
            AcquisitionMode::Single(_) => DerivationMode::Fluorescence,
        }
    }

    /// Frames delivered per start.
    pub fn frames_per_shot(&self) -> u32 {
        match self {
            AcquisitionMode::FastKinetics(fk) => fk.series_length,
            AcquisitionMode::Single(_) => 1,
        }
    }
}

/// A config that is safe to send to the camera.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedConfig {
    /// The repaired config.
    pub config: AcquisitionConfig,
    /// Mode and its setup.
    pub mode: AcquisitionMode,
    /// Bin factor in effect (1 when binning is off).
    pub bin: u32,
    /// Binned frame width.
    pub frame_width: usize,
    /// Binned frame height.
    pub frame_height: usize,
    /// Human-readable list of changes made to the input.
    pub adjustments: Vec<String>,
}

impl ValidatedConfig {
    /// Pixels in the raw buffer of one start.
    pub fn buffer_len(&self) -> usize {
        self.mode.frames_per_shot() as usize * self.frame_width * self.frame_height
    }

    /// Shots per loop.
    pub fn shots(&self) -> u32 {
        self.config.acq_length
    }

    /// ROI in unbinned pixels.
    pub fn roi(&self) -> Roi {
        Roi {
            x: self.config.x_offset,
            y: self.config.y_offset,
            width: self.config.dx,
            height: self.config.dy,
        }
    }

    /// Readout chain selection.
    pub fn readout(&self) -> ReadoutSettings {
        ReadoutSettings {
            vss_index: self.config.vss,
            hss_index: self.config.hss,
            ad_channel: self.config.ad_channel,
            preamp_index: self.config.pre_amp_gain,
        }
    }
}

/// Clamp one index into a table of `len` entries.
fn clamp_index(
    name: &str,
    value: &mut u32,
    len: usize,
    adjustments: &mut Vec<String>,
) -> CamResult<()> {
    if len == 0 {
        return Err(CamError::Config(format!(
            "camera reported no {name} options"
        )));
    }
    let max = u32::try_from(len - 1).unwrap_or(u32::MAX);
    if *value > max {
        adjustments.push(format!("{name} index {value} out of range, using {max}"));
        *value = max;
    }
    Ok(())
}

/// Clamp an offset and length into `[0, limit)` as whole bins.
fn clamp_span(
    axis: (&str, &str),
    offset: &mut u32,
    length: &mut u32,
    limit: u32,
    bin: u32,
    adjustments: &mut Vec<String>,
) {
    let (offset_name, length_name) = axis;
    if *offset >= limit {
        adjustments.push(format!(
            "{offset_name} {offset} exceeds limit {limit}, using {}",
            limit - 1
        ));
        *offset = limit - 1;
    }
    let room = limit - *offset;
    let mut new_length = (*length).min(room);
    new_length -= new_length % bin;
    if new_length == 0 {
        if room < bin {
            let shifted = limit - bin;
            adjustments.push(format!(
                "{offset_name} {offset} leaves less than one bin, using {shifted}"
            ));
            *offset = shifted;
        }
        new_length = bin;
    }
    if new_length != *length {
        adjustments.push(format!(
            "{length_name} {length} adjusted to {new_length}"
        ));
        *length = new_length;
    }
}

/// Validate and repair `input` against the camera.
pub fn validate(
    input: &AcquisitionConfig,
    caps: &DeviceCapabilities,
    em_gain_range: (i32, i32),
    settings: &AcquisitionSettings,
) -> CamResult<ValidatedConfig> {
    if !caps.has_geometry() {
        return Err(CamError::Config(
            "camera did not report its detector size".to_string(),
        ));
    }
    if settings.bin_size == 0 {
        return Err(CamError::Config("bin size must be at least 1".to_string()));
    }

    let mut config = input.clone();
    let mut adjustments = Vec::new();

    if config.kin_frames == 0 {
        adjustments.push("kinFrames 0 adjusted to 1".to_string());
        config.kin_frames = 1;
    }
    if config.acq_length == 0 {
        adjustments.push("acqLength 0 adjusted to 1".to_string());
        config.acq_length = 1;
    }
    if !config.exp_time_ms.is_finite() || config.exp_time_ms < 0.0 {
        adjustments.push(format!("expTime {} adjusted to 0", config.exp_time_ms));
        config.exp_time_ms = 0.0;
    }

    let fast_kinetics = config.kin_frames > 1;
    let bin = if config.binning { settings.bin_size } else { 1 };
    let x_limit = caps.detector_width;
    let y_limit = if fast_kinetics {
        settings
            .exposed_rows
            .min(caps.detector_height / config.kin_frames)
    } else {
        caps.detector_height
    };
    if x_limit < bin || y_limit < bin {
        return Err(CamError::Config(format!(
            "a {} frame series with bin {bin} does not fit a {}x{} detector",
            config.kin_frames, caps.detector_width, caps.detector_height
        )));
    }

    if fast_kinetics {
        let full_width = x_limit - x_limit % bin;
        if config.x_offset != 0 || config.dx != full_width {
            adjustments.push(format!(
                "fast kinetics reads full rows: xOffset 0, dx {full_width}"
            ));
        }
        config.x_offset = 0;
        config.dx = full_width;
    } else {
        clamp_span(
            ("xOffset", "dx"),
            &mut config.x_offset,
            &mut config.dx,
            x_limit,
            bin,
            &mut adjustments,
        );
    }
    clamp_span(
        ("yOffset", "dy"),
        &mut config.y_offset,
        &mut config.dy,
        y_limit,
        bin,
        &mut adjustments,
    );

    if config.em_enable {
        let (lo, hi) = em_gain_range;
        if lo > hi {
            return Err(CamError::Config(format!(
                "camera reported an invalid EM gain range ({lo}, {hi})"
            )));
        }
        let clamped = config.em_gain.clamp(lo, hi);
        if clamped != config.em_gain {
            adjustments.push(format!(
                "emGain {} outside ({lo}, {hi}), using {clamped}",
                config.em_gain
            ));
            config.em_gain = clamped;
        }
    } else {
        config.em_gain = 0;
    }

    let vertical_speeds = if fast_kinetics {
        &caps.fk_vertical_speeds_us
    } else {
        &caps.vertical_speeds_us
    };
    clamp_index("vertical speed", &mut config.vss, vertical_speeds.len(), &mut adjustments)?;
    clamp_index(
        "horizontal speed",
        &mut config.hss,
        caps.horizontal_speeds_mhz.len(),
        &mut adjustments,
    )?;
    clamp_index(
        "AD channel",
        &mut config.ad_channel,
        caps.ad_channels as usize,
        &mut adjustments,
    )?;
    clamp_index(
        "pre-amp gain",
        &mut config.pre_amp_gain,
        caps.preamp_gains.len(),
        &mut adjustments,
    )?;

    let exposure_s = (config.exp_time_ms / 1000.0) as f32;
    let mode = if fast_kinetics {
        AcquisitionMode::FastKinetics(FastKineticsSetup {
            exposed_rows: config.dy,
            series_length: config.kin_frames,
            exposure_s,
            bin,
            y_offset: config.y_offset,
        })
    } else {
        AcquisitionMode::Single(ImageSetup {
            roi: Roi {
                x: config.x_offset,
                y: config.y_offset,
                width: config.dx,
                height: config.dy,
            },
            bin,
            exposure_s,
        })
    };

    Ok(ValidatedConfig {
        frame_width: (config.dx / bin) as usize,
        frame_height: (config.dy / bin) as usize,
        config,
        mode,
        bin,
        adjustments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SimulatedCamera;
    use crate::hardware::DevicePort;

    fn caps() -> DeviceCapabilities {
        let mut cam = SimulatedCamera::new();
        cam.initialize().unwrap();
        cam.capabilities().unwrap()
    }

    fn single(config: AcquisitionConfig) -> AcquisitionConfig {
        AcquisitionConfig {
            kin_frames: 1,
            ..config
        }
    }

    #[test]
    fn single_frame_roi_is_clamped_into_detector() {
        let input = single(AcquisitionConfig {
            x_offset: 600,
            y_offset: 100,
            dx: 500,
            dy: 500,
            ..AcquisitionConfig::default()
        });
        let v = validate(&input, &caps(), (1, 1000), &AcquisitionSettings::default()).unwrap();
        // offset pulled back so one bin still fits
        assert_eq!(v.config.dx, 2);
        assert_eq!(v.config.x_offset, 510);
        assert_eq!(v.config.dy, 412);
        assert!(v.roi().fits_within(512, 512));
        assert!(!v.adjustments.is_empty());
        assert!(matches!(v.mode, AcquisitionMode::Single(_)));
    }

    #[test]
    fn binned_dimensions_are_whole_bins() {
        let input = single(AcquisitionConfig {
            dx: 201,
            dy: 99,
            ..AcquisitionConfig::default()
        });
        let v = validate(&input, &caps(), (1, 1000), &AcquisitionSettings::default()).unwrap();
        assert_eq!(v.config.dx, 200);
        assert_eq!(v.config.dy, 98);
        assert_eq!((v.frame_width, v.frame_height), (100, 49));
        assert_eq!(v.buffer_len(), 100 * 49);
    }

    #[test]
    fn fast_kinetics_limits_rows_and_forces_full_width() {
        let input = AcquisitionConfig {
            kin_frames: 4,
            x_offset: 30,
            dx: 100,
            dy: 512,
            ..AcquisitionConfig::default()
        };
        let v = validate(&input, &caps(), (1, 1000), &AcquisitionSettings::default()).unwrap();
        assert_eq!(v.config.x_offset, 0);
        assert_eq!(v.config.dx, 512);
        assert_eq!(v.config.dy, 128);
        match v.mode {
            AcquisitionMode::FastKinetics(fk) => {
                assert_eq!(fk.series_length, 4);
                assert_eq!(fk.exposed_rows, 128);
                assert_eq!(fk.bin, 2);
            }
            other => panic!("expected fast kinetics, got {other:?}"),
        }
        assert_eq!(v.buffer_len(), 4 * 64 * 256);
        assert_eq!(v.mode.derivation(), DerivationMode::Absorption);
    }

    #[test]
    fn em_gain_clamped_or_zeroed() {
        let caps = caps();
        let settings = AcquisitionSettings::default();
        let enabled = AcquisitionConfig {
            em_enable: true,
            em_gain: 5000,
            ..AcquisitionConfig::default()
        };
        assert_eq!(validate(&enabled, &caps, (1, 300), &settings).unwrap().config.em_gain, 300);

        let disabled = AcquisitionConfig {
            em_enable: false,
            em_gain: 50,
            ..AcquisitionConfig::default()
        };
        assert_eq!(validate(&disabled, &caps, (1, 300), &settings).unwrap().config.em_gain, 0);
    }

    #[test]
    fn missing_capabilities_are_fatal() {
        let settings = AcquisitionSettings::default();
        let mut no_geometry = caps();
        no_geometry.detector_width = 0;
        assert!(matches!(
            validate(&AcquisitionConfig::default(), &no_geometry, (1, 10), &settings),
            Err(CamError::Config(_))
        ));

        let mut no_speeds = caps();
        no_speeds.horizontal_speeds_mhz.clear();
        assert!(matches!(
            validate(&AcquisitionConfig::default(), &no_speeds, (1, 10), &settings),
            Err(CamError::Config(_))
        ));

        let em = AcquisitionConfig {
            em_enable: true,
            ..AcquisitionConfig::default()
        };
        assert!(matches!(
            validate(&em, &caps(), (10, 1), &settings),
            Err(CamError::Config(_))
        ));
    }

    #[test]
    fn indices_and_counts_are_repaired() {
        let input = AcquisitionConfig {
            kin_frames: 0,
            acq_length: 0,
            exp_time_ms: f64::NAN,
            vss: 99,
            hss: 99,
            ad_channel: 3,
            pre_amp_gain: 7,
            ..AcquisitionConfig::default()
        };
        let v = validate(&input, &caps(), (1, 1000), &AcquisitionSettings::default()).unwrap();
        assert_eq!(v.config.kin_frames, 1);
        assert_eq!(v.shots(), 1);
        assert_eq!(v.config.exp_time_ms, 0.0);
        assert_eq!(v.readout().vss_index, 4);
        assert_eq!(v.readout().hss_index, 3);
        assert_eq!(v.readout().ad_channel, 0);
        assert_eq!(v.readout().preamp_index, 2);
    }

    #[test]
    fn roi_always_within_detector_for_any_input() {
        let caps = caps();
        let settings = AcquisitionSettings::default();
        for &kin in &[1u32, 2, 3, 5] {
            for &binning in &[true, false] {
                for &(x, y, dx, dy) in &[
                    (0, 0, 0, 0),
                    (511, 511, 1, 1),
                    (1000, 1000, 1000, 1000),
                    (3, 7, 509, 505),
                    (256, 0, u32::MAX, 17),
                ] {
                    let input = AcquisitionConfig {
                        kin_frames: kin,
                        binning,
                        x_offset: x,
                        y_offset: y,
                        dx,
                        dy,
                        ..AcquisitionConfig::default()
                    };
                    let v = validate(&input, &caps, (1, 1000), &settings).unwrap();
                    assert!(v.roi().fits_within(512, 512), "{input:?} -> {:?}", v.roi());
                    assert_eq!(v.config.dx % v.bin, 0);
                    assert_eq!(v.config.dy % v.bin, 0);
                    assert!(v.frame_width > 0 && v.frame_height > 0);
                }
            }
        }
    }
}

//! Simulated camera.
//!
//! [`SimulatedCamera`] implements [`DevicePort`] entirely in process. It models
//! the parts of the camera the core depends on:
//!
//! - acquisition status that stays busy for a configurable number of polls
//! - raw buffers, either queued by a test or filled with random counts
//! - a sensor temperature that walks toward the cooler target (or ambient when
//!   the cooler is off) by a fixed step on every temperature query
//! - one-shot fault injection per operation
//!
//! A [`SimHandle`] shares the same state so tests can script faults and inspect
//! what the core did after the camera has been moved into a session.
//!
//! # Example
//!
//! ```rust
//! use krbcam::hardware::{SimulatedCamera, StatusCode};
//!
//! let camera = SimulatedCamera::new();
//! let handle = camera.handle();
//! handle.fail_next("start", StatusCode::ERROR_ACK);
//! ```

use super::codes::StatusCode;
use super::device::{
    AcquisitionModeCode, AcquisitionStatus, AcquisitionTimings, ArmSettings, DeviceCapabilities,
    DevicePort, FanMode, FastKineticsSetup, ImageSetup, PortResult, ReadoutSettings, ShutterMode,
};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const AMBIENT_C: f64 = 20.0;
const DEFAULT_COOLING_STEP_C: f64 = 5.0;
const STABLE_BAND_C: f64 = 0.5;

// =============================================================================
// Shared state
// =============================================================================

struct SimState {
    caps: DeviceCapabilities,
    em_gain_range: (i32, i32),
    initialized: bool,
    shut_down: bool,

    acquisition_mode: Option<AcquisitionModeCode>,
    acquiring: bool,
    busy_polls: u32,
    busy_remaining: u32,
    starts: u32,
    expected_len: usize,
    exposure_s: f32,
    queued_buffers: VecDeque<Vec<i32>>,
    scripted_status: VecDeque<StatusCode>,

    shutter_open: bool,
    fan_mode: Option<FanMode>,
    em_gain: i32,

    cooler_on: bool,
    target_c: i32,
    temperature_c: f64,
    cooling_step_c: f64,

    faults: HashMap<&'static str, VecDeque<StatusCode>>,
    calls: Vec<&'static str>,
}

impl SimState {
    fn enter(&mut self, op: &'static str) -> PortResult<()> {
        self.calls.push(op);
        if let Some(queue) = self.faults.get_mut(op) {
            if let Some(code) = queue.pop_front() {
                return Err(code);
            }
        }
        Ok(())
    }

    fn require_init(&self) -> PortResult<()> {
        if self.initialized && !self.shut_down {
            Ok(())
        } else {
            Err(StatusCode::NOT_INITIALIZED)
        }
    }

    fn step_temperature(&mut self) {
        let goal = if self.cooler_on {
            f64::from(self.target_c)
        } else {
            AMBIENT_C
        };
        let delta = goal - self.temperature_c;
        if delta.abs() <= self.cooling_step_c {
            self.temperature_c = goal;
        } else {
            self.temperature_c += self.cooling_step_c.copysign(delta);
        }
    }

    fn temperature_status(&self) -> StatusCode {
        if !self.cooler_on {
            StatusCode::TEMP_OFF
        } else if (self.temperature_c - f64::from(self.target_c)).abs() <= STABLE_BAND_C {
            StatusCode::TEMP_STABILIZED
        } else {
            StatusCode::TEMP_NOT_REACHED
        }
    }
}

fn default_capabilities() -> DeviceCapabilities {
    DeviceCapabilities {
        model: "DU-897_BV".to_string(),
        detector_width: 512,
        detector_height: 512,
        internal_shutter: true,
        shutter_min_times_ms: (27, 27),
        temperature_range: (-100, 20),
        vertical_speeds_us: vec![0.3, 0.5, 0.9, 1.7, 3.3],
        fk_vertical_speeds_us: vec![0.3, 0.5, 0.9, 1.7, 3.3],
        horizontal_speeds_mhz: vec![17.0, 10.0, 5.0, 1.0],
        ad_channels: 1,
        preamp_gains: vec![1.0, 2.4, 5.1],
    }
}

// =============================================================================
// SimulatedCamera
// =============================================================================

/// In-process camera implementing [`DevicePort`].
pub struct SimulatedCamera {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedCamera {
    /// 512 x 512 EMCCD head at ambient temperature with the cooler off.
    pub fn new() -> Self {
        Self::with_capabilities(default_capabilities())
    }

    /// Simulated camera reporting the given capability tables.
    pub fn with_capabilities(caps: DeviceCapabilities) -> Self {
        let state = SimState {
            caps,
            em_gain_range: (1, 1000),
            initialized: false,
            shut_down: false,
            acquisition_mode: None,
            acquiring: false,
            busy_polls: 0,
            busy_remaining: 0,
            starts: 0,
            expected_len: 0,
            exposure_s: 0.0,
            queued_buffers: VecDeque::new(),
            scripted_status: VecDeque::new(),
            shutter_open: false,
            fan_mode: None,
            em_gain: 0,
            cooler_on: false,
            target_c: 0,
            temperature_c: AMBIENT_C,
            cooling_step_c: DEFAULT_COOLING_STEP_C,
            faults: HashMap::new(),
            calls: Vec::new(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Simulated camera with a `width` x `height` detector.
    pub fn with_detector(width: u32, height: u32) -> Self {
        Self::with_capabilities(DeviceCapabilities {
            detector_width: width,
            detector_height: height,
            ..default_capabilities()
        })
    }

    /// Scripting and inspection handle sharing this camera's state.
    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SimulatedCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl DevicePort for SimulatedCamera {
    fn initialize(&mut self) -> PortResult<()> {
        let mut s = self.lock();
        s.enter("initialize")?;
        s.initialized = true;
        s.shut_down = false;
        Ok(())
    }

    fn capabilities(&mut self) -> PortResult<DeviceCapabilities> {
        let mut s = self.lock();
        s.enter("capabilities")?;
        s.require_init()?;
        Ok(s.caps.clone())
    }

    fn set_fan_mode(&mut self, mode: FanMode) -> PortResult<()> {
        let mut s = self.lock();
        s.enter("set_fan_mode")?;
        s.require_init()?;
        s.fan_mode = Some(mode);
        Ok(())
    }

    fn arm(&mut self, settings: &ArmSettings) -> PortResult<()> {
        let mut s = self.lock();
        s.enter("arm")?;
        s.require_init()?;
        if s.acquiring {
            return Err(StatusCode::ACQUIRING);
        }
        s.acquisition_mode = Some(settings.acquisition_mode);
        s.shutter_open = settings.shutter.mode != ShutterMode::Closed;
        Ok(())
    }

    fn em_gain_range(&mut self) -> PortResult<(i32, i32)> {
        let mut s = self.lock();
        s.enter("em_gain_range")?;
        s.require_init()?;
        Ok(s.em_gain_range)
    }

    fn set_em_gain(&mut self, gain: i32) -> PortResult<()> {
        let mut s = self.lock();
        s.enter("set_em_gain")?;
        s.require_init()?;
        let (lo, hi) = s.em_gain_range;
        if gain != 0 && !(lo..=hi).contains(&gain) {
            return Err(StatusCode::P1_INVALID);
        }
        s.em_gain = gain;
        Ok(())
    }

    fn set_readout(&mut self, readout: &ReadoutSettings) -> PortResult<()> {
        let mut s = self.lock();
        s.enter("set_readout")?;
        s.require_init()?;
        if readout.hss_index as usize >= s.caps.horizontal_speeds_mhz.len() {
            return Err(StatusCode::P1_INVALID);
        }
        if readout.preamp_index as usize >= s.caps.preamp_gains.len() {
            return Err(StatusCode::P1_INVALID);
        }
        Ok(())
    }

    fn set_fast_kinetics(&mut self, setup: &FastKineticsSetup) -> PortResult<()> {
        let mut s = self.lock();
        s.enter("set_fast_kinetics")?;
        s.require_init()?;
        if setup.bin == 0 || setup.exposed_rows == 0 || setup.series_length == 0 {
            return Err(StatusCode::P1_INVALID);
        }
        if setup.y_offset + setup.exposed_rows > s.caps.detector_height {
            return Err(StatusCode::P7_INVALID);
        }
        let rows = (setup.exposed_rows / setup.bin) as usize;
        let cols = (s.caps.detector_width / setup.bin) as usize;
        s.expected_len = setup.series_length as usize * rows * cols;
        s.exposure_s = setup.exposure_s;
        Ok(())
    }

    fn set_image(&mut self, setup: &ImageSetup) -> PortResult<()> {
        let mut s = self.lock();
        s.enter("set_image")?;
        s.require_init()?;
        if setup.bin == 0 {
            return Err(StatusCode::P1_INVALID);
        }
        if !setup
            .roi
            .fits_within(s.caps.detector_width, s.caps.detector_height)
        {
            return Err(StatusCode::P3_INVALID);
        }
        let rows = (setup.roi.height / setup.bin) as usize;
        let cols = (setup.roi.width / setup.bin) as usize;
        s.expected_len = rows * cols;
        s.exposure_s = setup.exposure_s;
        Ok(())
    }

    fn acquisition_timings(&mut self) -> PortResult<AcquisitionTimings> {
        let mut s = self.lock();
        s.enter("acquisition_timings")?;
        s.require_init()?;
        let readout_s = 0.03;
        Ok(AcquisitionTimings {
            exposure_s: s.exposure_s,
            accumulate_s: s.exposure_s + readout_s,
            kinetic_s: s.exposure_s + readout_s,
            readout_s,
        })
    }

    fn start(&mut self) -> PortResult<()> {
        let mut s = self.lock();
        s.enter("start")?;
        s.require_init()?;
        if s.acquisition_mode.is_none() {
            return Err(StatusCode::NOT_INITIALIZED);
        }
        if s.acquiring {
            return Err(StatusCode::ACQUIRING);
        }
        s.acquiring = true;
        s.busy_remaining = s.busy_polls;
        s.starts += 1;
        Ok(())
    }

    fn poll_status(&mut self) -> PortResult<AcquisitionStatus> {
        let mut s = self.lock();
        s.enter("poll_status")?;
        s.require_init()?;
        if let Some(code) = s.scripted_status.pop_front() {
            return Ok(AcquisitionStatus::from_code(code));
        }
        if s.acquiring && s.busy_remaining > 0 {
            s.busy_remaining -= 1;
            return Ok(AcquisitionStatus::Busy);
        }
        s.acquiring = false;
        Ok(AcquisitionStatus::Idle)
    }

    fn read_buffer(&mut self, len: usize) -> PortResult<Vec<i32>> {
        let mut s = self.lock();
        s.enter("read_buffer")?;
        s.require_init()?;
        if let Some(buffer) = s.queued_buffers.pop_front() {
            return Ok(buffer);
        }
        if len == 0 {
            return Err(StatusCode::NO_NEW_DATA);
        }
        let mut rng = rand::thread_rng();
        Ok((0..len).map(|_| rng.gen_range(90..110)).collect())
    }

    fn abort(&mut self) -> PortResult<()> {
        let mut s = self.lock();
        s.enter("abort")?;
        s.require_init()?;
        if !s.acquiring {
            return Err(StatusCode::IDLE);
        }
        s.acquiring = false;
        s.busy_remaining = 0;
        Ok(())
    }

    fn close_shutter(&mut self) -> PortResult<()> {
        let mut s = self.lock();
        s.enter("close_shutter")?;
        s.require_init()?;
        s.shutter_open = false;
        Ok(())
    }

    fn set_cooler_target(&mut self, celsius: i32) -> PortResult<()> {
        let mut s = self.lock();
        s.enter("set_cooler_target")?;
        s.require_init()?;
        let (lo, hi) = s.caps.temperature_range;
        if !(lo..=hi).contains(&celsius) {
            return Err(StatusCode::P1_INVALID);
        }
        s.target_c = celsius;
        Ok(())
    }

    fn cooler_on(&mut self) -> PortResult<()> {
        let mut s = self.lock();
        s.enter("cooler_on")?;
        s.require_init()?;
        s.cooler_on = true;
        Ok(())
    }

    fn cooler_off(&mut self) -> PortResult<()> {
        let mut s = self.lock();
        s.enter("cooler_off")?;
        s.require_init()?;
        s.cooler_on = false;
        Ok(())
    }

    fn temperature(&mut self) -> (StatusCode, f64) {
        let mut s = self.lock();
        if let Err(code) = s.enter("temperature") {
            return (code, 0.0);
        }
        if let Err(code) = s.require_init() {
            return (code, 0.0);
        }
        s.step_temperature();
        (s.temperature_status(), s.temperature_c)
    }

    fn shutdown(&mut self) -> PortResult<()> {
        let mut s = self.lock();
        s.enter("shutdown")?;
        s.require_init()?;
        s.shut_down = true;
        s.acquiring = false;
        Ok(())
    }
}

// =============================================================================
// SimHandle
// =============================================================================

/// Scripting and inspection handle for a [`SimulatedCamera`].
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next call to `op` fail with `code`. Calls queue up.
    pub fn fail_next(&self, op: &'static str, code: StatusCode) {
        self.lock().faults.entry(op).or_default().push_back(code);
    }

    /// Return `buffer` from the next buffer read regardless of the requested length.
    pub fn queue_buffer(&self, buffer: Vec<i32>) {
        self.lock().queued_buffers.push_back(buffer);
    }

    /// Answer the next status poll with the raw `code`.
    pub fn push_status(&self, code: StatusCode) {
        self.lock().scripted_status.push_back(code);
    }

    /// Number of busy replies after each start before the camera goes idle.
    pub fn set_busy_polls(&self, polls: u32) {
        self.lock().busy_polls = polls;
    }

    /// EM gain range reported to the core.
    pub fn set_em_gain_range(&self, lo: i32, hi: i32) {
        self.lock().em_gain_range = (lo, hi);
    }

    /// Force the sensor temperature.
    pub fn set_temperature(&self, celsius: f64) {
        self.lock().temperature_c = celsius;
    }

    /// Degrees moved toward the goal per temperature query. Zero freezes it.
    pub fn set_cooling_step(&self, step: f64) {
        self.lock().cooling_step_c = step.abs();
    }

    /// Current sensor temperature.
    pub fn temperature(&self) -> f64 {
        self.lock().temperature_c
    }

    /// Current cooler target.
    pub fn cooler_target(&self) -> i32 {
        self.lock().target_c
    }

    /// True when the cooler is on.
    pub fn cooler_is_on(&self) -> bool {
        self.lock().cooler_on
    }

    /// True when the shutter is open.
    pub fn shutter_open(&self) -> bool {
        self.lock().shutter_open
    }

    /// True while an acquisition is running.
    pub fn is_acquiring(&self) -> bool {
        self.lock().acquiring
    }

    /// True once the camera has been shut down.
    pub fn is_shut_down(&self) -> bool {
        self.lock().shut_down
    }

    /// Fan mode last applied.
    pub fn fan_mode(&self) -> Option<FanMode> {
        self.lock().fan_mode
    }

    /// EM gain last applied.
    pub fn em_gain(&self) -> i32 {
        self.lock().em_gain
    }

    /// Number of successful starts.
    pub fn starts(&self) -> u32 {
        self.lock().starts
    }

    /// Buffer length implied by the last readout setup.
    pub fn expected_len(&self) -> usize {
        self.lock().expected_len
    }

    /// Every call made on the port, in order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.lock().calls.clone()
    }

    /// Number of calls made to `op`.
    pub fn call_count(&self, op: &str) -> usize {
        self.lock().calls.iter().filter(|c| **c == op).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::device::{ShutterSettings, TriggerMode, READ_MODE_IMAGE};
    use crate::hardware::EmGainMode;

    fn arm_settings(mode: AcquisitionModeCode) -> ArmSettings {
        ArmSettings {
            acquisition_mode: mode,
            read_mode: READ_MODE_IMAGE,
            shutter: ShutterSettings {
                mode: ShutterMode::Open,
                closing_ms: 27,
                opening_ms: 27,
            },
            trigger: TriggerMode::External,
            em_gain_mode: EmGainMode::RealGain,
        }
    }

    #[test]
    fn calls_before_initialize_fail() {
        let mut cam = SimulatedCamera::new();
        assert_eq!(cam.capabilities(), Err(StatusCode::NOT_INITIALIZED));
        cam.initialize().unwrap();
        assert_eq!(cam.capabilities().unwrap().detector_width, 512);
    }

    #[test]
    fn busy_polls_then_idle() {
        let mut cam = SimulatedCamera::new();
        let handle = cam.handle();
        handle.set_busy_polls(2);
        cam.initialize().unwrap();
        cam.arm(&arm_settings(AcquisitionModeCode::Single)).unwrap();
        cam.start().unwrap();
        assert_eq!(cam.poll_status(), Ok(AcquisitionStatus::Busy));
        assert_eq!(cam.poll_status(), Ok(AcquisitionStatus::Busy));
        assert_eq!(cam.poll_status(), Ok(AcquisitionStatus::Idle));
        assert!(!handle.is_acquiring());
        assert_eq!(cam.abort(), Err(StatusCode::IDLE));
    }

    #[test]
    fn fault_injection_is_one_shot() {
        let mut cam = SimulatedCamera::new();
        let handle = cam.handle();
        handle.fail_next("initialize", StatusCode::ERROR_NOCAMERA);
        assert_eq!(cam.initialize(), Err(StatusCode::ERROR_NOCAMERA));
        assert_eq!(cam.initialize(), Ok(()));
        assert_eq!(handle.call_count("initialize"), 2);
    }

    #[test]
    fn temperature_walks_toward_target() {
        let mut cam = SimulatedCamera::new();
        let handle = cam.handle();
        cam.initialize().unwrap();
        cam.set_cooler_target(-10).unwrap();
        cam.cooler_on().unwrap();
        assert_eq!(cam.temperature(), (StatusCode::TEMP_NOT_REACHED, 15.0));
        for _ in 0..10 {
            cam.temperature();
        }
        assert_eq!(cam.temperature(), (StatusCode::TEMP_STABILIZED, -10.0));
        cam.cooler_off().unwrap();
        assert_eq!(cam.temperature(), (StatusCode::TEMP_OFF, -5.0));
        assert_eq!(handle.temperature(), -5.0);
    }

    #[test]
    fn fast_kinetics_setup_sets_buffer_length() {
        let mut cam = SimulatedCamera::new();
        let handle = cam.handle();
        cam.initialize().unwrap();
        cam.set_fast_kinetics(&FastKineticsSetup {
            exposed_rows: 256,
            series_length: 2,
            exposure_s: 0.001,
            bin: 2,
            y_offset: 0,
        })
        .unwrap();
        assert_eq!(handle.expected_len(), 2 * 128 * 256);
        assert_eq!(cam.read_buffer(10).unwrap().len(), 10);
    }
}

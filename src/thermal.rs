//! Thermal safety monitor.
//!
//! Owns the cooler set point, polls the sensor temperature on a fixed period
//! and answers whether it is warm enough to shut the camera down. A failed
//! read halts the periodic poll; nothing reschedules it until
//! [`ThermalMonitor::start_polling`] is called again.

use crate::config::ThermalSettings;
use crate::error::{CamError, CamResult};
use crate::hardware::{DevicePort, StatusCode};
use crate::scheduler::{TimerHandle, TimerQueue, TimerTask};
use crate::status::StatusLog;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// Cooler status reported with a temperature reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TemperatureStatus {
    /// Cooler off.
    Off,
    /// At the set point and stable.
    Stabilized,
    /// Still cooling toward the set point.
    NotReached,
    /// Was stable, has drifted.
    Drifted,
    /// Reached the set point, not yet stable.
    NotStabilized,
}

impl TemperatureStatus {
    /// Status for a temperature reply code, `None` for anything else.
    pub fn from_code(code: StatusCode) -> Option<Self> {
        match code {
            StatusCode::TEMP_OFF => Some(TemperatureStatus::Off),
            StatusCode::TEMP_STABILIZED => Some(TemperatureStatus::Stabilized),
            StatusCode::TEMP_NOT_REACHED => Some(TemperatureStatus::NotReached),
            StatusCode::TEMP_DRIFT => Some(TemperatureStatus::Drifted),
            StatusCode::TEMP_NOT_STABILIZED => Some(TemperatureStatus::NotStabilized),
            _ => None,
        }
    }

    /// Operator-facing text.
    pub fn describe(self) -> &'static str {
        match self {
            TemperatureStatus::Off => "Cooler is off.",
            TemperatureStatus::Stabilized => "Temperature has stabilized at set point.",
            TemperatureStatus::NotReached => "Temperature has not reached set point.",
            TemperatureStatus::Drifted => "Temperature had stabilized but has since drifted.",
            TemperatureStatus::NotStabilized => {
                "Temperature reached but not stabilized."
            }
        }
    }
}

/// Snapshot of the thermal state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThermalState {
    /// Last good reading in °C, `None` before the first or after a failed read.
    pub temperature: Option<f64>,
    /// Cooler status of the last good reading.
    pub status: Option<TemperatureStatus>,
    /// Whether the cooler was switched on.
    pub cooler_on: bool,
    /// Cooler set point in °C.
    pub target: i32,
    /// Minimum temperature for a safe shutdown.
    pub safe_threshold: f64,
}

impl ThermalState {
    /// True only for a known reading at or above the threshold.
    pub fn is_safe_to_shutdown(&self) -> bool {
        self.temperature.is_some_and(|t| t >= self.safe_threshold)
    }

    /// True for a known reading below the threshold.
    pub fn below_safe_threshold(&self) -> bool {
        self.temperature.is_some_and(|t| t < self.safe_threshold)
    }
}

/// Cooler control plus periodic temperature polling.
pub struct ThermalMonitor {
    settings: ThermalSettings,
    device_range: (i32, i32),
    state: ThermalState,
    poll: Option<TimerHandle>,
    halted: bool,
    status: StatusLog,
}

impl ThermalMonitor {
    /// Monitor for a camera whose set point must lie in `device_range`.
    pub fn new(settings: &ThermalSettings, device_range: (i32, i32), status: StatusLog) -> Self {
        Self {
            state: ThermalState {
                temperature: None,
                status: None,
                cooler_on: false,
                target: settings.default_target_c,
                safe_threshold: settings.safe_shutdown_c,
            },
            settings: settings.clone(),
            device_range,
            poll: None,
            halted: false,
            status,
        }
    }

    /// Current snapshot.
    pub fn state(&self) -> ThermalState {
        self.state
    }

    /// True after a failed read stopped the periodic poll.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// True while a temperature poll is scheduled.
    pub fn is_polling(&self) -> bool {
        self.poll.is_some()
    }

    /// See [`ThermalState::is_safe_to_shutdown`].
    pub fn is_safe_to_shutdown(&self) -> bool {
        self.state.is_safe_to_shutdown()
    }

    /// Allowed set point range: the device range narrowed by the configured limits.
    pub fn target_bounds(&self) -> CamResult<(i32, i32)> {
        let lo = self.device_range.0.max(self.settings.min_target_c);
        let hi = self.device_range.1.min(self.settings.max_target_c);
        if lo > hi {
            return Err(CamError::Config(format!(
                "no usable set point: device range {:?}, configured [{}, {}]",
                self.device_range, self.settings.min_target_c, self.settings.max_target_c
            )));
        }
        Ok((lo, hi))
    }

    /// Clamp `requested` into [`target_bounds`](Self::target_bounds) and send it.
    pub fn set_target(&mut self, port: &mut dyn DevicePort, requested: i32) -> CamResult<i32> {
        let (lo, hi) = self.target_bounds()?;
        let target = requested.clamp(lo, hi);
        if target != requested {
            self.status.warn(
                "set_temperature",
                format!("Set point {requested} C out of range, using {target} C."),
            );
        }
        if let Err(code) = port.set_cooler_target(target) {
            let err = CamError::device("SetTemperature", code);
            self.status.fatal("set_temperature", &err);
            return Err(err);
        }
        self.state.target = target;
        self.status
            .info("set_temperature", format!("Set temperature is {target} C."));
        Ok(target)
    }

    /// Send the set point, switch the cooler on and start polling.
    pub fn cooler_on(
        &mut self,
        port: &mut dyn DevicePort,
        timers: &mut TimerQueue,
        now: Duration,
    ) -> CamResult<()> {
        self.set_target(port, self.state.target)?;
        if let Err(code) = port.cooler_on() {
            let err = CamError::device("CoolerON", code);
            self.status.fatal("cooler", &err);
            return Err(err);
        }
        self.state.cooler_on = true;
        self.status.info("cooler", "Cooler on.");
        self.start_polling(timers, now);
        Ok(())
    }

    /// Switch the cooler off. Polling continues so the warm-up is visible.
    pub fn cooler_off(&mut self, port: &mut dyn DevicePort) -> CamResult<()> {
        if let Err(code) = port.cooler_off() {
            let err = CamError::device("CoolerOFF", code);
            self.status.fatal("cooler", &err);
            return Err(err);
        }
        self.state.cooler_on = false;
        self.status.info("cooler", "Cooler off.");
        Ok(())
    }

    /// Read the temperature once.
    ///
    /// A reply of `NOT_INITIALIZED` or `ERROR_ACK` is a read failure: the
    /// reading is cleared and periodic polling halts.
    pub fn poll_once(&mut self, port: &mut dyn DevicePort) -> CamResult<ThermalState> {
        let (code, celsius) = port.temperature();
        match code {
            StatusCode::NOT_INITIALIZED | StatusCode::ERROR_ACK => {
                let err = CamError::TempRead {
                    code,
                    message: code.describe(),
                };
                self.status.fatal("temperature", &err);
                self.state.temperature = None;
                self.state.status = None;
                self.halted = true;
                Err(err)
            }
            other => {
                let status = TemperatureStatus::from_code(other);
                if status.is_none() {
                    self.status.warn(
                        "temperature",
                        format!("Unexpected temperature status {other}."),
                    );
                }
                self.state.temperature = Some(celsius);
                self.state.status = status;
                debug!(celsius, code = %other, "temperature read");
                Ok(self.state)
            }
        }
    }

    /// (Re)start periodic polling with an immediate first read.
    pub fn start_polling(&mut self, timers: &mut TimerQueue, now: Duration) {
        if let Some(handle) = self.poll.take() {
            timers.cancel(&handle);
        }
        self.halted = false;
        self.poll = Some(timers.schedule(TimerTask::TemperaturePoll, now, Duration::ZERO));
    }

    /// Stop periodic polling.
    pub fn stop_polling(&mut self, timers: &mut TimerQueue) {
        if let Some(handle) = self.poll.take() {
            timers.cancel(&handle);
        }
    }

    /// Handle a fired temperature poll. `None` for a stale handle.
    pub fn on_poll(
        &mut self,
        handle: TimerHandle,
        port: &mut dyn DevicePort,
        timers: &mut TimerQueue,
        now: Duration,
    ) -> Option<CamResult<ThermalState>> {
        if self.poll.as_ref() != Some(&handle) {
            return None;
        }
        self.poll = None;
        let result = self.poll_once(port);
        if result.is_ok() {
            self.poll = Some(timers.schedule(
                TimerTask::TemperaturePoll,
                now,
                self.settings.poll_interval(),
            ));
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SimulatedCamera;

    fn monitor() -> (SimulatedCamera, ThermalMonitor) {
        let mut cam = SimulatedCamera::new();
        cam.initialize().unwrap();
        let range = cam.capabilities().unwrap().temperature_range;
        let monitor = ThermalMonitor::new(&ThermalSettings::default(), range, StatusLog::new());
        (cam, monitor)
    }

    #[test]
    fn set_point_is_clamped_into_narrowed_range() {
        let (mut cam, mut monitor) = monitor();
        assert_eq!(monitor.target_bounds().unwrap(), (-70, 20));
        assert_eq!(monitor.set_target(&mut cam, -90).unwrap(), -70);
        assert_eq!(cam.handle().cooler_target(), -70);
        assert_eq!(monitor.set_target(&mut cam, 35).unwrap(), 20);
        assert_eq!(monitor.set_target(&mut cam, -30).unwrap(), -30);
    }

    #[test]
    fn empty_bounds_are_a_config_error() {
        let settings = ThermalSettings {
            min_target_c: -70,
            max_target_c: 20,
            ..ThermalSettings::default()
        };
        let monitor = ThermalMonitor::new(&settings, (30, 40), StatusLog::new());
        assert!(matches!(monitor.target_bounds(), Err(CamError::Config(_))));
    }

    #[test]
    fn read_failure_halts_polling() {
        let (mut cam, mut monitor) = monitor();
        let sim = cam.handle();
        let mut timers = TimerQueue::new();
        monitor.start_polling(&mut timers, Duration::ZERO);

        let handle = timers.pop_due(Duration::ZERO).unwrap();
        let state = monitor
            .on_poll(handle, &mut cam, &mut timers, Duration::ZERO)
            .unwrap()
            .unwrap();
        assert_eq!(state.status, Some(TemperatureStatus::Off));
        assert!(timers.has_pending(TimerTask::TemperaturePoll));

        sim.fail_next("temperature", StatusCode::ERROR_ACK);
        let deadline = timers.next_deadline().unwrap();
        let handle = timers.pop_due(deadline).unwrap();
        let result = monitor
            .on_poll(handle, &mut cam, &mut timers, deadline)
            .unwrap();
        assert!(matches!(result, Err(CamError::TempRead { .. })));
        assert!(monitor.is_halted());
        assert!(!monitor.is_polling());
        assert!(timers.is_empty());
        assert_eq!(monitor.state().temperature, None);
        assert!(!monitor.is_safe_to_shutdown());

        monitor.start_polling(&mut timers, deadline);
        assert!(!monitor.is_halted());
        assert!(timers.has_pending(TimerTask::TemperaturePoll));
    }

    #[test]
    fn safety_threshold_is_inclusive() {
        let mut state = ThermalState {
            temperature: Some(-20.0),
            status: None,
            cooler_on: false,
            target: -20,
            safe_threshold: -20.0,
        };
        assert!(state.is_safe_to_shutdown());
        state.temperature = Some(-20.5);
        assert!(!state.is_safe_to_shutdown());
        assert!(state.below_safe_threshold());
        state.temperature = None;
        assert!(!state.is_safe_to_shutdown());
        assert!(!state.below_safe_threshold());
    }

    #[test]
    fn cooler_on_cools_toward_target() {
        let (mut cam, mut monitor) = monitor();
        let sim = cam.handle();
        let mut timers = TimerQueue::new();
        monitor.set_target(&mut cam, -30).unwrap();
        monitor.cooler_on(&mut cam, &mut timers, Duration::ZERO).unwrap();
        assert!(sim.cooler_is_on());

        let mut last = f64::MAX;
        for _ in 0..3 {
            let state = monitor.poll_once(&mut cam).unwrap();
            let t = state.temperature.unwrap();
            assert!(t < last);
            last = t;
        }
        monitor.cooler_off(&mut cam).unwrap();
        assert!(!monitor.state().cooler_on);
    }

    #[test]
    fn stale_poll_is_ignored() {
        let (mut cam, mut monitor) = monitor();
        let mut timers = TimerQueue::new();
        let stray = timers.schedule(TimerTask::TemperaturePoll, Duration::ZERO, Duration::ZERO);
        assert!(monitor
            .on_poll(stray, &mut cam, &mut timers, Duration::ZERO)
            .is_none());
    }
}

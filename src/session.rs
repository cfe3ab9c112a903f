//! Camera session.
//!
//! A [`CameraSession`] owns the device port, the acquisition controller, the
//! thermal monitor and the timer queue of one opened camera. All access to
//! the port goes through it. While an acquisition is in flight the only
//! commands accepted are abort and temperature reads.
//!
//! Time is passed in as an offset from an epoch chosen by the caller. The
//! session never sleeps; the driver asks for [`CameraSession::next_deadline`]
//! and calls [`CameraSession::fire_due`] when it is reached.
//!
//! Dropping a session that was not shut down stops any running acquisition
//! and closes the shutter. The camera itself is only released when the last
//! temperature reading is safe.

use crate::acquisition::{
    AbortOutcome, AcquisitionController, AcquisitionOutput, AcquisitionState, PollOutcome,
    ValidatedConfig,
};
use crate::config::{AcquisitionConfig, CameraSettings};
use crate::error::{CamError, CamResult};
use crate::frames::FrameRoles;
use crate::hardware::{DeviceCapabilities, DevicePort};
use crate::scheduler::{TimerQueue, TimerTask};
use crate::shutdown::{OperatorPrompt, ShutdownPrompt, ShutdownReport};
use crate::status::StatusLog;
use crate::thermal::{ThermalMonitor, ThermalState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Something the session wants the outside world to know about.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A shot of a multi-shot loop was stored.
    ShotAcquired {
        /// Shots collected so far.
        shot: u32,
        /// Shots in the loop.
        of: u32,
    },
    /// A loop completed.
    AcquisitionComplete(Arc<AcquisitionOutput>),
    /// A temperature reading.
    Temperature(ThermalState),
    /// An abort request was handled.
    Aborted(AbortOutcome),
    /// A fatal condition, as a (header, detail) pair.
    Fault {
        /// Operation that failed.
        operation: String,
        /// Short header.
        header: String,
        /// Detail text.
        detail: String,
    },
    /// Files written for a completed loop.
    Saved {
        /// Written paths.
        paths: Vec<PathBuf>,
    },
}

impl SessionEvent {
    /// Fault event for `err`.
    pub fn fault(operation: &str, err: &CamError) -> Self {
        SessionEvent::Fault {
            operation: operation.to_string(),
            header: err.header().to_string(),
            detail: err.to_string(),
        }
    }
}

/// An opened camera. See the module docs.
pub struct CameraSession {
    port: Box<dyn DevicePort>,
    settings: CameraSettings,
    caps: DeviceCapabilities,
    controller: AcquisitionController,
    thermal: ThermalMonitor,
    timers: TimerQueue,
    status: StatusLog,
    closed: bool,
}

impl CameraSession {
    /// Initialize the camera, read its capabilities and start temperature polling.
    ///
    /// When a step after initialization fails the camera is shut down again
    /// before the error is returned.
    pub fn open(
        mut port: Box<dyn DevicePort>,
        settings: &CameraSettings,
        status: StatusLog,
        now: Duration,
    ) -> CamResult<Self> {
        settings.validate()?;

        if let Err(code) = port.initialize() {
            let err = CamError::device("Initialize", code);
            status.fatal("open", &err);
            return Err(err);
        }
        status.info("open", "Camera initialized.");

        let caps = match Self::probe(port.as_mut(), settings, &status) {
            Ok(caps) => caps,
            Err(err) => {
                status.fatal("open", &err);
                if let Err(code) = port.shutdown() {
                    warn!(code = %code, "shutdown after failed open also failed");
                }
                return Err(err);
            }
        };

        let controller = AcquisitionController::new(settings, status.clone());
        let mut thermal =
            ThermalMonitor::new(&settings.thermal, caps.temperature_range, status.clone());
        if let Err(err) = thermal.set_target(port.as_mut(), settings.thermal.default_target_c) {
            status.warn("open", format!("Default set point not applied: {err}"));
        }

        let mut session = Self {
            port,
            settings: settings.clone(),
            caps,
            controller,
            thermal,
            timers: TimerQueue::new(),
            status,
            closed: false,
        };
        session.thermal.start_polling(&mut session.timers, now);
        Ok(session)
    }

    fn probe(
        port: &mut dyn DevicePort,
        settings: &CameraSettings,
        status: &StatusLog,
    ) -> CamResult<DeviceCapabilities> {
        let caps = port
            .capabilities()
            .map_err(|c| CamError::device("GetCapabilities", c))?;
        if !caps.has_geometry() {
            return Err(CamError::Config(
                "camera did not report detector geometry".to_string(),
            ));
        }
        status.info(
            "open",
            format!(
                "Camera model {}, detector {} x {}.",
                caps.model, caps.detector_width, caps.detector_height
            ),
        );
        status.info(
            "open",
            format!(
                "Internal shutter: {}. Min shutter times {} / {} ms.",
                if caps.internal_shutter { "yes" } else { "no" },
                caps.shutter_min_times_ms.0,
                caps.shutter_min_times_ms.1
            ),
        );
        status.info(
            "open",
            format!(
                "Temperature range {} to {} C.",
                caps.temperature_range.0, caps.temperature_range.1
            ),
        );
        port.set_fan_mode(settings.thermal.fan_mode)
            .map_err(|c| CamError::device("SetFanMode", c))?;
        Ok(caps)
    }

    fn ensure_open(&self) -> CamResult<()> {
        if self.closed {
            Err(CamError::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn ensure_port_free(&self, operation: &'static str) -> CamResult<()> {
        self.ensure_open()?;
        let state = self.controller.state();
        if state.is_in_flight() {
            return Err(CamError::InvalidState { operation, state });
        }
        Ok(())
    }

    // =========================================================================
    // Acquisition
    // =========================================================================

    /// Arm and start in one step.
    pub fn acquire(&mut self, config: &AcquisitionConfig, now: Duration) -> CamResult<ValidatedConfig> {
        let validated = self.arm(config)?;
        self.start(now)?;
        Ok(validated)
    }

    /// Validate and configure an acquisition.
    pub fn arm(&mut self, config: &AcquisitionConfig) -> CamResult<ValidatedConfig> {
        self.ensure_open()?;
        self.controller.arm(self.port.as_mut(), &self.caps, config)
    }

    /// Start the armed acquisition.
    pub fn start(&mut self, now: Duration) -> CamResult<()> {
        self.ensure_open()?;
        self.controller.start(self.port.as_mut(), &mut self.timers, now)
    }

    /// Abort from any state. Stop failures are reported as fault events.
    pub fn abort(&mut self) -> CamResult<Vec<SessionEvent>> {
        self.ensure_open()?;
        let report = self.controller.abort(self.port.as_mut(), &mut self.timers);
        let mut events: Vec<SessionEvent> = report
            .errors
            .iter()
            .map(|err| SessionEvent::fault("abort", err))
            .collect();
        events.push(SessionEvent::Aborted(report.outcome));
        Ok(events)
    }

    /// Recompute the last output's derived images with new frame roles.
    pub fn remap_roles(&mut self, roles: FrameRoles) -> CamResult<Option<Arc<AcquisitionOutput>>> {
        self.ensure_open()?;
        self.controller.remap(roles)
    }

    // =========================================================================
    // Thermal
    // =========================================================================

    /// Change the cooler set point.
    pub fn set_target(&mut self, celsius: i32) -> CamResult<i32> {
        self.ensure_port_free("set temperature")?;
        self.thermal.set_target(self.port.as_mut(), celsius)
    }

    /// Switch the cooler on at the current set point.
    pub fn cooler_on(&mut self, now: Duration) -> CamResult<()> {
        self.ensure_port_free("switch cooler on")?;
        self.thermal.cooler_on(self.port.as_mut(), &mut self.timers, now)
    }

    /// Switch the cooler off.
    pub fn cooler_off(&mut self) -> CamResult<()> {
        self.ensure_port_free("switch cooler off")?;
        self.thermal.cooler_off(self.port.as_mut())
    }

    /// Read the temperature now, outside the polling cadence.
    ///
    /// Allowed during an acquisition; the read does not touch acquisition state.
    pub fn read_temperature(&mut self) -> CamResult<ThermalState> {
        self.ensure_open()?;
        self.thermal.poll_once(self.port.as_mut())
    }

    /// Restart temperature polling, e.g. after a failed read halted it.
    pub fn restart_temperature_polling(&mut self, now: Duration) -> CamResult<()> {
        self.ensure_open()?;
        self.thermal.start_polling(&mut self.timers, now);
        Ok(())
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// Earliest pending timer deadline.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.timers.next_deadline()
    }

    /// Run every timer due at `now` and collect what happened.
    pub fn fire_due(&mut self, now: Duration) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        if self.closed {
            return events;
        }
        while let Some(handle) = self.timers.pop_due(now) {
            match handle.task() {
                TimerTask::AcquisitionPoll => {
                    match self
                        .controller
                        .on_poll(handle, self.port.as_mut(), &mut self.timers, now)
                    {
                        Ok(PollOutcome::Ignored | PollOutcome::StillExposing) => {}
                        Ok(PollOutcome::ShotAcquired { shot, of }) => {
                            events.push(SessionEvent::ShotAcquired { shot, of });
                        }
                        Ok(PollOutcome::Completed(output)) => {
                            events.push(SessionEvent::AcquisitionComplete(output));
                        }
                        Err(err) => events.push(SessionEvent::fault("acquisition", &err)),
                    }
                }
                TimerTask::TemperaturePoll => {
                    match self
                        .thermal
                        .on_poll(handle, self.port.as_mut(), &mut self.timers, now)
                    {
                        Some(Ok(state)) => events.push(SessionEvent::Temperature(state)),
                        Some(Err(err)) => events.push(SessionEvent::fault("temperature", &err)),
                        None => {}
                    }
                }
            }
        }
        events
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Scoped shutdown sequence.
    ///
    /// Abort (if in flight), close the shutter, read the temperature, ask
    /// `prompt`. Each of these steps runs even when the one before failed.
    /// A refusal is a hard stop: polling resumes and the camera stays open.
    /// After confirmation the cooler is switched off and the camera released.
    pub fn shutdown(
        &mut self,
        prompt: &dyn OperatorPrompt,
        now: Duration,
    ) -> CamResult<ShutdownReport> {
        self.ensure_open()?;
        self.thermal.stop_polling(&mut self.timers);
        let mut report = ShutdownReport::default();

        if self.controller.state().is_in_flight() {
            let abort = self.controller.abort(self.port.as_mut(), &mut self.timers);
            let mut errors = abort.errors.into_iter();
            report.record("AbortAcquisition", errors.next().map_or(Ok(()), Err));
            for err in errors {
                report.record("AbortAcquisition", Err(err));
            }
        }
        let shutter = self
            .port
            .close_shutter()
            .map_err(|c| CamError::device("SetShutter", c));
        report.record("SetShutter", shutter);

        let reading = self.thermal.poll_once(self.port.as_mut());
        let question = match &reading {
            Err(err) => ShutdownPrompt::TemperatureUnreadable {
                message: err.to_string(),
            },
            Ok(state) => match state.temperature {
                Some(t) if state.is_safe_to_shutdown() => ShutdownPrompt::ConfirmSafe {
                    temperature: t,
                    threshold: state.safe_threshold,
                },
                Some(t) => ShutdownPrompt::BelowSafeThreshold {
                    temperature: t,
                    threshold: state.safe_threshold,
                },
                None => ShutdownPrompt::TemperatureUnreadable {
                    message: "no temperature reading".to_string(),
                },
            },
        };
        let thermal = self.thermal.state();
        report.temperature = thermal.temperature;
        report.record("GetTemperature", reading.map(|_| ()));

        if !prompt.confirm(&question) {
            self.thermal.start_polling(&mut self.timers, now);
            let err = if question.is_override() {
                CamError::SafetyViolation {
                    temperature: thermal.temperature,
                    threshold: thermal.safe_threshold,
                }
            } else {
                CamError::ShutdownDeclined
            };
            self.status.warn("shutdown", err.to_string());
            return Err(err);
        }
        report.overridden = question.is_override();
        if report.overridden {
            self.status
                .warn("shutdown", "Shutting down below the safe temperature.");
        }

        let cooler = self.thermal.cooler_off(self.port.as_mut());
        report.record("CoolerOFF", cooler);
        let released = self
            .port
            .shutdown()
            .map_err(|c| CamError::device("ShutDown", c));
        report.record("ShutDown", released);

        self.timers.cancel_all();
        self.closed = true;
        self.status.info("shutdown", "Camera shut down.");
        Ok(report)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Acquisition state.
    pub fn state(&self) -> AcquisitionState {
        self.controller.state()
    }

    /// Last thermal snapshot.
    pub fn thermal_state(&self) -> ThermalState {
        self.thermal.state()
    }

    /// True after a failed temperature read stopped polling.
    pub fn temperature_polling_halted(&self) -> bool {
        self.thermal.is_halted()
    }

    /// Output of the last completed loop.
    pub fn last_output(&self) -> Option<Arc<AcquisitionOutput>> {
        self.controller.last_output()
    }

    /// Shared status log.
    pub fn status(&self) -> &StatusLog {
        &self.status
    }

    /// Capabilities read at open.
    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.caps
    }

    /// Settings the session was opened with.
    pub fn settings(&self) -> &CameraSettings {
        &self.settings
    }

    /// True after a completed shutdown.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if self.controller.state().is_in_flight() {
            let report = self.controller.abort(self.port.as_mut(), &mut self.timers);
            for err in report.errors {
                warn!(error = %err, "abort on drop failed");
            }
        }
        self.timers.cancel_all();
        if let Err(code) = self.port.close_shutter() {
            warn!(code = %code, "closing shutter on drop failed");
        }
        match self.thermal.poll_once(self.port.as_mut()) {
            Ok(state) if state.is_safe_to_shutdown() => {
                if let Err(err) = self.thermal.cooler_off(self.port.as_mut()) {
                    warn!(error = %err, "cooler off on drop failed");
                }
                match self.port.shutdown() {
                    Ok(()) => info!("camera released on drop"),
                    Err(code) => warn!(code = %code, "shutdown on drop failed"),
                }
            }
            _ => warn!(
                "camera session dropped while the sensor is cold or unreadable; leaving camera initialized"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{SimHandle, SimulatedCamera, StatusCode};
    use crate::shutdown::{DenyUnsafe, ForceShutdown};

    fn open() -> (CameraSession, SimHandle) {
        let cam = SimulatedCamera::new();
        let sim = cam.handle();
        let session = CameraSession::open(
            Box::new(cam),
            &CameraSettings::default(),
            StatusLog::new(),
            Duration::ZERO,
        )
        .unwrap();
        (session, sim)
    }

    #[test]
    fn open_applies_fan_mode_and_polls_temperature() {
        let (mut session, sim) = open();
        assert_eq!(sim.fan_mode(), Some(crate::hardware::FanMode::Off));
        assert_eq!(sim.cooler_target(), -20);
        let events = session.fire_due(Duration::ZERO);
        assert!(matches!(events[0], SessionEvent::Temperature(_)));
        assert!(session.next_deadline().is_some());
    }

    #[test]
    fn failed_open_releases_the_camera() {
        let cam = SimulatedCamera::new();
        let sim = cam.handle();
        sim.fail_next("set_fan_mode", StatusCode::ERROR_ACK);
        let result = CameraSession::open(
            Box::new(cam),
            &CameraSettings::default(),
            StatusLog::new(),
            Duration::ZERO,
        );
        assert!(result.is_err());
        assert!(sim.is_shut_down());
    }

    #[test]
    fn thermal_commands_are_refused_while_in_flight() {
        let (mut session, sim) = open();
        sim.set_busy_polls(10);
        let config = AcquisitionConfig {
            kin_frames: 1,
            dx: 4,
            dy: 4,
            ..AcquisitionConfig::default()
        };
        session.acquire(&config, Duration::ZERO).unwrap();
        let err = session.set_target(-40).unwrap_err();
        assert!(matches!(err, CamError::InvalidState { .. }));
        assert!(session.cooler_on(Duration::ZERO).is_err());
        assert!(session.read_temperature().is_ok());

        let events = session.abort().unwrap();
        assert!(matches!(
            events.last(),
            Some(SessionEvent::Aborted(AbortOutcome::Aborted { .. }))
        ));
        assert!(session.set_target(-40).is_ok());
    }

    #[test]
    fn cold_shutdown_is_refused_by_default() {
        let (mut session, sim) = open();
        sim.set_temperature(-25.0);
        sim.set_cooling_step(0.0);
        let err = session.shutdown(&DenyUnsafe, Duration::ZERO).unwrap_err();
        assert!(matches!(err, CamError::SafetyViolation { .. }));
        assert!(!session.is_closed());
        assert!(!sim.is_shut_down());
        assert!(session.next_deadline().is_some());

        let report = session.shutdown(&ForceShutdown, Duration::ZERO).unwrap();
        assert!(report.overridden);
        assert!(sim.is_shut_down());
        assert!(matches!(session.arm(&AcquisitionConfig::default()), Err(CamError::SessionClosed)));
    }

    #[test]
    fn drop_releases_a_warm_camera() {
        let (session, sim) = open();
        drop(session);
        assert!(sim.is_shut_down());
    }

    #[test]
    fn drop_mid_exposure_aborts_the_running_loop() {
        let (mut session, sim) = open();
        sim.set_busy_polls(u32::MAX);
        let config = AcquisitionConfig {
            kin_frames: 1,
            dx: 4,
            dy: 4,
            ..AcquisitionConfig::default()
        };
        session.acquire(&config, Duration::ZERO).unwrap();
        let status = session.status().clone();
        drop(session);

        assert!(status.contains("Acquisition aborted."));
        assert!(!status.contains("Abort requested after completion."));
        assert!(sim.is_shut_down());
    }

    #[test]
    fn drop_leaves_a_cold_camera_initialized() {
        let (session, sim) = open();
        sim.set_temperature(-60.0);
        sim.set_cooling_step(0.0);
        drop(session);
        assert!(!sim.is_shut_down());
    }
}

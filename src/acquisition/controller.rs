//! Acquisition controller.
//!
//! Drives one acquisition loop (1..N shots, each 1..K fast-kinetics frames)
//! from arm to completion or abort. The controller is synchronous: it never
//! waits on the camera. After `start` it schedules an
//! [`AcquisitionPoll`](TimerTask::AcquisitionPoll) and returns; the owner of
//! the clock calls [`AcquisitionController::on_poll`] when that timer fires.
//!
//! Failure handling:
//!
//! - setup errors return the controller to `Idle`
//! - busy replies and transient status-query failures are re-polled
//! - any other status reply, or a failed buffer read, stops the camera,
//!   closes the shutter and leaves the controller `Faulted`
//! - a buffer of the wrong shape stops the camera the same way and returns to
//!   `Idle`
//!
//! Collected shots are only dropped after the count is written to the status
//! log.

use super::state::AcquisitionState;
use super::validate::{validate, AcquisitionMode, ValidatedConfig};
use crate::config::{AcquisitionConfig, AcquisitionSettings, CameraSettings};
use crate::error::{CamError, CamResult};
use crate::frames::{reshape, DerivedImageComputer, DerivedImages, FrameRoles, RawFrameSet};
use crate::hardware::{
    AcquisitionModeCode, AcquisitionStatus, ArmSettings, DeviceCapabilities, DevicePort,
    ShutterSettings, StatusCode, READ_MODE_IMAGE,
};
use crate::scheduler::{CancelOutcome, TimerHandle, TimerQueue, TimerTask};
use crate::status::StatusLog;
use chrono::{DateTime, Local};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Everything produced by one completed loop.
#[derive(Debug, Clone)]
pub struct AcquisitionOutput {
    /// Raw frames, one stack per kinetic index.
    pub raw: Arc<RawFrameSet>,
    /// Derived images, absent when the role mapping did not fit the run.
    pub derived: Option<DerivedImages>,
    /// Config the loop ran with.
    pub config: ValidatedConfig,
    /// Completion time.
    pub completed_at: DateTime<Local>,
}

/// Result of handling an acquisition poll.
#[derive(Debug, Clone)]
pub enum PollOutcome {
    /// The handle was stale or the controller was not exposing.
    Ignored,
    /// Camera still busy; another poll is scheduled.
    StillExposing,
    /// A shot was stored and the next one started.
    ShotAcquired {
        /// Shots collected so far.
        shot: u32,
        /// Shots in the loop.
        of: u32,
    },
    /// The loop finished.
    Completed(Arc<AcquisitionOutput>),
}

/// What an abort request found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOutcome {
    /// A pending poll was cancelled and the collected shots dropped.
    Aborted {
        /// Shots dropped.
        shots_discarded: usize,
    },
    /// No poll had ever been scheduled for this run.
    NothingInFlight,
    /// The last poll had already fired or been cancelled.
    AfterCompletion,
}

/// Abort outcome plus any device errors hit while stopping the camera.
#[derive(Debug)]
pub struct AbortReport {
    /// What the abort found.
    pub outcome: AbortOutcome,
    /// Failed stop steps.
    pub errors: Vec<CamError>,
}

struct ActiveRun {
    validated: ValidatedConfig,
    frames: RawFrameSet,
}

/// The acquisition state machine. See the module docs.
pub struct AcquisitionController {
    settings: AcquisitionSettings,
    computer: DerivedImageComputer,
    roles: FrameRoles,
    status: StatusLog,
    state: AcquisitionState,
    run: Option<ActiveRun>,
    poll: Option<TimerHandle>,
    last_output: Option<Arc<AcquisitionOutput>>,
}

impl AcquisitionController {
    /// Idle controller.
    pub fn new(settings: &CameraSettings, status: StatusLog) -> Self {
        Self {
            settings: settings.acquisition.clone(),
            computer: DerivedImageComputer::new(&settings.imaging),
            roles: FrameRoles::default(),
            status,
            state: AcquisitionState::Idle,
            run: None,
            poll: None,
            last_output: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    /// Role mapping used for derived images.
    pub fn roles(&self) -> FrameRoles {
        self.roles
    }

    /// Output of the last completed loop.
    pub fn last_output(&self) -> Option<Arc<AcquisitionOutput>> {
        self.last_output.clone()
    }

    /// Shots collected in the current loop.
    pub fn shots_collected(&self) -> usize {
        self.run.as_ref().map_or(0, |r| r.frames.shot_count())
    }

    /// Config of the armed or running loop.
    pub fn active_config(&self) -> Option<&ValidatedConfig> {
        self.run.as_ref().map(|r| &r.validated)
    }

    /// Status poll interval for the configured trigger.
    pub fn poll_interval(&self) -> Duration {
        self.settings.poll_interval()
    }

    /// Move to `to`, refusing moves outside the transition table.
    fn transition(&mut self, to: AcquisitionState) -> CamResult<()> {
        if !self.state.can_transition_to(to) {
            error!(from = %self.state, to = %to, "illegal acquisition state transition");
            return Err(CamError::InvalidState {
                operation: "transition",
                state: self.state,
            });
        }
        debug!(from = %self.state, to = %to, "acquisition state");
        self.state = to;
        Ok(())
    }

    // =========================================================================
    // Arm / start
    // =========================================================================

    /// Validate `input` and configure the camera. `Idle -> Armed`.
    pub fn arm(
        &mut self,
        port: &mut dyn DevicePort,
        caps: &DeviceCapabilities,
        input: &AcquisitionConfig,
    ) -> CamResult<ValidatedConfig> {
        if !self.state.can_arm() {
            return Err(CamError::InvalidState {
                operation: "arm",
                state: self.state,
            });
        }
        if let Some(run) = self.run.take() {
            self.discard(&run, "re-arm");
        }
        self.poll = None;

        match self.configure(port, caps, input) {
            Ok(validated) => {
                self.run = Some(ActiveRun {
                    validated: validated.clone(),
                    frames: RawFrameSet::new(),
                });
                self.transition(AcquisitionState::Armed)?;
                Ok(validated)
            }
            Err(err) => {
                self.status.fatal("arm", &err);
                self.transition(AcquisitionState::Idle)?;
                Err(err)
            }
        }
    }

    fn configure(
        &mut self,
        port: &mut dyn DevicePort,
        caps: &DeviceCapabilities,
        input: &AcquisitionConfig,
    ) -> CamResult<ValidatedConfig> {
        let fast_kinetics = input.kin_frames > 1;
        let arm = ArmSettings {
            acquisition_mode: if fast_kinetics {
                AcquisitionModeCode::FastKinetics
            } else {
                AcquisitionModeCode::Single
            },
            read_mode: READ_MODE_IMAGE,
            shutter: ShutterSettings {
                mode: self.settings.shutter_mode,
                closing_ms: caps.shutter_min_times_ms.0,
                opening_ms: caps.shutter_min_times_ms.1,
            },
            trigger: self.settings.trigger_mode,
            em_gain_mode: self.settings.em_gain_mode,
        };
        port.arm(&arm).map_err(|c| CamError::device("Arm", c))?;
        self.status.info(
            "arm",
            format!(
                "Acquisition mode {}, {} trigger, shutter {:?}.",
                if fast_kinetics { "fast kinetics" } else { "single scan" },
                arm.trigger.as_str(),
                arm.shutter.mode
            ),
        );

        let em_range = port
            .em_gain_range()
            .map_err(|c| CamError::device("GetEMGainRange", c))?;
        let validated = validate(input, caps, em_range, &self.settings)?;
        for adjustment in &validated.adjustments {
            self.status.warn("validate", adjustment.as_str());
        }

        port.set_em_gain(validated.config.em_gain)
            .map_err(|c| CamError::device("SetEMCCDGain", c))?;
        port.set_readout(&validated.readout())
            .map_err(|c| CamError::device("SetReadout", c))?;
        match &validated.mode {
            AcquisitionMode::FastKinetics(setup) => {
                port.set_fast_kinetics(setup)
                    .map_err(|c| CamError::device("SetFastKineticsEx", c))?;
                self.status.info("arm", "Fast Kinetics set.");
            }
            AcquisitionMode::Single(setup) => {
                port.set_image(setup)
                    .map_err(|c| CamError::device("SetImage", c))?;
                self.status.info("arm", "Image readout set.");
            }
        }

        let timings = port
            .acquisition_timings()
            .map_err(|c| CamError::device("GetAcquisitionTimings", c))?;
        self.status.info(
            "arm",
            format!(
                "Exposure {:.5} s, kinetic cycle {:.5} s, readout {:.5} s.",
                timings.exposure_s, timings.kinetic_s, timings.readout_s
            ),
        );
        Ok(validated)
    }

    /// Start the armed acquisition and schedule the first poll. `Armed -> Exposing`.
    pub fn start(
        &mut self,
        port: &mut dyn DevicePort,
        timers: &mut TimerQueue,
        now: Duration,
    ) -> CamResult<()> {
        if !self.state.can_start() {
            return Err(CamError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }

        if let Err(code) = port.start() {
            let err = CamError::device("StartAcquisition", code);
            self.status.fatal("start", &err);
            if let Some(run) = self.run.take() {
                self.discard(&run, "start failure");
            }
            self.transition(AcquisitionState::Idle)?;
            return Err(err);
        }

        self.transition(AcquisitionState::Exposing)?;
        self.poll = Some(timers.schedule(
            TimerTask::AcquisitionPoll,
            now,
            self.settings.poll_interval(),
        ));
        if let Some(run) = &self.run {
            self.status.info(
                "start",
                format!(
                    "Waiting for shot {} of {}.",
                    run.frames.shot_count() + 1,
                    run.validated.shots()
                ),
            );
        }
        Ok(())
    }

    // =========================================================================
    // Polling
    // =========================================================================

    /// Handle a fired acquisition poll.
    pub fn on_poll(
        &mut self,
        handle: TimerHandle,
        port: &mut dyn DevicePort,
        timers: &mut TimerQueue,
        now: Duration,
    ) -> CamResult<PollOutcome> {
        if self.poll.as_ref() != Some(&handle) || self.state != AcquisitionState::Exposing {
            debug!(state = %self.state, "ignoring stale acquisition poll");
            return Ok(PollOutcome::Ignored);
        }

        match port.poll_status() {
            Ok(AcquisitionStatus::Busy) => {
                self.reschedule(timers, now);
                Ok(PollOutcome::StillExposing)
            }
            Ok(AcquisitionStatus::Idle) => self.retrieve(port, timers, now),
            Ok(AcquisitionStatus::Error(code)) => {
                Err(self.fault(port, CamError::device("GetStatus", code)))
            }
            Err(code) if code.is_transient() => {
                self.status
                    .warn("poll", format!("Status query failed ({code}), retrying."));
                self.reschedule(timers, now);
                Ok(PollOutcome::StillExposing)
            }
            Err(code) => Err(self.fault(port, CamError::device("GetStatus", code))),
        }
    }

    fn reschedule(&mut self, timers: &mut TimerQueue, now: Duration) {
        self.poll = Some(timers.schedule(
            TimerTask::AcquisitionPoll,
            now,
            self.settings.poll_interval(),
        ));
    }

    fn retrieve(
        &mut self,
        port: &mut dyn DevicePort,
        timers: &mut TimerQueue,
        now: Duration,
    ) -> CamResult<PollOutcome> {
        self.transition(AcquisitionState::Retrieving)?;
        let Some(mut run) = self.run.take() else {
            self.transition(AcquisitionState::Faulted)?;
            return Err(CamError::InvalidState {
                operation: "retrieve",
                state: self.state,
            });
        };

        let len = run.validated.buffer_len();
        let buffer = match port.read_buffer(len) {
            Ok(buffer) => buffer,
            Err(code) => {
                self.run = Some(run);
                return Err(self.fault(port, CamError::device("GetImages", code)));
            }
        };

        let per_shot = run.validated.mode.frames_per_shot() as usize;
        let stored = reshape(
            &buffer,
            per_shot,
            run.validated.frame_width,
            run.validated.frame_height,
        )
        .and_then(|frames| run.frames.push_shot(frames));
        if let Err(err) = stored {
            self.run = Some(run);
            self.status.fatal("retrieve", &err);
            self.transition(AcquisitionState::Aborting)?;
            for stop_err in self.stop_camera(port) {
                warn!(error = %stop_err, "stop after shape error failed");
            }
            if let Some(run) = self.run.take() {
                self.discard(&run, "shape error");
            }
            self.transition(AcquisitionState::Idle)?;
            return Err(err);
        }

        self.transition(AcquisitionState::LoopPending)?;
        let shot = u32::try_from(run.frames.shot_count()).unwrap_or(u32::MAX);
        let total = run.validated.shots();
        self.status
            .info("retrieve", format!("Readout complete! Shot {shot} of {total}."));

        if shot < total {
            self.run = Some(run);
            self.transition(AcquisitionState::Armed)?;
            self.start(port, timers, now)?;
            return Ok(PollOutcome::ShotAcquired { shot, of: total });
        }

        self.transition(AcquisitionState::Complete)?;
        let output = Arc::new(self.finish(run));
        self.last_output = Some(Arc::clone(&output));
        self.status.info(
            "complete",
            format!(
                "Acquisition complete: {} shot(s) of {} frame(s).",
                output.raw.shot_count(),
                output.raw.kinetic_count()
            ),
        );

        if self.settings.loops_continuously() {
            self.run = Some(ActiveRun {
                validated: output.config.clone(),
                frames: RawFrameSet::new(),
            });
            self.transition(AcquisitionState::Armed)?;
            if let Err(err) = self.start(port, timers, now) {
                warn!(error = %err, "continuous loop could not restart");
            }
        } else {
            self.transition(AcquisitionState::Idle)?;
        }
        Ok(PollOutcome::Completed(output))
    }

    fn finish(&mut self, run: ActiveRun) -> AcquisitionOutput {
        let mode = run.validated.mode.derivation();
        let derived = match self.computer.compute(&run.frames, mode, self.roles) {
            Ok(images) => Some(images),
            Err(err) => {
                self.status
                    .warn("derive", format!("Derived images skipped: {err}"));
                None
            }
        };
        AcquisitionOutput {
            raw: Arc::new(run.frames),
            derived,
            config: run.validated,
            completed_at: Local::now(),
        }
    }

    /// Recompute the last output's derived images with new roles.
    ///
    /// The roles are kept for later loops only if they fit the last output.
    pub fn remap(&mut self, roles: FrameRoles) -> CamResult<Option<Arc<AcquisitionOutput>>> {
        let Some(last) = self.last_output.clone() else {
            self.roles = roles;
            return Ok(None);
        };
        let mode = last.config.mode.derivation();
        let derived = self.computer.compute(&last.raw, mode, roles)?;
        self.roles = roles;
        let output = Arc::new(AcquisitionOutput {
            raw: Arc::clone(&last.raw),
            derived: Some(derived),
            config: last.config.clone(),
            completed_at: last.completed_at,
        });
        self.last_output = Some(Arc::clone(&output));
        Ok(Some(output))
    }

    // =========================================================================
    // Abort / fault
    // =========================================================================

    /// Abort from any state. Always ends `Idle`.
    pub fn abort(&mut self, port: &mut dyn DevicePort, timers: &mut TimerQueue) -> AbortReport {
        let mut errors = Vec::new();
        if let Err(err) = self.transition(AcquisitionState::Aborting) {
            errors.push(err);
        }
        errors.extend(self.stop_camera(port));

        let outcome = match &self.poll {
            None => AbortOutcome::NothingInFlight,
            Some(handle) => match timers.cancel(handle) {
                CancelOutcome::Cancelled => AbortOutcome::Aborted {
                    shots_discarded: self.shots_collected(),
                },
                CancelOutcome::AlreadyFired | CancelOutcome::AlreadyCancelled => {
                    AbortOutcome::AfterCompletion
                }
            },
        };

        match outcome {
            AbortOutcome::Aborted { .. } => self.status.info("abort", "Acquisition aborted."),
            AbortOutcome::NothingInFlight => self
                .status
                .info("abort", "Abort requested with nothing in flight."),
            AbortOutcome::AfterCompletion => self
                .status
                .info("abort", "Abort requested after completion."),
        }
        if let Some(run) = self.run.take() {
            self.discard(&run, "abort");
        }
        if let Err(err) = self.transition(AcquisitionState::Idle) {
            errors.push(err);
        }
        AbortReport { outcome, errors }
    }

    fn fault(&mut self, port: &mut dyn DevicePort, err: CamError) -> CamError {
        self.status.fatal("acquisition", &err);
        for stop_err in self.stop_camera(port) {
            warn!(error = %stop_err, "stop after device error failed");
        }
        if let Some(run) = self.run.take() {
            self.discard(&run, "device error");
        }
        if let Err(transition_err) = self.transition(AcquisitionState::Faulted) {
            warn!(error = %transition_err, "could not mark controller faulted");
        }
        err
    }

    /// Abort the camera and close the shutter. A camera that is already idle is fine.
    fn stop_camera(&self, port: &mut dyn DevicePort) -> Vec<CamError> {
        let mut errors = Vec::new();
        match port.abort() {
            Ok(()) => self.status.info("abort", "Aborted successfully."),
            Err(StatusCode::IDLE) => debug!("abort: camera already idle"),
            Err(code) => {
                let err = CamError::device("AbortAcquisition", code);
                self.status.fatal("abort", &err);
                errors.push(err);
            }
        }
        match port.close_shutter() {
            Ok(()) => self.status.info("abort", "Shutter closed."),
            Err(code) => {
                let err = CamError::device("SetShutter", code);
                self.status.fatal("abort", &err);
                errors.push(err);
            }
        }
        errors
    }

    fn discard(&self, run: &ActiveRun, reason: &str) {
        self.status.warn(
            "acquisition",
            format!(
                "Discarding {} shot(s), {} frame(s) collected before {reason}.",
                run.frames.shot_count(),
                run.frames.frame_count()
            ),
        );
    }
}

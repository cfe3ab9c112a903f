//! Tokio driver for a [`CameraSession`].
//!
//! The session itself is synchronous and clock-free. [`SessionRuntime`] owns it
//! inside a single task and feeds it two things: commands arriving over an
//! mpsc channel, and wall-clock time whenever the earliest timer deadline is
//! reached. Everything the session reports is broadcast as a
//! [`SessionEvent`].
//!
//! # Message Flow
//!
//! ```text
//! Caller                              Runtime task
//! ------                              ------------
//! 1. Build command with oneshot
//! 2. Send via mpsc channel    ------>
//!                                     3. select! { command | next deadline }
//!                                     4. Drive the session
//!                                     5. Send response, broadcast events
//! 6. Await oneshot receiver   <------
//! ```
//!
//! Each command variant has a helper that returns the command together with
//! its receiver:
//!
//! ```rust
//! use krbcam::runtime::SessionCommand;
//!
//! let (cmd, rx) = SessionCommand::set_target(-40);
//! // commands.send(cmd).await?;
//! // let applied = rx.await??;
//! ```

use crate::acquisition::{AbortOutcome, AcquisitionOutput, ValidatedConfig};
use crate::config::AcquisitionConfig;
use crate::error::{CamError, CamResult};
use crate::frames::FrameRoles;
use crate::session::{CameraSession, SessionEvent};
use crate::shutdown::{OperatorPrompt, ShutdownReport};
use crate::storage::FrameSink;
use crate::thermal::ThermalState;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

type Reply<T> = oneshot::Sender<CamResult<T>>;

/// Commands accepted by the runtime task.
pub enum SessionCommand {
    /// Arm and start an acquisition loop.
    Acquire {
        /// Acquisition parameters.
        config: AcquisitionConfig,
        /// The config after validation.
        response: Reply<ValidatedConfig>,
    },
    /// Abort whatever is running.
    Abort {
        /// What the abort found.
        response: Reply<AbortOutcome>,
    },
    /// Switch the cooler on.
    CoolerOn {
        /// Response channel.
        response: Reply<()>,
    },
    /// Switch the cooler off.
    CoolerOff {
        /// Response channel.
        response: Reply<()>,
    },
    /// Change the cooler set point.
    SetTarget {
        /// Requested set point in °C.
        celsius: i32,
        /// The set point actually applied.
        response: Reply<i32>,
    },
    /// Recompute derived images with new frame roles.
    RemapRoles {
        /// New roles.
        roles: FrameRoles,
        /// The recomputed output, `None` before the first completed loop.
        response: Reply<Option<Arc<AcquisitionOutput>>>,
    },
    /// Read the temperature now.
    ReadTemperature {
        /// Response channel.
        response: Reply<ThermalState>,
    },
    /// Run the guarded shutdown sequence; the runtime stops when it succeeds.
    Shutdown {
        /// Operator decision for the temperature gate.
        prompt: Box<dyn OperatorPrompt + Send>,
        /// Response channel.
        response: Reply<ShutdownReport>,
    },
}

impl SessionCommand {
    /// Helper to create an Acquire command
    pub fn acquire(config: AcquisitionConfig) -> (Self, oneshot::Receiver<CamResult<ValidatedConfig>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Acquire { config, response: tx }, rx)
    }

    /// Helper to create an Abort command
    pub fn abort() -> (Self, oneshot::Receiver<CamResult<AbortOutcome>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Abort { response: tx }, rx)
    }

    /// Helper to create a CoolerOn command
    pub fn cooler_on() -> (Self, oneshot::Receiver<CamResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::CoolerOn { response: tx }, rx)
    }

    /// Helper to create a CoolerOff command
    pub fn cooler_off() -> (Self, oneshot::Receiver<CamResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::CoolerOff { response: tx }, rx)
    }

    /// Helper to create a SetTarget command
    pub fn set_target(celsius: i32) -> (Self, oneshot::Receiver<CamResult<i32>>) {
        let (tx, rx) = oneshot::channel();
        (Self::SetTarget { celsius, response: tx }, rx)
    }

    /// Helper to create a RemapRoles command
    pub fn remap_roles(
        roles: FrameRoles,
    ) -> (Self, oneshot::Receiver<CamResult<Option<Arc<AcquisitionOutput>>>>) {
        let (tx, rx) = oneshot::channel();
        (Self::RemapRoles { roles, response: tx }, rx)
    }

    /// Helper to create a ReadTemperature command
    pub fn read_temperature() -> (Self, oneshot::Receiver<CamResult<ThermalState>>) {
        let (tx, rx) = oneshot::channel();
        (Self::ReadTemperature { response: tx }, rx)
    }

    /// Helper to create a Shutdown command
    pub fn shutdown(
        prompt: Box<dyn OperatorPrompt + Send>,
    ) -> (Self, oneshot::Receiver<CamResult<ShutdownReport>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { prompt, response: tx }, rx)
    }
}

/// Owns a session inside the runtime task.
pub struct SessionRuntime {
    session: CameraSession,
    sink: Arc<dyn FrameSink>,
    events: broadcast::Sender<SessionEvent>,
    epoch: Instant,
}

impl SessionRuntime {
    /// `epoch` must be the instant the session's clock offsets are measured from.
    pub fn new(
        session: CameraSession,
        sink: Arc<dyn FrameSink>,
        events: broadcast::Sender<SessionEvent>,
        epoch: Instant,
    ) -> Self {
        Self {
            session,
            sink,
            events,
            epoch,
        }
    }

    /// Process commands and timers until shutdown succeeds or every sender is gone.
    ///
    /// When the channel closes without a shutdown the session is dropped,
    /// which stops the camera and releases it only if it is warm.
    pub async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        info!("session runtime started");
        loop {
            let deadline = self.session.next_deadline().map(|d| self.epoch + d);
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(command) => {
                            if self.handle(command).await {
                                break;
                            }
                        }
                        None => {
                            info!("command channel closed");
                            break;
                        }
                    }
                }
                () = sleep_until(deadline) => {
                    let now = self.epoch.elapsed();
                    for event in self.session.fire_due(now) {
                        self.publish(event).await;
                    }
                }
            }
        }
        info!("session runtime stopped");
    }

    /// Returns `true` when the runtime should stop.
    async fn handle(&mut self, command: SessionCommand) -> bool {
        let now = self.epoch.elapsed();
        match command {
            SessionCommand::Acquire { config, response } => {
                let _ = response.send(self.session.acquire(&config, now));
            }
            SessionCommand::Abort { response } => {
                let result = match self.session.abort() {
                    Ok(events) => {
                        let mut outcome = AbortOutcome::NothingInFlight;
                        for event in events {
                            if let SessionEvent::Aborted(o) = &event {
                                outcome = *o;
                            }
                            self.publish(event).await;
                        }
                        Ok(outcome)
                    }
                    Err(err) => Err(err),
                };
                let _ = response.send(result);
            }
            SessionCommand::CoolerOn { response } => {
                let _ = response.send(self.session.cooler_on(now));
            }
            SessionCommand::CoolerOff { response } => {
                let _ = response.send(self.session.cooler_off());
            }
            SessionCommand::SetTarget { celsius, response } => {
                let _ = response.send(self.session.set_target(celsius));
            }
            SessionCommand::RemapRoles { roles, response } => {
                let _ = response.send(self.session.remap_roles(roles));
            }
            SessionCommand::ReadTemperature { response } => {
                let result = self.session.read_temperature();
                if let Ok(state) = &result {
                    self.publish(SessionEvent::Temperature(*state)).await;
                }
                let _ = response.send(result);
            }
            SessionCommand::Shutdown { prompt, response } => {
                let result = self.session.shutdown(prompt.as_ref(), now);
                let done = result.is_ok();
                let _ = response.send(result);
                return done;
            }
        }
        false
    }

    async fn publish(&mut self, event: SessionEvent) {
        let saved = match &event {
            SessionEvent::AcquisitionComplete(output) => Some(Arc::clone(output)),
            _ => None,
        };
        if self.events.send(event).is_err() {
            debug!("no event subscribers");
        }
        if let Some(output) = saved {
            let follow_up = match self.sink.persist(&output).await {
                Ok(paths) => SessionEvent::Saved { paths },
                Err(err) => {
                    self.session.status().fatal("save", &err);
                    SessionEvent::fault("save", &err)
                }
            };
            let _ = self.events.send(follow_up);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Cloneable client for a running [`SessionRuntime`].
#[derive(Clone)]
pub struct RuntimeHandle {
    commands: mpsc::Sender<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
}

impl RuntimeHandle {
    async fn request<T>(
        &self,
        (command, rx): (SessionCommand, oneshot::Receiver<CamResult<T>>),
    ) -> CamResult<T> {
        self.commands
            .send(command)
            .await
            .map_err(|_| CamError::SessionClosed)?;
        rx.await.map_err(|_| CamError::SessionClosed)?
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Arm and start an acquisition loop.
    pub async fn acquire(&self, config: AcquisitionConfig) -> CamResult<ValidatedConfig> {
        self.request(SessionCommand::acquire(config)).await
    }

    /// Abort whatever is running.
    pub async fn abort(&self) -> CamResult<AbortOutcome> {
        self.request(SessionCommand::abort()).await
    }

    /// Switch the cooler on.
    pub async fn cooler_on(&self) -> CamResult<()> {
        self.request(SessionCommand::cooler_on()).await
    }

    /// Switch the cooler off.
    pub async fn cooler_off(&self) -> CamResult<()> {
        self.request(SessionCommand::cooler_off()).await
    }

    /// Change the cooler set point.
    pub async fn set_target(&self, celsius: i32) -> CamResult<i32> {
        self.request(SessionCommand::set_target(celsius)).await
    }

    /// Recompute derived images with new frame roles.
    pub async fn remap_roles(&self, roles: FrameRoles) -> CamResult<Option<Arc<AcquisitionOutput>>> {
        self.request(SessionCommand::remap_roles(roles)).await
    }

    /// Read the temperature now.
    pub async fn read_temperature(&self) -> CamResult<ThermalState> {
        self.request(SessionCommand::read_temperature()).await
    }

    /// Run the guarded shutdown sequence.
    pub async fn shutdown(
        &self,
        prompt: impl OperatorPrompt + Send + 'static,
    ) -> CamResult<ShutdownReport> {
        self.request(SessionCommand::shutdown(Box::new(prompt))).await
    }
}

/// Spawn a runtime task for `session`.
///
/// `epoch` must be the instant the session was opened at (its time zero).
pub fn spawn(
    session: CameraSession,
    sink: Arc<dyn FrameSink>,
    epoch: Instant,
    capacity: usize,
) -> (RuntimeHandle, JoinHandle<()>) {
    let (command_tx, command_rx) = mpsc::channel(capacity);
    let (events, _) = broadcast::channel(capacity.max(16));
    let runtime = SessionRuntime::new(session, sink, events.clone(), epoch);
    let task = tokio::spawn(runtime.run(command_rx));
    (
        RuntimeHandle {
            commands: command_tx,
            events,
        },
        task,
    )
}

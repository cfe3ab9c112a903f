//! Runtime driver tests.
//!
//! Runs the tokio runtime task against the simulated camera with the clock
//! paused, so poll intervals and temperature periods elapse instantly.

use krbcam::acquisition::AbortOutcome;
use krbcam::config::{AcquisitionConfig, CameraSettings};
use krbcam::hardware::{SimHandle, SimulatedCamera};
use krbcam::runtime::{self, RuntimeHandle};
use krbcam::session::{CameraSession, SessionEvent};
use krbcam::shutdown::DenyUnsafe;
use krbcam::status::StatusLog;
use krbcam::storage::sink_from_settings;
use krbcam::thermal::ThermalState;
use krbcam::CamError;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

const WAIT: Duration = Duration::from_secs(600);

fn start_runtime() -> (RuntimeHandle, JoinHandle<()>, SimHandle) {
    let mut settings = CameraSettings::default();
    settings.acquisition.continuous_loop = false;
    settings.storage.save_files = false;

    let camera = SimulatedCamera::new();
    let sim = camera.handle();
    let status = StatusLog::new();
    let epoch = Instant::now();
    let session = CameraSession::open(Box::new(camera), &settings, status.clone(), Duration::ZERO)
        .expect("Failed to open session");
    let sink = sink_from_settings(&settings.storage, status);
    let (handle, task) = runtime::spawn(session, sink, epoch, 32);
    (handle, task, sim)
}

/// Next event matching `pred`, skipping everything else.
async fn wait_for(
    events: &mut broadcast::Receiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("runtime stopped"),
            }
        }
    })
    .await
    .expect("Timed out waiting for event")
}

async fn next_temperature(events: &mut broadcast::Receiver<SessionEvent>) -> ThermalState {
    match wait_for(events, |e| matches!(e, SessionEvent::Temperature(_))).await {
        SessionEvent::Temperature(state) => state,
        _ => unreachable!(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_acquire_runs_to_completion() {
    let (handle, task, sim) = start_runtime();
    let mut events = handle.subscribe();

    let config = AcquisitionConfig {
        kin_frames: 2,
        acq_length: 3,
        dy: 8,
        ..AcquisitionConfig::default()
    };
    let validated = handle.acquire(config).await.unwrap();
    assert_eq!(validated.shots(), 3);

    let complete = wait_for(&mut events, |e| {
        matches!(e, SessionEvent::AcquisitionComplete(_))
    })
    .await;
    let SessionEvent::AcquisitionComplete(output) = complete else {
        unreachable!()
    };
    assert_eq!(output.raw.shot_count(), 3);
    assert!(output.derived.is_some());

    // saving is off, so the follow-up lists no files
    let saved = wait_for(&mut events, |e| matches!(e, SessionEvent::Saved { .. })).await;
    assert!(matches!(saved, SessionEvent::Saved { paths } if paths.is_empty()));
    assert_eq!(sim.starts(), 3);

    // the last poll already fired
    assert_eq!(handle.abort().await.unwrap(), AbortOutcome::AfterCompletion);

    let report = handle.shutdown(DenyUnsafe).await.unwrap();
    assert!(report.is_clean());
    task.await.unwrap();
    assert!(sim.is_shut_down());
}

#[tokio::test(start_paused = true)]
async fn test_thermal_commands_wait_for_abort() {
    let (handle, task, sim) = start_runtime();
    sim.set_busy_polls(u32::MAX);

    let config = AcquisitionConfig {
        kin_frames: 1,
        acq_length: 1,
        dx: 8,
        dy: 8,
        ..AcquisitionConfig::default()
    };
    handle.acquire(config).await.unwrap();
    assert!(matches!(
        handle.cooler_on().await,
        Err(CamError::InvalidState { .. })
    ));

    assert!(matches!(
        handle.abort().await.unwrap(),
        AbortOutcome::Aborted { shots_discarded: 0 }
    ));
    handle.cooler_on().await.unwrap();
    assert!(sim.cooler_is_on());

    handle.cooler_off().await.unwrap();
    handle.shutdown(DenyUnsafe).await.unwrap();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_cold_shutdown_waits_for_warm_up() {
    let (handle, task, sim) = start_runtime();
    let mut events = handle.subscribe();

    assert_eq!(handle.set_target(-40).await.unwrap(), -40);
    handle.cooler_on().await.unwrap();
    loop {
        let state = next_temperature(&mut events).await;
        if state.temperature.is_some_and(|t| t <= -30.0) {
            break;
        }
    }

    assert!(matches!(
        handle.shutdown(DenyUnsafe).await,
        Err(CamError::SafetyViolation { .. })
    ));
    assert!(!sim.is_shut_down());

    // polling resumed after the refusal; warm up and try again
    handle.cooler_off().await.unwrap();
    loop {
        let state = next_temperature(&mut events).await;
        if state.is_safe_to_shutdown() {
            break;
        }
    }
    let report = handle.shutdown(DenyUnsafe).await.unwrap();
    assert!(!report.overridden);
    task.await.unwrap();
    assert!(sim.is_shut_down());

    assert!(matches!(
        handle.read_temperature().await,
        Err(CamError::SessionClosed)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_dropping_every_handle_releases_warm_camera() {
    let (handle, task, sim) = start_runtime();
    let state = handle.read_temperature().await.unwrap();
    assert_eq!(state.temperature, Some(20.0));

    drop(handle);
    task.await.unwrap();
    assert!(sim.is_shut_down());
}

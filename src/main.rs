//! CLI entry point for krbcam.
//!
//! Drives the simulated camera through the same session, runtime and storage
//! path the lab frontend uses:
//! - `acquire`: run acquisition loops, save CSV files, then shut down
//! - `monitor`: cool the sensor, report temperatures, warm up and shut down
//! - `show-config`: print the effective settings
//!
//! # Usage
//!
//! ```bash
//! krbcam acquire --config acq.json --cycles 2
//! krbcam monitor --seconds 60 --target -40
//! KRBCAM_THERMAL__SAFE_SHUTDOWN_C=-15 krbcam show-config
//! ```

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use krbcam::config::{AcquisitionConfig, CameraSettings, DEFAULT_SETTINGS_PATH};
use krbcam::error::CamError;
use krbcam::hardware::SimulatedCamera;
use krbcam::runtime::{self, RuntimeHandle};
use krbcam::session::{CameraSession, SessionEvent};
use krbcam::shutdown::{DenyUnsafe, ForceShutdown, ShutdownReport};
use krbcam::status::StatusLog;
use krbcam::{logging, storage};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;

#[derive(Parser)]
#[command(name = "krbcam")]
#[command(about = "EMCCD acquisition and thermal safety control", long_about = None)]
struct Cli {
    /// Settings file (TOML)
    #[arg(long, global = true, default_value = DEFAULT_SETTINGS_PATH)]
    settings: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run acquisition loops on the simulated camera
    Acquire {
        /// Acquisition config (JSON); defaults apply when omitted
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of loops to run
        #[arg(long, default_value = "1")]
        cycles: u32,

        /// Save root, overriding the settings file
        #[arg(long)]
        output: Option<PathBuf>,

        /// Do not write any files
        #[arg(long)]
        no_save: bool,

        /// Shut down even if the sensor is below the safe temperature
        #[arg(long)]
        force_unsafe_shutdown: bool,
    },

    /// Cool the sensor and report temperatures
    Monitor {
        /// How long to keep the cooler on
        #[arg(long, default_value = "30")]
        seconds: u64,

        /// Cooler set point in °C
        #[arg(long)]
        target: Option<i32>,
    },

    /// Print the effective settings as TOML
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = CameraSettings::load_from(&cli.settings)?;

    match cli.command {
        Commands::ShowConfig => {
            settings.validate()?;
            print!("{}", settings.to_toml()?);
            Ok(())
        }
        Commands::Acquire {
            config,
            cycles,
            output,
            no_save,
            force_unsafe_shutdown,
        } => {
            if let Some(output) = output {
                settings.storage.save_root = output;
            }
            if no_save {
                settings.storage.save_files = false;
            }
            // the CLI re-arms explicitly, one loop per cycle
            settings.acquisition.continuous_loop = false;
            settings.validate()?;
            logging::init_from_settings(&settings)?;

            let config = match config {
                Some(path) => AcquisitionConfig::from_json_file(&path)?,
                None => AcquisitionConfig::default(),
            };
            run_acquire(&settings, config, cycles, force_unsafe_shutdown).await
        }
        Commands::Monitor { seconds, target } => {
            settings.validate()?;
            logging::init_from_settings(&settings)?;
            run_monitor(&settings, Duration::from_secs(seconds), target).await
        }
    }
}

fn open_simulated(
    settings: &CameraSettings,
) -> Result<(RuntimeHandle, tokio::task::JoinHandle<()>)> {
    let status = StatusLog::new();
    let epoch = Instant::now();
    let session = CameraSession::open(
        Box::new(SimulatedCamera::new()),
        settings,
        status.clone(),
        Duration::ZERO,
    )?;
    let caps = session.capabilities();
    println!(
        "Camera {} ({} x {}) opened",
        caps.model, caps.detector_width, caps.detector_height
    );
    let sink = storage::sink_from_settings(&settings.storage, status);
    Ok(runtime::spawn(session, sink, epoch, 32))
}

async fn run_acquire(
    settings: &CameraSettings,
    config: AcquisitionConfig,
    cycles: u32,
    force_unsafe_shutdown: bool,
) -> Result<()> {
    let (handle, task) = open_simulated(settings)?;
    let mut events = handle.subscribe();

    for cycle in 1..=cycles {
        let validated = handle.acquire(config.clone()).await?;
        for adjustment in &validated.adjustments {
            println!("  adjusted: {adjustment}");
        }
        println!(
            "Loop {cycle}/{cycles}: {} shot(s), {} x {} frames",
            validated.shots(),
            validated.frame_width,
            validated.frame_height
        );

        loop {
            match events.recv().await {
                Ok(SessionEvent::ShotAcquired { shot, of }) => println!("  shot {shot}/{of}"),
                Ok(SessionEvent::AcquisitionComplete(output)) => {
                    let derived = output.derived.as_ref().map_or(0, |d| d.frames.len());
                    println!(
                        "  complete: {} frame(s), {derived} derived image(s)",
                        output.raw.frame_count()
                    );
                }
                Ok(SessionEvent::Saved { paths }) => {
                    for path in &paths {
                        println!("  saved {}", path.display());
                    }
                    break;
                }
                Ok(SessionEvent::Fault {
                    operation,
                    header,
                    detail,
                }) => {
                    eprintln!("{header} {detail}");
                    if operation != "temperature" {
                        break;
                    }
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => bail!("session runtime stopped"),
            }
        }
    }

    let result = if force_unsafe_shutdown {
        handle.shutdown(ForceShutdown).await
    } else {
        handle.shutdown(DenyUnsafe).await
    };
    drop(handle);
    task.await?;
    report_shutdown(result)
}

async fn run_monitor(
    settings: &CameraSettings,
    duration: Duration,
    target: Option<i32>,
) -> Result<()> {
    let (handle, task) = open_simulated(settings)?;
    let mut events = handle.subscribe();

    if let Some(target) = target {
        let applied = handle.set_target(target).await?;
        println!("Set point {applied} C");
    }
    handle.cooler_on().await?;

    let stop_at = Instant::now() + duration;
    while let Ok(event) = tokio::time::timeout_at(stop_at, events.recv()).await {
        if matches!(event, Err(RecvError::Closed)) {
            bail!("session runtime stopped");
        }
        print_temperature(event);
    }

    handle.cooler_off().await?;
    println!("Cooler off, waiting for the sensor to warm up");
    let result = loop {
        match handle.shutdown(DenyUnsafe).await {
            Err(CamError::SafetyViolation { .. }) => {
                // wait for the next reading before asking again
                loop {
                    match events.recv().await {
                        Ok(SessionEvent::Temperature(state)) => {
                            print_temperature(Ok(SessionEvent::Temperature(state)));
                            break;
                        }
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => bail!("session runtime stopped"),
                    }
                }
            }
            other => break other,
        }
    };
    drop(handle);
    task.await?;
    report_shutdown(result)
}

fn print_temperature(event: std::result::Result<SessionEvent, RecvError>) {
    match event {
        Ok(SessionEvent::Temperature(state)) => {
            let reading = state
                .temperature
                .map_or_else(|| "unknown".to_string(), |t| format!("{t:.1} C"));
            let status = state.status.map_or("", |s| s.describe());
            println!("  {reading} (set point {} C) {status}", state.target);
        }
        Ok(SessionEvent::Fault { header, detail, .. }) => eprintln!("{header} {detail}"),
        _ => {}
    }
}

fn report_shutdown(result: krbcam::CamResult<ShutdownReport>) -> Result<()> {
    match result {
        Ok(report) => {
            for step in &report.steps {
                match &step.error {
                    Some(error) => println!("  {} failed: {error}", step.name),
                    None => println!("  {} ok", step.name),
                }
            }
            if report.overridden {
                println!("Camera shut down below the safe temperature");
            } else {
                println!("Camera shut down");
            }
            report.into_result()?;
            Ok(())
        }
        Err(err) => {
            eprintln!("{} {err}", err.header());
            Err(err.into())
        }
    }
}

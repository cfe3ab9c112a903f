//! Tracing setup.
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` and one of
//! three output formats. `RUST_LOG` wins over the configured level.
//!
//! # Example
//! ```no_run
//! use krbcam::{config::CameraSettings, logging};
//! use tracing::{info, warn};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = CameraSettings::load()?;
//! logging::init_from_settings(&settings)?;
//!
//! info!("camera control started");
//! warn!(operation = "arm", "dx adjusted");
//! # Ok(())
//! # }
//! ```

use crate::config::CameraSettings;
use crate::error::{CamError, CamResult};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Pretty-printed, multi-line (interactive use)
    Pretty,
    /// One line per event
    Compact,
    /// JSON lines (log aggregation)
    Json,
}

/// Logging options
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Include file and line numbers
    pub with_file_and_line: bool,
    /// Include thread IDs
    pub with_thread_ids: bool,
    /// ANSI colors (Pretty only)
    pub with_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_file_and_line: false,
            with_thread_ids: false,
            with_ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Logging config at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Logging config from `application.log_level`.
    pub fn from_settings(settings: &CameraSettings) -> CamResult<Self> {
        Ok(Self::new(parse_log_level(&settings.application.log_level)?))
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable file and line numbers
    pub fn with_file_and_line(mut self, enabled: bool) -> Self {
        self.with_file_and_line = enabled;
        self
    }

    /// Enable or disable ANSI colors
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialize logging from settings.
pub fn init_from_settings(settings: &CameraSettings) -> CamResult<()> {
    init(LoggingConfig::from_settings(settings)?)
}

/// Initialize logging.
///
/// Idempotent: a subscriber that is already installed is left in place and
/// `Ok(())` is returned, so tests and embedding applications can call it freely.
pub fn init(config: LoggingConfig) -> CamResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let layer = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_ids(config.with_thread_ids)
            .with_ansi(config.with_ansi)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_ids(config.with_thread_ids)
            .with_ansi(false)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_ids(config.with_thread_ids)
            .with_filter(env_filter)
            .boxed(),
    };

    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(()) => Ok(()),
        // tests and embedding applications may already have installed one
        Err(e) if e.to_string().contains("already been set") => Ok(()),
        Err(e) => Err(CamError::Config(format!("Failed to initialize logging: {e}"))),
    }
}

/// Parse a level name, case-insensitive.
pub fn parse_log_level(level: &str) -> CamResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(CamError::Config(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))),
    }
}

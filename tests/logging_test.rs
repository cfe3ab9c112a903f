//! Global subscriber installation.
//!
//! Lives in its own test binary: `init` installs a process-wide subscriber,
//! which would collide with `#[traced_test]` in the library's unit tests.

use krbcam::config::CameraSettings;
use krbcam::logging::{self, LoggingConfig, OutputFormat};
use tracing::Level;

#[test]
fn test_init_is_idempotent() {
    logging::init(LoggingConfig::default().with_format(OutputFormat::Json)).unwrap();
    // the second and third calls find a subscriber already installed
    logging::init(LoggingConfig::new(Level::DEBUG)).unwrap();
    logging::init_from_settings(&CameraSettings::default()).unwrap();
    tracing::info!("logging initialised");
}

//! Configuration and logging shared by the livestudio binaries

pub mod config;
pub mod logging;

pub use config::{Config, ConfigValidationError, LoggingConfig, SignalingConfig, StudioConfig};
pub use logging::init_logging;

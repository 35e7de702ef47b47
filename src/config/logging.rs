//! Logging setup

use tracing_subscriber::{fmt, EnvFilter};

use super::loader::{ConfigError, LoggingSection};

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(section: &LoggingSection) -> Result<(), ConfigError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(section.level.to_lowercase()))
        .map_err(|e| ConfigError::LoggingError(e.to_string()))?;

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| ConfigError::LoggingError(e.to_string()))
}

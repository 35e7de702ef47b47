//! Configuration Module
//!
//! Loads and validates configuration from TOML files and sets up logging.

pub mod loader;
pub mod logging;

pub use loader::{
    load_config, parse_config, Config, ConfigError, LoggingSection, SizingKind,
};
pub use logging::init_logging;

//! KDL configuration parsing for Stackwatch.
//!
//! Handles the system configuration file (`stackwatch.kdl`) and the
//! environment variables that provide its defaults.

pub mod error;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    DEFAULT_CONFIG_PATH, LogFormat, SystemConfig, TailConfig, load_system_config,
    parse_system_config, resolve_system_config,
};

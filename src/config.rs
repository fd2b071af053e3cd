//! Configuration system using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (`config/smelldaq.toml` by default)
//! 2. Environment variables (prefixed with `SMELLDAQ_`, sections split on `__`)
//!
//! ```text
//! SMELLDAQ_APPLICATION__LOG_LEVEL=debug
//! SMELLDAQ_SERIAL__DRIVER_HINT=CP2102N
//! SMELLDAQ_STORAGE__DATA_DIR=/var/lib/smell_daq
//! ```
//!
//! Every section has defaults, so an empty file yields [`Settings::default`].

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::telemetry::TELEMETRY_FIELD_COUNT;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/smelldaq.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Serial line and device protocol settings
    #[serde(default)]
    pub serial: SerialConfig,
    /// Acquisition loop settings
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Sample store settings
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "smell_daq".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Serial port and device protocol configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Substring matched against port manufacturer/description/name
    pub driver_hint: String,
    /// USB vendor id preferred during discovery (Silicon Labs)
    pub vendor_id: u16,
    /// Line rate
    pub baud_rate: u32,
    /// Per-line timeout of the liveness check and info fetch
    pub handshake_timeout_ms: u64,
    /// Lines read while probing a freshly opened port
    pub handshake_attempts: u32,
    /// Bounded wait of a single continuous-read poll
    pub poll_timeout_ms: u64,
    /// Lines read while waiting for the info response
    pub info_attempts: u32,
    /// Maximum field count of an accepted metadata line
    pub metadata_max_fields: usize,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            driver_hint: "CP210x".to_string(),
            vendor_id: 0x10C4,
            baud_rate: 115_200,
            handshake_timeout_ms: 2000,
            handshake_attempts: 3,
            poll_timeout_ms: 250,
            info_attempts: 5,
            metadata_max_fields: 10,
        }
    }
}

impl SerialConfig {
    /// Per-line handshake timeout as a [`Duration`].
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Continuous-read poll timeout as a [`Duration`].
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Acquisition session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Substance recorded until the first substance change ("ambient air")
    pub ambient_substance_id: String,
    /// Consecutive failed iterations tolerated before the loop stops itself
    pub max_consecutive_errors: u32,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            ambient_substance_id: "1".to_string(),
            max_consecutive_errors: 3,
        }
    }
}

/// Storage backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding `samples.csv` and `devices.json`
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from the default file and environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// Order of precedence (highest to lowest): environment variables, the
    /// file, built-in defaults. A missing file is not an error.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SMELLDAQ_").split("__"))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let serial = &self.serial;
        if serial.driver_hint.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "serial.driver_hint cannot be empty".to_string(),
            ));
        }
        if serial.baud_rate == 0 {
            return Err(ConfigError::ValidationError(
                "serial.baud_rate must be > 0".to_string(),
            ));
        }
        if serial.handshake_timeout_ms == 0 || serial.poll_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "serial timeouts must be > 0".to_string(),
            ));
        }
        if serial.handshake_attempts == 0 || serial.info_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "serial attempt counts must be > 0".to_string(),
            ));
        }
        if serial.metadata_max_fields == 0 || serial.metadata_max_fields >= TELEMETRY_FIELD_COUNT {
            return Err(ConfigError::ValidationError(format!(
                "serial.metadata_max_fields must be between 1 and {}",
                TELEMETRY_FIELD_COUNT - 1
            )));
        }

        if self.acquisition.ambient_substance_id.is_empty() {
            return Err(ConfigError::ValidationError(
                "acquisition.ambient_substance_id cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

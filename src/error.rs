//! Error types for the acquisition pipeline.
//!
//! Each layer owns a small `thiserror` enum describing what can go wrong at
//! that level:
//!
//! - **`PortError`**: misuse of the port allocation table and discovery
//!   failures.
//! - **`LinkError`**: failures while opening or driving one serial channel.
//! - **`StoreError`**: failures of the persistence collaborator.
//! - **`DaqError`**: the taxonomy surfaced to the request layer. Lower layers
//!   convert into it through `From`, so the session directory can use `?`
//!   and never leaks a raw I/O error upward.

use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Failures raised by the port registry.
#[derive(Error, Debug)]
pub enum PortError {
    #[error("No serial device matching driver '{hint}' found")]
    NoMatchingDevice { hint: String },

    #[error("Port '{0}' is already allocated")]
    AlreadyInUse(String),

    #[error("Port '{0}' is not allocated")]
    NotAllocated(String),

    #[error("Unable to enumerate serial ports: {0}")]
    Enumeration(String),
}

/// Failures raised by a device link.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("No telemetry received on '{0}' (driver not installed?)")]
    DriverNotInstalled(String),

    #[error("Device on '{port}' is not connected: {source}")]
    DeviceNotConnected {
        port: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Port '{0}' is already in use")]
    PortInUse(String),

    #[error("Port '{0}' is not allocated")]
    PortNotAllocated(String),

    #[error("Device info could not be fetched after {attempts} attempts")]
    InfoFetchFailed { attempts: u32 },

    #[error("Invalid command '{0}'")]
    InvalidCommand(String),

    #[error("Serial channel closed")]
    Closed,

    #[error(transparent)]
    Registry(#[from] PortError),
}

/// Failures raised by a [`DataStore`](crate::store::DataStore) backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "storage_csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Device table error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Device with hardware address '{0}' not found")]
    DeviceNotFound(String),

    #[error("Storage backend rejected write: {0}")]
    Rejected(String),
}

/// Errors exposed to the request layer.
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Driver not installed or no device found: {0}")]
    DriverNotInstalled(String),

    #[error("Device not connected: {0}")]
    DeviceNotConnected(String),

    #[error("Port '{0}' is already in use")]
    PortInUse(String),

    #[error("Port '{0}' is not allocated")]
    PortNotAllocated(String),

    #[error("Device info could not be fetched")]
    InfoFetchFailed,

    #[error("Invalid command '{0}'")]
    InvalidCommand(String),

    #[error("Test name '{0}' was already used")]
    DuplicateTestName(String),

    #[error("Test name cannot be empty")]
    EmptyTestName,

    #[error("Substance id cannot be empty")]
    EmptySubstanceId,

    #[error("Device '{0}' is busy running a test")]
    DeviceBusy(String),

    #[error("Device '{0}' is not registered")]
    DeviceNotRegistered(String),

    #[error("Device with name '{0}' already exists")]
    NicknameInUse(String),

    #[error("Test '{0}' is not running")]
    TestNotRunning(String),

    #[error("Test '{test}' is not running on device '{device}'")]
    WrongDevice { test: String, device: String },

    #[error("Unable to spawn acquisition thread: {0}")]
    SpawnFailed(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
}

impl From<PortError> for DaqError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::NoMatchingDevice { hint } => DaqError::DriverNotInstalled(hint),
            PortError::AlreadyInUse(port) => DaqError::PortInUse(port),
            PortError::NotAllocated(port) => DaqError::PortNotAllocated(port),
            PortError::Enumeration(msg) => DaqError::DriverNotInstalled(msg),
        }
    }
}

impl From<LinkError> for DaqError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::DriverNotInstalled(port) => DaqError::DriverNotInstalled(port),
            LinkError::DeviceNotConnected { port, .. } => DaqError::DeviceNotConnected(port),
            LinkError::PortInUse(port) => DaqError::PortInUse(port),
            LinkError::PortNotAllocated(port) => DaqError::PortNotAllocated(port),
            LinkError::InfoFetchFailed { .. } => DaqError::InfoFetchFailed,
            LinkError::InvalidCommand(cmd) => DaqError::InvalidCommand(cmd),
            LinkError::Closed => DaqError::DeviceNotConnected("channel closed".to_string()),
            LinkError::Registry(err) => err.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::DuplicateTestName("t1".to_string());
        assert_eq!(err.to_string(), "Test name 't1' was already used");
    }

    #[test]
    fn test_link_errors_map_to_request_taxonomy() {
        let err: DaqError = LinkError::InfoFetchFailed { attempts: 5 }.into();
        assert!(matches!(err, DaqError::InfoFetchFailed));

        let err: DaqError = LinkError::Registry(PortError::AlreadyInUse("COM3".into())).into();
        assert!(matches!(err, DaqError::PortInUse(port) if port == "COM3"));

        let err: DaqError = LinkError::DeviceNotConnected {
            port: "/dev/ttyUSB0".into(),
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "unplugged"),
        }
        .into();
        assert_eq!(err.to_string(), "Device not connected: /dev/ttyUSB0");
    }

    #[test]
    fn test_no_matching_device_is_driver_not_installed() {
        let err: DaqError = PortError::NoMatchingDevice {
            hint: "CP210x".into(),
        }
        .into();
        assert!(matches!(err, DaqError::DriverNotInstalled(_)));
    }
}

//! Persistence collaborator.
//!
//! The acquisition core needs very little from storage: append a sample,
//! list every test name ever recorded, and keep the connected flag of each
//! known device current. [`DataStore`] captures exactly that; backends are
//! selected by feature flag.

#[cfg(feature = "storage_csv")]
pub mod csv_store;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

#[cfg(feature = "storage_csv")]
pub use csv_store::CsvStore;

use crate::error::StoreError;
use crate::sync::lock;
use crate::telemetry::Sample;

/// Persisted state of one known device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Nickname the device was last registered under
    pub nickname: String,
    /// Hardware (MAC) address, the device's identity
    pub hardware_address: String,
    /// Firmware version reported at registration
    pub software_version: String,
    /// Port the device is attached to, empty while disconnected
    pub port: String,
    /// Whether the device is currently registered
    pub connected: bool,
}

/// Storage operations the acquisition core depends on.
pub trait DataStore: Send + Sync {
    /// Append one sample. Samples are never updated.
    fn append_sample(&self, sample: &Sample) -> Result<(), StoreError>;

    /// Every test name that has at least one persisted sample.
    fn list_all_test_names(&self) -> Result<HashSet<String>, StoreError>;

    /// Insert a device, or update it by hardware address, marking it connected.
    fn persist_device(&self, record: &DeviceRecord) -> Result<(), StoreError>;

    /// Update connectivity and port of a known device.
    fn set_device_connected(
        &self,
        hardware_address: &str,
        connected: bool,
        port: &str,
    ) -> Result<(), StoreError>;

    /// Mark every device disconnected (process start).
    fn clear_connections(&self) -> Result<(), StoreError>;

    /// All known devices.
    fn devices(&self) -> Result<Vec<DeviceRecord>, StoreError>;
}

fn upsert(devices: &mut Vec<DeviceRecord>, record: &DeviceRecord) {
    let record = DeviceRecord {
        connected: true,
        ..record.clone()
    };
    match devices
        .iter_mut()
        .find(|d| d.hardware_address == record.hardware_address)
    {
        Some(existing) => *existing = record,
        None => devices.push(record),
    }
}

fn set_connected(
    devices: &mut [DeviceRecord],
    hardware_address: &str,
    connected: bool,
    port: &str,
) -> Result<(), StoreError> {
    let device = devices
        .iter_mut()
        .find(|d| d.hardware_address == hardware_address)
        .ok_or_else(|| StoreError::DeviceNotFound(hardware_address.to_string()))?;
    device.connected = connected;
    device.port = port.to_string();
    Ok(())
}

fn clear_all(devices: &mut [DeviceRecord]) {
    for device in devices.iter_mut() {
        device.connected = false;
        device.port.clear();
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    samples: Vec<Sample>,
    historical_names: HashSet<String>,
    devices: Vec<DeviceRecord>,
}

/// In-process store, mainly for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    failing_appends: AtomicUsize,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed test names recorded by an earlier run.
    pub fn with_test_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new();
        lock(&store.state)
            .historical_names
            .extend(names.into_iter().map(Into::into));
        store
    }

    /// Seed a device record as it was left by an earlier run.
    pub fn insert_device(&self, record: DeviceRecord) {
        lock(&self.state).devices.push(record);
    }

    /// Make the next `count` appends fail.
    pub fn fail_next_appends(&self, count: usize) {
        self.failing_appends.store(count, Ordering::SeqCst);
    }

    /// All samples appended so far, in order.
    pub fn samples(&self) -> Vec<Sample> {
        lock(&self.state).samples.clone()
    }

    /// Samples of one test, in order.
    pub fn samples_for(&self, test_name: &str) -> Vec<Sample> {
        lock(&self.state)
            .samples
            .iter()
            .filter(|s| s.test_name == test_name)
            .cloned()
            .collect()
    }

    /// Persisted record for `hardware_address`.
    pub fn device(&self, hardware_address: &str) -> Option<DeviceRecord> {
        lock(&self.state)
            .devices
            .iter()
            .find(|d| d.hardware_address == hardware_address)
            .cloned()
    }
}

impl DataStore for MemoryStore {
    fn append_sample(&self, sample: &Sample) -> Result<(), StoreError> {
        let injected = self
            .failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Rejected("injected append failure".to_string()));
        }
        lock(&self.state).samples.push(sample.clone());
        Ok(())
    }

    fn list_all_test_names(&self) -> Result<HashSet<String>, StoreError> {
        let state = lock(&self.state);
        let mut names = state.historical_names.clone();
        names.extend(state.samples.iter().map(|s| s.test_name.clone()));
        Ok(names)
    }

    fn persist_device(&self, record: &DeviceRecord) -> Result<(), StoreError> {
        upsert(&mut lock(&self.state).devices, record);
        Ok(())
    }

    fn set_device_connected(
        &self,
        hardware_address: &str,
        connected: bool,
        port: &str,
    ) -> Result<(), StoreError> {
        set_connected(&mut lock(&self.state).devices, hardware_address, connected, port)
    }

    fn clear_connections(&self) -> Result<(), StoreError> {
        clear_all(&mut lock(&self.state).devices);
        Ok(())
    }

    fn devices(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        Ok(lock(&self.state).devices.clone())
    }
}

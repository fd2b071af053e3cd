//! CSV-backed store.
//!
//! Samples are appended to `samples.csv`, one row per sample, flushed after
//! every row. Device state lives in `devices.json`. The set of used test
//! names is rebuilt from the sample file on open.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info};

use super::{clear_all, set_connected, upsert, DataStore, DeviceRecord};
use crate::error::StoreError;
use crate::sync::lock;
use crate::telemetry::{Sample, CHANNEL_COUNT};

const SAMPLES_FILE: &str = "samples.csv";
const DEVICES_FILE: &str = "devices.json";

fn header() -> Vec<String> {
    let mut columns = vec![
        "test".to_string(),
        "hardware_address".to_string(),
        "substance".to_string(),
        "timestamp".to_string(),
    ];
    columns.extend((1..=CHANNEL_COUNT).map(|i| format!("ch{i}")));
    columns.push("temperature".to_string());
    columns.push("humidity".to_string());
    columns
}

/// Store writing samples to CSV and devices to JSON under one directory.
pub struct CsvStore {
    devices_path: PathBuf,
    writer: Mutex<csv::Writer<File>>,
    test_names: Mutex<HashSet<String>>,
    devices: Mutex<Vec<DeviceRecord>>,
}

impl CsvStore {
    /// Open (or create) a store in `dir`.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let samples_path = dir.join(SAMPLES_FILE);
        let test_names = Self::scan_test_names(&samples_path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&samples_path)?;
        let is_empty = file.metadata()?.len() == 0;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if is_empty {
            writer.write_record(header())?;
            writer.flush()?;
        }

        let devices_path = dir.join(DEVICES_FILE);
        let devices = if devices_path.exists() {
            serde_json::from_slice(&fs::read(&devices_path)?)?
        } else {
            Vec::new()
        };

        info!(
            path = %samples_path.display(),
            tests = test_names.len(),
            "CSV store opened"
        );
        Ok(Self {
            devices_path,
            writer: Mutex::new(writer),
            test_names: Mutex::new(test_names),
            devices: Mutex::new(devices),
        })
    }

    fn scan_test_names(path: &Path) -> Result<HashSet<String>, StoreError> {
        let mut names = HashSet::new();
        if !path.exists() {
            return Ok(names);
        }
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)?;
        for record in reader.records() {
            if let Some(test) = record?.get(0) {
                names.insert(test.to_string());
            }
        }
        Ok(names)
    }

    fn save_devices(&self, devices: &[DeviceRecord]) -> Result<(), StoreError> {
        let tmp = self.devices_path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(devices)?)?;
        fs::rename(&tmp, &self.devices_path)?;
        Ok(())
    }
}

impl DataStore for CsvStore {
    fn append_sample(&self, sample: &Sample) -> Result<(), StoreError> {
        let mut row = Vec::with_capacity(CHANNEL_COUNT + 6);
        row.push(sample.test_name.clone());
        row.push(sample.hardware_address.clone());
        row.push(sample.substance_id.clone());
        row.push(sample.captured_at.to_rfc3339());
        row.extend(sample.channels.iter().cloned());
        row.push(sample.temperature.clone());
        row.push(sample.humidity.clone());

        let mut writer = lock(&self.writer);
        writer.write_record(&row)?;
        writer.flush()?;
        drop(writer);

        lock(&self.test_names).insert(sample.test_name.clone());
        debug!(test = %sample.test_name, "Sample persisted");
        Ok(())
    }

    fn list_all_test_names(&self) -> Result<HashSet<String>, StoreError> {
        Ok(lock(&self.test_names).clone())
    }

    fn persist_device(&self, record: &DeviceRecord) -> Result<(), StoreError> {
        let mut devices = lock(&self.devices);
        upsert(&mut devices, record);
        self.save_devices(&devices)
    }

    fn set_device_connected(
        &self,
        hardware_address: &str,
        connected: bool,
        port: &str,
    ) -> Result<(), StoreError> {
        let mut devices = lock(&self.devices);
        set_connected(&mut devices, hardware_address, connected, port)?;
        self.save_devices(&devices)
    }

    fn clear_connections(&self) -> Result<(), StoreError> {
        info!("Resetting devices connection status");
        let mut devices = lock(&self.devices);
        clear_all(&mut devices);
        self.save_devices(&devices)
    }

    fn devices(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        Ok(lock(&self.devices).clone())
    }
}

//! Test names and device state survive a process restart with the CSV store.
#![cfg(feature = "storage_csv")]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use smell_daq::config::{SerialConfig, Settings};
use smell_daq::link::{MockDevice, MockOpener};
use smell_daq::ports::{FixedPorts, PortRegistry};
use smell_daq::sink::NullSink;
use smell_daq::store::{CsvStore, DataStore};
use smell_daq::{DaqError, SessionDirectory};

const INFO: &str = "1.0.4;A4:CF:12:00:00:01";

fn boot(dir: &std::path::Path) -> (SessionDirectory, Arc<CsvStore>, MockDevice) {
    let registry = Arc::new(PortRegistry::new(Box::new(FixedPorts::new(["COM3"]))));
    let opener = MockOpener::new();
    let device = MockDevice::new(INFO);
    opener.attach("COM3", device.clone());
    let store = Arc::new(CsvStore::open(dir).unwrap());
    let settings = Settings {
        serial: SerialConfig {
            handshake_timeout_ms: 20,
            poll_timeout_ms: 20,
            ..SerialConfig::default()
        },
        ..Settings::default()
    };
    let directory = SessionDirectory::new(
        registry,
        Arc::new(opener),
        store.clone(),
        Arc::new(NullSink),
        settings,
    )
    .unwrap();
    (directory, store, device)
}

#[test]
fn test_recorded_test_name_is_rejected_after_restart() {
    let data = tempfile::tempdir().unwrap();

    {
        let (directory, store, device) = boot(data.path());
        directory.register("D1", None).unwrap();
        assert!(store.devices().unwrap()[0].connected);

        directory.start_session("t1", "D1").unwrap();
        device.stream_telemetry(Duration::from_millis(1));
        let start = Instant::now();
        while !store.list_all_test_names().unwrap().contains("t1")
            && start.elapsed() < Duration::from_secs(5)
        {
            thread::sleep(Duration::from_millis(5));
        }
        directory.stop_session("t1", None).unwrap();
        // dropped without shutdown, so the record is still marked connected
    }

    let (directory, store, _device) = boot(data.path());
    let devices = store.devices().unwrap();
    assert_eq!(devices.len(), 1);
    assert!(!devices[0].connected);

    directory.register("D1", None).unwrap();
    assert!(matches!(
        directory.start_session("t1", "D1"),
        Err(DaqError::DuplicateTestName(_))
    ));
    directory.start_session("t2", "D1").unwrap();
    directory.shutdown();
}

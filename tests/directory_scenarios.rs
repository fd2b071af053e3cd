//! End-to-end directory scenarios against scripted devices.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use smell_daq::config::{SerialConfig, Settings};
use smell_daq::link::{MockDevice, MockOpener};
use smell_daq::ports::{FixedPorts, PortRegistry};
use smell_daq::sink::{BroadcastSink, NullSink, SampleSink};
use smell_daq::store::{DataStore, DeviceRecord, MemoryStore};
use smell_daq::{DaqError, SessionDirectory};

const D1_INFO: &str = "1.0.4;A4:CF:12:00:00:01;0";
const D2_INFO: &str = "1.0.4;A4:CF:12:00:00:02;0";

struct Rig {
    directory: SessionDirectory,
    registry: Arc<PortRegistry>,
    store: Arc<MemoryStore>,
    d1: MockDevice,
    d2: MockDevice,
}

fn fast_settings() -> Settings {
    Settings {
        serial: SerialConfig {
            handshake_timeout_ms: 20,
            poll_timeout_ms: 20,
            ..SerialConfig::default()
        },
        ..Settings::default()
    }
}

fn rig_with(store: Arc<MemoryStore>, sink: Arc<dyn SampleSink>) -> Rig {
    rig_with_settings(store, sink, fast_settings())
}

fn rig_with_settings(
    store: Arc<MemoryStore>,
    sink: Arc<dyn SampleSink>,
    settings: Settings,
) -> Rig {
    let registry = Arc::new(PortRegistry::new(Box::new(FixedPorts::new([
        "COM3", "COM4",
    ]))));
    let opener = MockOpener::new();
    let d1 = MockDevice::new(D1_INFO);
    let d2 = MockDevice::new(D2_INFO);
    opener.attach("COM3", d1.clone());
    opener.attach("COM4", d2.clone());

    let directory = SessionDirectory::new(
        registry.clone(),
        Arc::new(opener),
        store.clone(),
        sink,
        settings,
    )
    .unwrap();
    Rig {
        directory,
        registry,
        store,
        d1,
        d2,
    }
}

/// Two scripted devices registered as `D1` on COM3 and `D2` on COM4.
fn rig() -> Rig {
    let rig = rig_with(Arc::new(MemoryStore::new()), Arc::new(NullSink));
    rig.directory.register("D1", Some("COM3")).unwrap();
    rig.directory.register("D2", Some("COM4")).unwrap();
    rig
}

fn wait_until(cond: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn test_name_is_never_reused() {
    let rig = rig();

    rig.directory.start_session("t1", "D1").unwrap();
    assert!(matches!(
        rig.directory.start_session("t1", "D2"),
        Err(DaqError::DuplicateTestName(_))
    ));
    rig.directory.stop_session("t1", None).unwrap();
    assert!(matches!(
        rig.directory.start_session("t1", "D1"),
        Err(DaqError::DuplicateTestName(_))
    ));
    rig.directory.shutdown();
}

#[test]
fn test_concurrent_devices_never_cross_attribute() {
    let rig = rig();
    rig.directory.start_session("t1", "D1").unwrap();
    rig.directory.start_session("t2", "D2").unwrap();
    rig.d1.stream_telemetry(Duration::from_millis(1));
    rig.d2.stream_telemetry(Duration::from_millis(1));

    assert!(wait_until(|| {
        rig.store.samples_for("t1").len() >= 10 && rig.store.samples_for("t2").len() >= 10
    }));
    rig.directory.stop_session("t1", Some("D1")).unwrap();
    rig.directory.stop_session("t2", Some("D2")).unwrap();

    assert!(rig
        .store
        .samples_for("t1")
        .iter()
        .all(|s| s.hardware_address == "A4:CF:12:00:00:01"));
    assert!(rig
        .store
        .samples_for("t2")
        .iter()
        .all(|s| s.hardware_address == "A4:CF:12:00:00:02"));
    rig.directory.shutdown();
}

#[test]
fn test_substance_change_is_not_retroactive() {
    let rig = rig();
    rig.directory.start_session("t1", "D1").unwrap();
    rig.d1.stream_telemetry(Duration::from_millis(1));
    assert!(wait_until(|| rig.store.samples_for("t1").len() >= 3));

    let before = rig.store.samples_for("t1").len();
    let (_, started) = rig.directory.session_substance("t1").unwrap();
    rig.directory.change_substance("t1", "5").unwrap();
    let changed_at = rig.store.samples_for("t1").len();
    assert!(wait_until(|| rig.store.samples_for("t1").len() >= changed_at + 5));
    rig.directory.stop_session("t1", None).unwrap();

    let samples = rig.store.samples_for("t1");
    assert!(samples[..before].iter().all(|s| s.substance_id == "1"));
    // at most one sample can have been built before the change landed
    assert!(samples[changed_at + 1..].iter().all(|s| s.substance_id == "5"));
    rig.directory.shutdown();

    assert!(started.is_some());
}

#[test]
fn test_substance_accessor_tracks_changes() {
    let rig = rig();
    rig.directory.start_session("t1", "D1").unwrap();
    let (substance, started) = rig.directory.session_substance("t1").unwrap();
    assert_eq!(substance, "1");

    thread::sleep(Duration::from_millis(5));
    rig.directory.change_substance("t1", "7").unwrap();
    let (substance, since) = rig.directory.session_substance("t1").unwrap();
    assert_eq!(substance, "7");
    assert!(since > started);

    let active = rig.directory.list_active();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].nickname, "D1");
    assert_eq!(active[0].substance_id, "7");
    rig.directory.shutdown();
}

#[test]
fn test_busy_device_rejects_start_and_deregister() {
    let rig = rig();
    rig.directory.start_session("t1", "D1").unwrap();

    assert!(matches!(
        rig.directory.start_session("t2", "D1"),
        Err(DaqError::DeviceBusy(_))
    ));
    assert!(matches!(
        rig.directory.deregister("D1"),
        Err(DaqError::DeviceBusy(_))
    ));
    assert_eq!(rig.directory.list_busy(), vec!["D1"]);
    assert_eq!(rig.directory.list_free(), vec!["D2"]);

    rig.directory.stop_session("t1", None).unwrap();
    rig.directory.deregister("D1").unwrap();
    assert!(!rig.registry.is_allocated("COM3"));
    assert!(!rig.store.device("A4:CF:12:00:00:01").unwrap().connected);
    assert!(matches!(
        rig.directory.deregister("D1"),
        Err(DaqError::DeviceNotRegistered(_))
    ));

    rig.directory.register("D1", Some("COM3")).unwrap();
    rig.directory.start_session("t2", "D1").unwrap();
    rig.directory.shutdown();
}

#[test]
fn test_stop_twice_is_safe() {
    let rig = rig();
    rig.directory.start_session("t1", "D1").unwrap();
    rig.directory.stop_session("t1", None).unwrap();
    rig.directory.stop_session("t1", None).unwrap();
    assert!(rig.directory.list_active().is_empty());
    rig.directory.shutdown();
}

#[test]
fn test_device_stays_busy_while_stop_is_joining() {
    let mut settings = fast_settings();
    settings.serial.poll_timeout_ms = 1500;
    let rig = rig_with_settings(Arc::new(MemoryStore::new()), Arc::new(NullSink), settings);
    rig.directory.register("D1", Some("COM3")).unwrap();
    rig.directory.start_session("t1", "D1").unwrap();
    thread::sleep(Duration::from_millis(50));

    thread::scope(|scope| {
        let stopping = scope.spawn(|| rig.directory.stop_session("t1", None));
        thread::sleep(Duration::from_millis(200));
        assert!(!stopping.is_finished());

        assert!(matches!(
            rig.directory.start_session("t2", "D1"),
            Err(DaqError::DeviceBusy(_))
        ));
        assert!(matches!(
            rig.directory.deregister("D1"),
            Err(DaqError::DeviceBusy(_))
        ));
        assert_eq!(rig.directory.list_busy(), vec!["D1"]);
        stopping.join().unwrap().unwrap();
    });

    assert_eq!(rig.directory.list_free(), vec!["D1"]);
    rig.directory.start_session("t2", "D1").unwrap();
    rig.d1.stream_telemetry(Duration::from_millis(1));
    assert!(wait_until(|| !rig.store.samples_for("t2").is_empty()));
    assert!(rig.store.samples_for("t1").is_empty());
    rig.directory.shutdown();
}

#[test]
fn test_consecutive_failures_free_the_device() {
    let rig = rig();
    rig.directory.start_session("t1", "D1").unwrap();
    rig.d1.fail_reads(4, std::io::ErrorKind::BrokenPipe);

    assert!(wait_until(|| rig.directory.list_active().is_empty()));
    assert_eq!(rig.directory.list_free(), vec!["D1", "D2"]);
    rig.directory.stop_session("t1", None).unwrap();
    assert!(matches!(
        rig.directory.start_session("t1", "D1"),
        Err(DaqError::DuplicateTestName(_))
    ));
    rig.directory.start_session("t2", "D1").unwrap();
    rig.directory.shutdown();
}

#[test]
fn test_discovery_assigns_first_free_port() {
    let rig = rig_with(Arc::new(MemoryStore::new()), Arc::new(NullSink));

    let first = rig.directory.register("D1", None).unwrap();
    let second = rig.directory.register("D2", None).unwrap();
    assert_eq!(first.hardware_address(), Some("A4:CF:12:00:00:01"));
    assert_eq!(second.hardware_address(), Some("A4:CF:12:00:00:02"));
    assert_eq!(rig.registry.allocated(), vec!["COM3", "COM4"]);

    assert!(matches!(
        rig.directory.register("D3", None),
        Err(DaqError::DriverNotInstalled(_))
    ));
    rig.directory.shutdown();
    assert!(rig.registry.allocated().is_empty());
}

#[test]
fn test_restart_clears_connected_flags() {
    let store = Arc::new(MemoryStore::new());
    store.insert_device(DeviceRecord {
        nickname: "D1".to_string(),
        hardware_address: "A4:CF:12:00:00:01".to_string(),
        software_version: "1.0.4".to_string(),
        port: "COM3".to_string(),
        connected: true,
    });

    let rig = rig_with(store, Arc::new(NullSink));
    let record = rig.store.device("A4:CF:12:00:00:01").unwrap();
    assert!(!record.connected);
    assert!(record.port.is_empty());
    assert!(rig.directory.list_free().is_empty());
}

#[test]
fn test_samples_are_published_after_persisting() {
    let sink = Arc::new(BroadcastSink::new(4096));
    let mut rx = sink.subscribe();
    let rig = rig_with(Arc::new(MemoryStore::new()), sink);
    rig.directory.register("D1", Some("COM3")).unwrap();

    rig.directory.start_session("t1", "D1").unwrap();
    rig.d1.stream_telemetry(Duration::from_millis(1));
    assert!(wait_until(|| rig.store.samples_for("t1").len() >= 3));
    rig.directory.stop_session("t1", None).unwrap();

    let persisted = rig.store.samples_for("t1");
    let mut published = Vec::new();
    while let Ok(sample) = rx.try_recv() {
        published.push(sample);
    }
    assert_eq!(published, persisted);
    assert!(rig.store.list_all_test_names().unwrap().contains("t1"));
    rig.directory.shutdown();
}

//! Session directory: which devices are registered, which tests are running
//! on them, and which test names are spent.
//!
//! All bookkeeping sits behind one `Mutex`. Blocking work (opening a port,
//! the metadata round-trip, joining a reader thread) happens outside it, so
//! a slow device never stalls requests aimed at another one.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::error::{AppResult, DaqError};
use crate::link::{ChannelOpener, DeviceInfo, DeviceLink};
use crate::ports::PortRegistry;
use crate::session::AcquisitionSession;
use crate::sink::SampleSink;
use crate::store::{DataStore, DeviceRecord};
use crate::sync::lock;

/// A running test as reported by [`SessionDirectory::list_active`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveTest {
    /// Test name
    pub test_name: String,
    /// Nickname of the device running it
    pub nickname: String,
    /// Substance currently being recorded
    pub substance_id: String,
    /// When the test started
    pub started_at: Option<DateTime<Local>>,
}

struct ManagedDevice {
    link: Arc<DeviceLink>,
    info: DeviceInfo,
    hardware_address: String,
}

struct ManagedSession {
    nickname: String,
    session: Arc<AcquisitionSession>,
}

#[derive(Default)]
struct DirectoryState {
    devices: HashMap<String, ManagedDevice>,
    sessions: HashMap<String, ManagedSession>,
    /// Devices whose session was removed but whose reader is still joining
    stopping: HashSet<String>,
    used_test_names: HashSet<String>,
}

impl DirectoryState {
    /// Drop sessions whose loop stopped itself and whose reader has exited;
    /// their devices become free.
    fn reap(&mut self) {
        self.sessions.retain(|test, managed| {
            let done = !managed.session.is_running() && managed.session.is_finished();
            if done {
                warn!(
                    test = %test,
                    device = %managed.nickname,
                    "Test stopped itself, releasing device"
                );
            }
            !done
        });
    }

    fn is_busy(&self, nickname: &str) -> bool {
        self.stopping.contains(nickname) || self.sessions.values().any(|s| s.nickname == nickname)
    }

    fn port_claimed(&self, port: &str) -> bool {
        self.devices.values().any(|d| d.link.port_name() == port)
    }
}

/// Mediates register/start/stop/substance requests against shared devices.
pub struct SessionDirectory {
    registry: Arc<PortRegistry>,
    opener: Arc<dyn ChannelOpener>,
    store: Arc<dyn DataStore>,
    sink: Arc<dyn SampleSink>,
    settings: Settings,
    state: Mutex<DirectoryState>,
}

impl SessionDirectory {
    /// Build a directory. Every persisted connected flag is cleared, since no
    /// link survives a restart.
    pub fn new(
        registry: Arc<PortRegistry>,
        opener: Arc<dyn ChannelOpener>,
        store: Arc<dyn DataStore>,
        sink: Arc<dyn SampleSink>,
        settings: Settings,
    ) -> AppResult<Self> {
        store.clear_connections()?;
        Ok(Self {
            registry,
            opener,
            store,
            sink,
            settings,
            state: Mutex::new(DirectoryState::default()),
        })
    }

    /// Open a link to a device, fetch its metadata and manage it as `nickname`.
    pub fn register(&self, nickname: &str, port: Option<&str>) -> AppResult<DeviceInfo> {
        {
            let state = lock(&self.state);
            if state.devices.contains_key(nickname) {
                return Err(DaqError::NicknameInUse(nickname.to_string()));
            }
            if let Some(port) = port.filter(|p| state.port_claimed(p)) {
                return Err(DaqError::PortInUse(port.to_string()));
            }
        }

        let link = DeviceLink::open(
            self.registry.clone(),
            self.opener.as_ref(),
            port,
            &self.settings.serial,
        )?;
        let info = link.fetch_device_metadata()?;
        let (Some(software_version), Some(hardware_address)) =
            (info.software_version(), info.hardware_address())
        else {
            error!(port = %link.port_name(), info = %info.joined(), "Device info is incomplete");
            return Err(DaqError::InfoFetchFailed);
        };
        let record = DeviceRecord {
            nickname: nickname.to_string(),
            hardware_address: hardware_address.to_string(),
            software_version: software_version.to_string(),
            port: link.port_name().to_string(),
            connected: true,
        };

        let mut state = lock(&self.state);
        if state.devices.contains_key(nickname) {
            return Err(DaqError::NicknameInUse(nickname.to_string()));
        }
        self.store.persist_device(&record)?;
        info!(
            device = nickname,
            port = %record.port,
            address = %record.hardware_address,
            version = %record.software_version,
            "Device registered"
        );
        state.devices.insert(
            nickname.to_string(),
            ManagedDevice {
                link: Arc::new(link),
                info: info.clone(),
                hardware_address: record.hardware_address,
            },
        );
        Ok(info)
    }

    /// Close a free device's link and mark it disconnected.
    pub fn deregister(&self, nickname: &str) -> AppResult<()> {
        let device = {
            let mut state = lock(&self.state);
            state.reap();
            if !state.devices.contains_key(nickname) {
                return Err(DaqError::DeviceNotRegistered(nickname.to_string()));
            }
            if state.is_busy(nickname) {
                return Err(DaqError::DeviceBusy(nickname.to_string()));
            }
            state
                .devices
                .remove(nickname)
                .ok_or_else(|| DaqError::DeviceNotRegistered(nickname.to_string()))?
        };

        self.release(nickname, device)
    }

    fn release(&self, nickname: &str, device: ManagedDevice) -> AppResult<()> {
        if let Err(e) = device.link.close() {
            warn!(device = nickname, error = %e, "Device link already closed");
        }
        self.store
            .set_device_connected(&device.hardware_address, false, "")?;
        info!(device = nickname, "Device deregistered");
        Ok(())
    }

    /// Start test `test_name` on the device registered as `nickname`.
    pub fn start_session(&self, test_name: &str, nickname: &str) -> AppResult<()> {
        if test_name.trim().is_empty() {
            return Err(DaqError::EmptyTestName);
        }

        let mut state = lock(&self.state);
        state.reap();
        if state.used_test_names.contains(test_name)
            || self.store.list_all_test_names()?.contains(test_name)
        {
            warn!(test = test_name, "Test name was already used");
            return Err(DaqError::DuplicateTestName(test_name.to_string()));
        }
        let device = state
            .devices
            .get(nickname)
            .ok_or_else(|| DaqError::DeviceNotRegistered(nickname.to_string()))?;
        if state.is_busy(nickname) {
            return Err(DaqError::DeviceBusy(nickname.to_string()));
        }

        let session = Arc::new(AcquisitionSession::new(
            test_name,
            &device.hardware_address,
            device.link.clone(),
            self.store.clone(),
            self.sink.clone(),
            &self.settings.acquisition,
        ));
        session.start()?;

        state.used_test_names.insert(test_name.to_string());
        state.sessions.insert(
            test_name.to_string(),
            ManagedSession {
                nickname: nickname.to_string(),
                session,
            },
        );
        Ok(())
    }

    /// Stop a running test, optionally checking which device runs it.
    ///
    /// Stopping a test that already ended is logged and succeeds.
    pub fn stop_session(&self, test_name: &str, nickname: Option<&str>) -> AppResult<()> {
        let stopped = {
            let mut state = lock(&self.state);
            let Some(managed) = state.sessions.get(test_name) else {
                if state.used_test_names.contains(test_name) {
                    error!(test = test_name, "Test is not running, ignoring stop command");
                    return Ok(());
                }
                return Err(DaqError::TestNotRunning(test_name.to_string()));
            };
            if let Some(device) = nickname.filter(|n| *n != managed.nickname) {
                return Err(DaqError::WrongDevice {
                    test: test_name.to_string(),
                    device: device.to_string(),
                });
            }
            let managed = state
                .sessions
                .remove(test_name)
                .ok_or_else(|| DaqError::TestNotRunning(test_name.to_string()))?;
            state.stopping.insert(managed.nickname.clone());
            managed
        };

        stopped.session.stop();
        lock(&self.state).stopping.remove(&stopped.nickname);
        Ok(())
    }

    /// Change the substance recorded by a running test from now on.
    pub fn change_substance(&self, test_name: &str, substance_id: &str) -> AppResult<()> {
        if substance_id.trim().is_empty() {
            return Err(DaqError::EmptySubstanceId);
        }
        let mut state = lock(&self.state);
        state.reap();
        let managed = state
            .sessions
            .get(test_name)
            .ok_or_else(|| DaqError::TestNotRunning(test_name.to_string()))?;
        managed.session.change_substance(substance_id);
        Ok(())
    }

    /// Current substance of a running test and when it took effect.
    pub fn session_substance(
        &self,
        test_name: &str,
    ) -> AppResult<(String, Option<DateTime<Local>>)> {
        let mut state = lock(&self.state);
        state.reap();
        let managed = state
            .sessions
            .get(test_name)
            .ok_or_else(|| DaqError::TestNotRunning(test_name.to_string()))?;
        Ok((
            managed.session.substance_id(),
            managed.session.substance_started_at(),
        ))
    }

    /// Send a command to a registered device.
    pub fn write_command(&self, nickname: &str, command: &str) -> AppResult<String> {
        let link = lock(&self.state)
            .devices
            .get(nickname)
            .map(|d| d.link.clone())
            .ok_or_else(|| DaqError::DeviceNotRegistered(nickname.to_string()))?;
        Ok(link.write_command(command)?)
    }

    /// Metadata cached for a registered device.
    pub fn device_info(&self, nickname: &str) -> AppResult<DeviceInfo> {
        lock(&self.state)
            .devices
            .get(nickname)
            .map(|d| d.info.clone())
            .ok_or_else(|| DaqError::DeviceNotRegistered(nickname.to_string()))
    }

    /// Running tests, ordered by name.
    pub fn list_active(&self) -> Vec<ActiveTest> {
        let mut state = lock(&self.state);
        state.reap();
        let mut active: Vec<ActiveTest> = state
            .sessions
            .iter()
            .map(|(test, managed)| ActiveTest {
                test_name: test.clone(),
                nickname: managed.nickname.clone(),
                substance_id: managed.session.substance_id(),
                started_at: managed.session.started_at(),
            })
            .collect();
        active.sort_by(|a, b| a.test_name.cmp(&b.test_name));
        active
    }

    /// Registered devices currently running a test.
    pub fn list_busy(&self) -> Vec<String> {
        self.partition(true)
    }

    /// Registered devices available for a new test.
    pub fn list_free(&self) -> Vec<String> {
        self.partition(false)
    }

    fn partition(&self, busy: bool) -> Vec<String> {
        let mut state = lock(&self.state);
        state.reap();
        let mut names: Vec<String> = state
            .devices
            .keys()
            .filter(|n| state.is_busy(n) == busy)
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Stop every test and deregister every device.
    pub fn shutdown(&self) {
        let (sessions, devices) = {
            let mut state = lock(&self.state);
            let sessions: Vec<_> = state.sessions.drain().collect();
            let devices: Vec<_> = state.devices.drain().collect();
            (sessions, devices)
        };

        for (test, managed) in sessions {
            info!(test = %test, "Stopping test for shutdown");
            managed.session.stop();
        }
        for (nickname, device) in devices {
            if let Err(e) = self.release(&nickname, device) {
                error!(device = %nickname, error = %e, "Failed to release device");
            }
        }
        info!("Session directory shut down");
    }
}

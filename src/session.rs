//! Acquisition session: one running test on one device.
//!
//! `start` spawns a dedicated reader thread that turns telemetry lines into
//! samples, persists them and publishes them, in the order they were read.
//! Cancellation is cooperative: `stop` clears the running flag and joins, and
//! the loop re-checks the flag after every bounded poll of the link.
//!
//! The loop also stops itself once more than `max_consecutive_errors`
//! iterations in a row have failed; callers observe that through
//! [`AcquisitionSession::state`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Local};
use tracing::{debug, error, info, warn};

use crate::config::AcquisitionConfig;
use crate::error::{AppResult, DaqError};
use crate::link::DeviceLink;
use crate::sink::SampleSink;
use crate::store::DataStore;
use crate::sync::lock;
use crate::telemetry::{Sample, TelemetryFrame};

/// Lifecycle of a session. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, never started
    Idle,
    /// Reader thread active
    Running,
    /// Stopped explicitly or by the error threshold
    Stopped,
}

#[derive(Debug, Clone)]
struct Substance {
    id: String,
    since: Option<DateTime<Local>>,
}

/// Outcome of one loop iteration.
enum Iteration {
    Idle,
    Skipped,
    Captured,
}

struct Shared {
    test_name: String,
    hardware_address: String,
    link: Arc<DeviceLink>,
    store: Arc<dyn DataStore>,
    sink: Arc<dyn SampleSink>,
    running: AtomicBool,
    substance: Mutex<Substance>,
    max_consecutive_errors: u32,
}

impl Shared {
    fn acquire(&self) {
        self.link.flush();
        let mut errors: u32 = 0;

        while self.running.load(Ordering::SeqCst) {
            match self.iterate() {
                Ok(Iteration::Idle) => {}
                Ok(Iteration::Skipped | Iteration::Captured) => errors = 0,
                Err(e) => {
                    errors += 1;
                    error!(
                        test = %self.test_name,
                        error = %e,
                        consecutive = errors,
                        "Error during data collection"
                    );
                    if errors > self.max_consecutive_errors {
                        error!(
                            test = %self.test_name,
                            "Too many consecutive errors, terminating acquisition"
                        );
                        self.running.store(false, Ordering::SeqCst);
                    }
                }
            }
        }
        debug!(test = %self.test_name, "Acquisition loop exited");
    }

    fn iterate(&self) -> AppResult<Iteration> {
        let Some(line) = self.link.poll_line()? else {
            return Ok(Iteration::Idle);
        };
        let Some(frame) = TelemetryFrame::parse(&line) else {
            return Ok(Iteration::Skipped);
        };

        let substance_id = lock(&self.substance).id.clone();
        let sample = Sample::from_frame(
            frame,
            &self.test_name,
            &self.hardware_address,
            &substance_id,
            Local::now(),
        );
        self.store.append_sample(&sample)?;
        self.sink.publish(&sample);
        debug!(test = %self.test_name, substance = %substance_id, "Sample captured");
        Ok(Iteration::Captured)
    }
}

/// One test's background read/persist/publish loop.
pub struct AcquisitionSession {
    shared: Arc<Shared>,
    started_at: Mutex<Option<DateTime<Local>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AcquisitionSession {
    /// Create an idle session capturing from `link` as `hardware_address`.
    pub fn new(
        test_name: &str,
        hardware_address: &str,
        link: Arc<DeviceLink>,
        store: Arc<dyn DataStore>,
        sink: Arc<dyn SampleSink>,
        config: &AcquisitionConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                test_name: test_name.to_string(),
                hardware_address: hardware_address.to_string(),
                link,
                store,
                sink,
                running: AtomicBool::new(false),
                substance: Mutex::new(Substance {
                    id: config.ambient_substance_id.clone(),
                    since: None,
                }),
                max_consecutive_errors: config.max_consecutive_errors,
            }),
            started_at: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the acquisition loop and return immediately.
    ///
    /// A session runs at most once; later calls log a warning and do nothing.
    pub fn start(&self) -> AppResult<()> {
        let mut handle = lock(&self.handle);
        if self.is_running() || handle.is_some() || self.started_at().is_some() {
            warn!(test = %self.shared.test_name, "Test is already running, skipping");
            return Ok(());
        }

        let now = Local::now();
        *lock(&self.started_at) = Some(now);
        lock(&self.shared.substance).since = Some(now);
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(format!("acq-{}", self.shared.test_name))
            .spawn(move || shared.acquire());

        match spawned {
            Ok(join) => {
                *handle = Some(join);
                info!(
                    test = %self.shared.test_name,
                    device = %self.shared.hardware_address,
                    "Test started"
                );
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                Err(DaqError::SpawnFailed(e.to_string()))
            }
        }
    }

    /// Clear the running flag and wait for the loop to exit.
    ///
    /// Not running, or never started: logs and returns.
    pub fn stop(&self) {
        let mut handle = lock(&self.handle);
        if !self.shared.running.load(Ordering::SeqCst) {
            error!(test = %self.shared.test_name, "Test is not running, ignoring stop command");
            if let Some(join) = handle.take() {
                let _ = join.join();
            }
            return;
        }
        let Some(join) = handle.take() else {
            error!(test = %self.shared.test_name, "Test thread is missing, ignoring");
            return;
        };

        self.shared.running.store(false, Ordering::SeqCst);
        if join.join().is_err() {
            error!(test = %self.shared.test_name, "Acquisition thread panicked");
        }
        info!(test = %self.shared.test_name, "Stopped test");
    }

    /// Switch the substance for samples captured from now on.
    pub fn change_substance(&self, substance_id: &str) {
        let mut substance = lock(&self.shared.substance);
        substance.id = substance_id.to_string();
        substance.since = Some(Local::now());
        info!(test = %self.shared.test_name, substance = substance_id, "Updated substance");
    }

    /// Substance currently being recorded.
    pub fn substance_id(&self) -> String {
        lock(&self.shared.substance).id.clone()
    }

    /// When the current substance took effect.
    pub fn substance_started_at(&self) -> Option<DateTime<Local>> {
        lock(&self.shared.substance).since
    }

    /// When the session was started.
    pub fn started_at(&self) -> Option<DateTime<Local>> {
        *lock(&self.started_at)
    }

    /// Whether the loop is active.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Whether the reader thread has exited, or was never spawned.
    pub fn is_finished(&self) -> bool {
        lock(&self.handle)
            .as_ref()
            .map_or(true, JoinHandle::is_finished)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        if self.is_running() {
            SessionState::Running
        } else if self.started_at().is_some() {
            SessionState::Stopped
        } else {
            SessionState::Idle
        }
    }

    /// Test name.
    pub fn test_name(&self) -> &str {
        &self.shared.test_name
    }

    /// Hardware address samples are attributed to.
    pub fn hardware_address(&self) -> &str {
        &self.shared.hardware_address
    }
}

impl Drop for AcquisitionSession {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}

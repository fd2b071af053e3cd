//! Scripted SmellInspector for testing links, sessions and the directory
//! without hardware.
//!
//! A [`MockDevice`] is a cloneable handle onto shared device state, so a test
//! keeps one clone to script input and inspect writes while the link owns
//! the [`MockChannel`] built from another. It provides:
//! - queued inbound lines and injected read failures
//! - an automatic reply to `GET_INFO`
//! - an optional endless telemetry stream
//! - a write log for verification

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::channel::{ChannelOpener, SerialChannel};
use crate::config::SerialConfig;
use crate::sync::lock;
use crate::telemetry::CHANNEL_COUNT;

/// Build a well-formed telemetry line; channel `i` reads `seed + i`.
pub fn telemetry_line(seed: u64) -> String {
    let mut fields = vec![seed.to_string()];
    fields.extend((0..CHANNEL_COUNT as u64).map(|i| (seed + i).to_string()));
    fields.push("24.1".to_string());
    fields.push("38.7".to_string());
    fields.join(";")
}

#[derive(Debug)]
enum Inbound {
    Line(String),
    Failure(io::ErrorKind),
}

#[derive(Debug, Default)]
struct MockState {
    inbound: VecDeque<Inbound>,
    writes: Vec<String>,
    info_reply: Option<String>,
    stream_interval: Option<Duration>,
    next_seed: u64,
    clears: usize,
    reads: usize,
}

/// Shared handle onto one simulated device.
#[derive(Clone, Default)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
    arrived: Arc<Condvar>,
}

impl MockDevice {
    /// A device that answers `GET_INFO` with `info` and has emitted one boot
    /// line, so the liveness check succeeds.
    pub fn new(info: &str) -> Self {
        let device = Self::default();
        device.set_info_reply(info);
        device.push_line("SmellInspector booting");
        device
    }

    /// A device that never says anything.
    pub fn silent() -> Self {
        Self::default()
    }

    /// Queue an inbound line.
    pub fn push_line(&self, line: &str) {
        lock(&self.state)
            .inbound
            .push_back(Inbound::Line(line.to_string()));
        self.arrived.notify_all();
    }

    /// Make the next `count` reads fail with `kind`.
    pub fn fail_reads(&self, count: usize, kind: io::ErrorKind) {
        let mut state = lock(&self.state);
        for _ in 0..count {
            state.inbound.push_front(Inbound::Failure(kind));
        }
        drop(state);
        self.arrived.notify_all();
    }

    /// Reply queued whenever `GET_INFO` is written.
    pub fn set_info_reply(&self, info: &str) {
        lock(&self.state).info_reply = Some(info.to_string());
    }

    /// Emit a telemetry line every `interval` whenever the queue is empty.
    pub fn stream_telemetry(&self, interval: Duration) {
        lock(&self.state).stream_interval = Some(interval);
        self.arrived.notify_all();
    }

    /// Stop the telemetry stream.
    pub fn stop_stream(&self) {
        lock(&self.state).stream_interval = None;
    }

    /// Every line written to the device, in order.
    pub fn writes(&self) -> Vec<String> {
        lock(&self.state).writes.clone()
    }

    /// Number of times buffers were cleared.
    pub fn clears(&self) -> usize {
        lock(&self.state).clears
    }

    /// Number of completed `read_line` calls that returned a line or failure.
    pub fn reads(&self) -> usize {
        lock(&self.state).reads
    }

    /// A channel onto this device.
    pub fn channel(&self) -> MockChannel {
        MockChannel {
            device: self.clone(),
        }
    }
}

/// Channel end of a [`MockDevice`].
pub struct MockChannel {
    device: MockDevice,
}

impl SerialChannel for MockChannel {
    fn read_line(&mut self, timeout: Duration) -> io::Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.device.state);

        loop {
            if let Some(inbound) = state.inbound.pop_front() {
                state.reads += 1;
                return match inbound {
                    Inbound::Line(line) => Ok(Some(line)),
                    Inbound::Failure(kind) => Err(io::Error::new(kind, "injected read failure")),
                };
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            if let Some(interval) = state.stream_interval {
                let wait = interval.min(deadline - now);
                let (guard, _) = self
                    .device
                    .arrived
                    .wait_timeout(state, wait)
                    .unwrap_or_else(PoisonError::into_inner);
                state = guard;
                if state.inbound.is_empty() && state.stream_interval.is_some() && wait == interval
                {
                    let seed = state.next_seed;
                    state.next_seed += 1;
                    state.inbound.push_back(Inbound::Line(telemetry_line(seed)));
                }
            } else {
                let (guard, _) = self
                    .device
                    .arrived
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner);
                state = guard;
            }
        }
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let mut state = lock(&self.device.state);
        state.writes.push(line.to_string());
        if line == "GET_INFO" {
            if let Some(reply) = state.info_reply.clone() {
                state.inbound.push_back(Inbound::Line(reply));
            }
        }
        drop(state);
        self.device.arrived.notify_all();
        Ok(())
    }

    fn clear(&mut self) -> io::Result<()> {
        let mut state = lock(&self.device.state);
        state.clears += 1;
        state
            .inbound
            .retain(|inbound| matches!(inbound, Inbound::Failure(_)));
        Ok(())
    }
}

/// Opens [`MockChannel`]s for devices attached to named ports.
#[derive(Clone, Default)]
pub struct MockOpener {
    devices: Arc<Mutex<HashMap<String, MockDevice>>>,
    opened: Arc<Mutex<Vec<String>>>,
}

impl MockOpener {
    /// Create an opener with no devices attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug `device` into `port`.
    pub fn attach(&self, port: &str, device: MockDevice) {
        lock(&self.devices).insert(port.to_string(), device);
    }

    /// Ports opened so far, in order.
    pub fn opened(&self) -> Vec<String> {
        lock(&self.opened).clone()
    }
}

impl ChannelOpener for MockOpener {
    fn open(&self, port: &str, _config: &SerialConfig) -> io::Result<Box<dyn SerialChannel>> {
        lock(&self.opened).push(port.to_string());
        let device = lock(&self.devices).get(port).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no device on {port}"))
        })?;
        Ok(Box::new(device.channel()))
    }
}

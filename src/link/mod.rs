//! Device link: one open serial channel to one SmellInspector.
//!
//! A link is shared (`Arc<DeviceLink>`) between exactly two users: the
//! acquisition session's reader thread and the directory's command path.
//! They are kept apart by two pieces of state:
//!
//! - the channel itself sits behind a `Mutex`, so bytes of a command
//!   round-trip and of a telemetry read can never interleave;
//! - a [`CommandGate`] counts in-flight commands. The continuous reader
//!   blocks on the gate's condvar before every poll while a command is
//!   pending, so it neither spins nor swallows the command's response.
//!
//! Lock order is `metadata -> channel`; the reader never touches `metadata`.

pub mod channel;
pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod serial_port;

use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info, warn};

pub use channel::{ChannelOpener, SerialChannel};
pub use mock::{MockChannel, MockDevice, MockOpener};
#[cfg(feature = "instrument_serial")]
pub use serial_port::{SerialPortChannel, SerialPortOpener};

use crate::config::SerialConfig;
use crate::error::LinkError;
use crate::ports::PortRegistry;
use crate::sync::lock;
use crate::telemetry::FIELD_DELIMITER;

/// Commands a SmellInspector accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Fan off
    Fan0,
    /// Fan low
    Fan1,
    /// Fan medium
    Fan2,
    /// Fan high
    Fan3,
    /// Device metadata query
    GetInfo,
}

impl Command {
    /// Every accepted command.
    pub const ALL: [Command; 5] = [
        Command::Fan0,
        Command::Fan1,
        Command::Fan2,
        Command::Fan3,
        Command::GetInfo,
    ];

    /// Wire text, without terminator.
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Fan0 => "FAN0",
            Command::Fan1 => "FAN1",
            Command::Fan2 => "FAN2",
            Command::Fan3 => "FAN3",
            Command::GetInfo => "GET_INFO",
        }
    }

    /// Fan command for speed `level` (0-3).
    pub fn fan(level: u8) -> Option<Command> {
        match level {
            0 => Some(Command::Fan0),
            1 => Some(Command::Fan1),
            2 => Some(Command::Fan2),
            3 => Some(Command::Fan3),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| LinkError::InvalidCommand(s.to_string()))
    }
}

/// Device metadata returned by `GET_INFO`.
///
/// Only the first two fields have fixed meaning; the rest are firmware
/// defined and kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    fields: Vec<String>,
}

impl DeviceInfo {
    /// Wrap raw metadata fields.
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }

    /// Parse a metadata line.
    pub fn parse(line: &str) -> Self {
        Self::new(line.split(FIELD_DELIMITER).map(str::to_string).collect())
    }

    /// Firmware version (field 0).
    pub fn software_version(&self) -> Option<&str> {
        self.fields.first().map(String::as_str)
    }

    /// Hardware (MAC) address (field 1).
    pub fn hardware_address(&self) -> Option<&str> {
        self.fields.get(1).map(String::as_str)
    }

    /// All fields in device order.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Fields joined back into the wire form.
    pub fn joined(&self) -> String {
        self.fields.join(&FIELD_DELIMITER.to_string())
    }
}

/// Counts in-flight commands; the continuous reader waits until it is idle.
#[derive(Debug, Default)]
struct CommandGate {
    pending: Mutex<usize>,
    idle: Condvar,
}

impl CommandGate {
    fn hold(&self) -> GateHold<'_> {
        *lock(&self.pending) += 1;
        GateHold { gate: self }
    }

    fn wait_idle(&self) {
        let mut pending = lock(&self.pending);
        while *pending > 0 {
            pending = self
                .idle
                .wait(pending)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn is_held(&self) -> bool {
        *lock(&self.pending) > 0
    }
}

struct GateHold<'a> {
    gate: &'a CommandGate,
}

impl Drop for GateHold<'_> {
    fn drop(&mut self) {
        let mut pending = lock(&self.gate.pending);
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.gate.idle.notify_all();
        }
    }
}

/// One open connection to a physical device.
pub struct DeviceLink {
    port: String,
    registry: Arc<PortRegistry>,
    config: SerialConfig,
    channel: Mutex<Option<Box<dyn SerialChannel>>>,
    gate: CommandGate,
    connected: AtomicBool,
    metadata: Mutex<Option<DeviceInfo>>,
}

impl fmt::Debug for DeviceLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceLink")
            .field("port", &self.port)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl DeviceLink {
    /// Open a link, claiming its port in `registry`.
    ///
    /// An explicit port is tried first. If it cannot be opened or checked the
    /// link falls back to discovery and takes the first free candidate. A port
    /// already allocated elsewhere is never a reason to fall back.
    pub fn open(
        registry: Arc<PortRegistry>,
        opener: &dyn ChannelOpener,
        explicit_port: Option<&str>,
        config: &SerialConfig,
    ) -> Result<Self, LinkError> {
        info!("Opening serial connection");

        if let Some(port) = explicit_port {
            info!(port, "Serial port was provided, testing connection");
            match Self::connect(registry.clone(), opener, port, config) {
                Ok(link) => return Ok(link),
                Err(err @ LinkError::PortInUse(_)) => return Err(err),
                Err(err) => warn!(port, error = %err, "Provided port unusable, running discovery"),
            }
        }

        let candidates = registry.discover(&config.driver_hint)?;
        if candidates.len() > 1 {
            info!(
                count = candidates.len(),
                "Multiple SmellInspector devices present, using first unused one"
            );
        }
        let port = candidates
            .first()
            .ok_or_else(|| LinkError::DriverNotInstalled(config.driver_hint.clone()))?;
        Self::connect(registry, opener, port, config)
    }

    fn connect(
        registry: Arc<PortRegistry>,
        opener: &dyn ChannelOpener,
        port: &str,
        config: &SerialConfig,
    ) -> Result<Self, LinkError> {
        if registry.is_allocated(port) {
            return Err(LinkError::PortInUse(port.to_string()));
        }

        let mut channel = opener
            .open(port, config)
            .map_err(|source| LinkError::DeviceNotConnected {
                port: port.to_string(),
                source,
            })?;

        for attempt in 1..=config.handshake_attempts {
            let line = channel.read_line(config.handshake_timeout()).map_err(|source| {
                error!(port, "Unable to connect to serial port");
                LinkError::DeviceNotConnected {
                    port: port.to_string(),
                    source,
                }
            })?;

            if line.is_some() {
                registry
                    .allocate(port)
                    .map_err(|_| LinkError::PortInUse(port.to_string()))?;
                info!(port, "Serial connection established");
                return Ok(Self {
                    port: port.to_string(),
                    registry,
                    config: config.clone(),
                    channel: Mutex::new(Some(channel)),
                    gate: CommandGate::default(),
                    connected: AtomicBool::new(true),
                    metadata: Mutex::new(None),
                });
            }
            error!(
                port,
                "Port connection failed, retrying {}/{}", attempt, config.handshake_attempts
            );
        }

        Err(LinkError::DriverNotInstalled(port.to_string()))
    }

    /// Port identifier this link holds.
    pub fn port_name(&self) -> &str {
        &self.port
    }

    /// Whether the link is still open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether a command round-trip is in flight.
    pub fn is_executing_command(&self) -> bool {
        self.gate.is_held()
    }

    fn with_channel<T>(
        &self,
        op: impl FnOnce(&mut dyn SerialChannel) -> io::Result<T>,
    ) -> Result<T, LinkError> {
        let mut guard = lock(&self.channel);
        let channel = guard.as_mut().ok_or(LinkError::Closed)?;
        op(channel.as_mut()).map_err(|source| LinkError::DeviceNotConnected {
            port: self.port.clone(),
            source,
        })
    }

    /// Execute a textual command, returning the message for the caller.
    ///
    /// Unknown commands are rejected before the channel is touched.
    /// `GET_INFO` is answered from the memoized metadata.
    pub fn write_command(&self, command: &str) -> Result<String, LinkError> {
        let command: Command = command.parse()?;
        if command == Command::GetInfo {
            return Ok(self.fetch_device_metadata()?.joined());
        }
        if !self.is_connected() {
            return Err(LinkError::Closed);
        }

        let _hold = self.gate.hold();
        self.with_channel(|channel| channel.write_line(command.as_str()))
            .inspect_err(|e| {
                error!(port = %self.port, %command, error = %e, "Error writing command");
            })?;
        debug!(port = %self.port, %command, "Wrote command to interface");
        Ok(format!("\"{command}\" Setting applied."))
    }

    /// Fetch device metadata once, then serve it from cache.
    ///
    /// Lines with more than `metadata_max_fields` fields (telemetry) are
    /// skipped; after `info_attempts` reads without a match the fetch fails.
    /// Blank lines are skipped without using up an attempt, bounded by an
    /// overall deadline of `info_attempts` read timeouts.
    pub fn fetch_device_metadata(&self) -> Result<DeviceInfo, LinkError> {
        let mut cached = lock(&self.metadata);
        if let Some(info) = cached.as_ref() {
            return Ok(info.clone());
        }
        if !self.is_connected() {
            return Err(LinkError::Closed);
        }

        let attempts = self.config.info_attempts;
        let max_fields = self.config.metadata_max_fields;
        let timeout = self.config.handshake_timeout();

        let _hold = self.gate.hold();
        let found = self
            .with_channel(|channel| {
                channel.write_line(Command::GetInfo.as_str())?;
                let deadline = Instant::now() + timeout * attempts;
                let mut used = 0;
                while used < attempts {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break;
                    }
                    let Some(line) = channel.read_line(timeout.min(remaining))? else {
                        used += 1;
                        continue;
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    used += 1;
                    if line.split(FIELD_DELIMITER).count() > max_fields {
                        continue;
                    }
                    return Ok(Some(DeviceInfo::parse(&line)));
                }
                Ok(None)
            })
            .inspect_err(|e| error!(port = %self.port, error = %e, "Error fetching device data"))?;

        let info = found.ok_or(LinkError::InfoFetchFailed { attempts })?;
        debug!(port = %self.port, info = %info.joined(), "Device info fetched");
        *cached = Some(info.clone());
        Ok(info)
    }

    /// Block until a non-empty line arrives or the link closes.
    pub fn read_line(&self) -> Result<String, LinkError> {
        loop {
            if let Some(line) = self.poll_line()? {
                return Ok(line);
            }
        }
    }

    /// Wait at most one poll timeout for a non-empty line.
    ///
    /// Suspends while a command is in flight and never reads its response.
    pub fn poll_line(&self) -> Result<Option<String>, LinkError> {
        if !self.is_connected() {
            return Err(LinkError::Closed);
        }
        self.gate.wait_idle();

        let line = self.with_channel(|channel| channel.read_line(self.config.poll_timeout()))?;
        match line {
            Some(line) if !line.is_empty() => {
                debug!(port = %self.port, data = %line, "Read data");
                Ok(Some(line))
            }
            _ => Ok(None),
        }
    }

    /// Discard buffered input/output. Failures are logged and ignored.
    pub fn flush(&self) {
        if !self.is_connected() {
            return;
        }
        if let Err(e) = self.with_channel(|channel| channel.clear()) {
            error!(port = %self.port, error = %e, "Attempted to flush serial port, ignoring");
        }
    }

    /// Close the channel and release the port allocation.
    ///
    /// A second call fails with [`LinkError::PortNotAllocated`].
    pub fn close(&self) -> Result<(), LinkError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            error!(port = %self.port, "Port was already closed");
            return Err(LinkError::PortNotAllocated(self.port.clone()));
        }
        let channel = lock(&self.channel).take();
        self.registry.deallocate(&self.port)?;
        drop(channel);
        info!(port = %self.port, "Closed serial port");
        Ok(())
    }
}

impl Drop for DeviceLink {
    fn drop(&mut self) {
        if self.is_connected() {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::FixedPorts;
    use std::thread;
    use std::time::Duration;

    const INFO: &str = "1.0.4;A4:CF:12:00:11:22;3;on";

    fn fast_config() -> SerialConfig {
        SerialConfig {
            handshake_timeout_ms: 20,
            poll_timeout_ms: 20,
            ..SerialConfig::default()
        }
    }

    fn setup(ports: &[&str]) -> (Arc<PortRegistry>, MockOpener) {
        let registry = Arc::new(PortRegistry::new(Box::new(FixedPorts::new(
            ports.iter().copied(),
        ))));
        (registry, MockOpener::new())
    }

    #[test]
    fn test_command_vocabulary() {
        assert_eq!("FAN2".parse::<Command>().unwrap(), Command::Fan2);
        assert!(matches!(
            "FAN4".parse::<Command>(),
            Err(LinkError::InvalidCommand(_))
        ));
        assert!("fan1".parse::<Command>().is_err());
        assert_eq!(Command::fan(3), Some(Command::Fan3));
        assert_eq!(Command::fan(4), None);
    }

    #[test]
    fn test_open_explicit_port_allocates() {
        let (registry, opener) = setup(&[]);
        let device = MockDevice::new(INFO);
        opener.attach("COM3", device);

        let link =
            DeviceLink::open(registry.clone(), &opener, Some("COM3"), &fast_config()).unwrap();
        assert_eq!(link.port_name(), "COM3");
        assert!(registry.is_allocated("COM3"));
    }

    #[test]
    fn test_open_falls_back_to_discovery() {
        let (registry, opener) = setup(&["COM4"]);
        opener.attach("COM4", MockDevice::new(INFO));

        let link = DeviceLink::open(registry, &opener, Some("COM9"), &fast_config()).unwrap();
        assert_eq!(link.port_name(), "COM4");
        assert_eq!(opener.opened(), vec!["COM9", "COM4"]);
    }

    #[test]
    fn test_open_allocated_port_does_not_fall_back() {
        let (registry, opener) = setup(&["COM4"]);
        opener.attach("COM3", MockDevice::new(INFO));
        opener.attach("COM4", MockDevice::new(INFO));
        registry.allocate("COM3").unwrap();

        let result = DeviceLink::open(registry, &opener, Some("COM3"), &fast_config());
        assert!(matches!(result, Err(LinkError::PortInUse(_))));
        assert!(opener.opened().is_empty());
    }

    #[test]
    fn test_silent_device_is_driver_not_installed() {
        let (registry, opener) = setup(&["COM5"]);
        opener.attach("COM5", MockDevice::silent());

        let result = DeviceLink::open(registry.clone(), &opener, None, &fast_config());
        assert!(matches!(result, Err(LinkError::DriverNotInstalled(_))));
        assert!(!registry.is_allocated("COM5"));
    }

    #[test]
    fn test_metadata_skips_telemetry_and_is_memoized() {
        let (registry, opener) = setup(&[]);
        let device = MockDevice::new(INFO);
        device.push_line(&mock::telemetry_line(1));
        opener.attach("COM3", device.clone());
        let link = DeviceLink::open(registry, &opener, Some("COM3"), &fast_config()).unwrap();

        let info = link.fetch_device_metadata().unwrap();
        assert_eq!(info.software_version(), Some("1.0.4"));
        assert_eq!(info.hardware_address(), Some("A4:CF:12:00:11:22"));
        assert_eq!(info.fields(), ["1.0.4", "A4:CF:12:00:11:22", "3", "on"]);
        assert!(!link.is_executing_command());

        let again = link.write_command("GET_INFO").unwrap();
        assert_eq!(again, INFO);
        assert_eq!(device.writes(), vec!["GET_INFO"]);
    }

    #[test]
    fn test_metadata_fetch_exhausts_attempts() {
        let (registry, opener) = setup(&[]);
        let device = MockDevice::silent();
        device.push_line("boot");
        device.stream_telemetry(Duration::from_millis(1));
        opener.attach("COM3", device);
        let link = DeviceLink::open(registry, &opener, Some("COM3"), &fast_config()).unwrap();

        assert!(matches!(
            link.fetch_device_metadata(),
            Err(LinkError::InfoFetchFailed { attempts: 5 })
        ));
    }

    #[test]
    fn test_blank_lines_do_not_use_up_metadata_attempts() {
        let (registry, opener) = setup(&[]);
        let device = MockDevice::new(INFO);
        opener.attach("COM3", device.clone());
        let link = DeviceLink::open(registry, &opener, Some("COM3"), &fast_config()).unwrap();
        for _ in 0..6 {
            device.push_line("");
        }
        device.push_line("   ");

        let info = link.fetch_device_metadata().unwrap();
        assert_eq!(info.joined(), INFO);
    }

    #[test]
    fn test_invalid_command_never_touches_channel() {
        let (registry, opener) = setup(&[]);
        let device = MockDevice::new(INFO);
        opener.attach("COM3", device.clone());
        let link = DeviceLink::open(registry, &opener, Some("COM3"), &fast_config()).unwrap();

        assert!(matches!(
            link.write_command("REBOOT"),
            Err(LinkError::InvalidCommand(_))
        ));
        assert!(device.writes().is_empty());

        let reply = link.write_command("FAN1").unwrap();
        assert_eq!(reply, "\"FAN1\" Setting applied.");
        assert_eq!(device.writes(), vec!["FAN1"]);
        assert!(!link.is_executing_command());
    }

    #[test]
    fn test_concurrent_reader_never_consumes_info_response() {
        let (registry, opener) = setup(&[]);
        let device = MockDevice::new(INFO);
        opener.attach("COM3", device.clone());
        let link =
            Arc::new(DeviceLink::open(registry, &opener, Some("COM3"), &fast_config()).unwrap());
        link.flush();
        device.stream_telemetry(Duration::from_millis(1));

        let reader = {
            let link = link.clone();
            thread::spawn(move || {
                let mut lines = Vec::new();
                for _ in 0..50 {
                    if let Ok(Some(line)) = link.poll_line() {
                        lines.push(line);
                    }
                }
                lines
            })
        };

        let info = link.fetch_device_metadata().unwrap();
        assert_eq!(info.joined(), INFO);

        let lines = reader.join().unwrap();
        assert!(lines.iter().all(|l| l != INFO));
    }

    #[test]
    fn test_close_twice_is_an_error() {
        let (registry, opener) = setup(&[]);
        opener.attach("COM3", MockDevice::new(INFO));
        let link =
            DeviceLink::open(registry.clone(), &opener, Some("COM3"), &fast_config()).unwrap();

        link.close().unwrap();
        assert!(!registry.is_allocated("COM3"));
        assert!(matches!(link.close(), Err(LinkError::PortNotAllocated(_))));
        assert!(matches!(link.read_line(), Err(LinkError::Closed)));
    }

    #[test]
    fn test_drop_releases_port() {
        let (registry, opener) = setup(&[]);
        opener.attach("COM3", MockDevice::new(INFO));
        let link =
            DeviceLink::open(registry.clone(), &opener, Some("COM3"), &fast_config()).unwrap();
        drop(link);
        assert!(!registry.is_allocated("COM3"));
    }
}

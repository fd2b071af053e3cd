//! Physical serial channel backed by the `serialport` crate.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{debug, warn};

use super::channel::{ChannelOpener, SerialChannel};
use crate::config::SerialConfig;

/// Internal read timeout of the OS handle; line deadlines are enforced on top.
const PORT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Longest partial line kept while waiting for a terminator.
const MAX_PENDING_BYTES: usize = 4096;

/// Bytes received but not yet returned as a line.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Append received bytes. A partial line that grows past
    /// `MAX_PENDING_BYTES` without a terminator is discarded.
    fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        if self.len() > MAX_PENDING_BYTES && !self.pending.contains(&b'\n') {
            warn!(
                bytes = self.len(),
                "Discarding unterminated serial input"
            );
            self.pending.clear();
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|b| *b == b'\n')?;
        let raw: Vec<u8> = self.pending.drain(..=end).collect();
        Some(String::from_utf8_lossy(&raw).trim().to_string())
    }

    fn clear(&mut self) {
        self.pending.clear();
    }

    fn len(&self) -> usize {
        self.pending.len()
    }
}

/// A line-buffered view over an open serial port.
pub struct SerialPortChannel {
    port: Box<dyn SerialPort>,
    pending: LineBuffer,
}

impl SerialPortChannel {
    /// Wrap an already opened port.
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self {
            port,
            pending: LineBuffer::default(),
        }
    }
}

impl SerialChannel for SerialPortChannel {
    fn read_line(&mut self, timeout: Duration) -> io::Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        let mut buffer = [0u8; 512];

        loop {
            if let Some(line) = self.pending.take_line() {
                return Ok(Some(line));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }

            match self.port.read(&mut buffer) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "Unexpected EOF from serial port",
                    ))
                }
                Ok(n) => self.pending.extend(&buffer[..n]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.port.write_all(format!("{line}\n").as_bytes())?;
        self.port.flush()
    }

    fn clear(&mut self) -> io::Result<()> {
        self.pending.clear();
        self.port.clear(ClearBuffer::All).map_err(io::Error::from)
    }
}

/// Opens physical ports at the SmellInspector line settings
/// (8 data bits, no parity, one stop bit, no flow control).
#[derive(Debug, Clone, Default)]
pub struct SerialPortOpener;

impl ChannelOpener for SerialPortOpener {
    fn open(&self, port: &str, config: &SerialConfig) -> io::Result<Box<dyn SerialChannel>> {
        let handle = serialport::new(port, config.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(PORT_POLL_INTERVAL)
            .open()
            .map_err(io::Error::from)?;

        debug!(port, baud_rate = config.baud_rate, "Serial port opened");
        Ok(Box::new(SerialPortChannel::new(handle)))
    }
}

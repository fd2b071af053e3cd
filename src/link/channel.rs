//! Byte-channel abstraction a [`DeviceLink`](super::DeviceLink) drives.
//!
//! The link only needs line-oriented access to the device, so the seam sits
//! at "read one line within a deadline / write one line / discard buffers".
//! [`SerialPortChannel`](super::serial_port::SerialPortChannel) implements it
//! over a physical port, [`MockChannel`](super::mock::MockChannel) over a
//! scripted device.

use std::io;
use std::time::Duration;

use crate::config::SerialConfig;

/// One open, exclusively owned, line-oriented channel to a device.
pub trait SerialChannel: Send {
    /// Read the next newline-terminated line, trimmed.
    ///
    /// Returns `Ok(None)` if no complete line arrived within `timeout`;
    /// partial input is kept for the next call.
    fn read_line(&mut self, timeout: Duration) -> io::Result<Option<String>>;

    /// Write `line` followed by `\n`.
    fn write_line(&mut self, line: &str) -> io::Result<()>;

    /// Discard buffered input and output.
    fn clear(&mut self) -> io::Result<()>;
}

/// Opens channels by port identifier.
pub trait ChannelOpener: Send + Sync {
    /// Open `port` with the line settings in `config`.
    fn open(&self, port: &str, config: &SerialConfig) -> io::Result<Box<dyn SerialChannel>>;
}

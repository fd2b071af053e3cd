//! Platform discovery backends.
//!
//! Both backends enumerate the operating system's serial device list through
//! `serialport` and differ only in how a port is recognised as a
//! SmellInspector bridge:
//!
//! - [`VendorIdDiscovery`] (macOS/Linux): exact USB vendor id match, falling
//!   back to case-insensitive substrings of manufacturer/description/name.
//! - [`NameDiscovery`] (Windows): case-insensitive driver-name substring of
//!   the port's friendly name, as the device manager reports it.

use super::PortDiscovery;
use crate::error::PortError;

/// Description of one enumerated serial port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortDescriptor {
    /// OS device identifier (`/dev/ttyUSB0`, `COM3`, ...)
    pub device: String,
    /// USB vendor id, if the port is USB backed
    pub vid: Option<u16>,
    /// USB product id, if the port is USB backed
    pub pid: Option<u16>,
    /// Manufacturer string reported by the OS
    pub manufacturer: Option<String>,
    /// Product / friendly description reported by the OS
    pub description: Option<String>,
}

impl PortDescriptor {
    /// Descriptor for a plain device path without USB metadata.
    pub fn bare(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            ..Default::default()
        }
    }

    fn lower(field: &Option<String>) -> String {
        field.as_deref().unwrap_or_default().to_lowercase()
    }
}

/// List every serial port the OS knows about.
fn available_ports() -> Result<Vec<PortDescriptor>, PortError> {
    #[cfg(feature = "instrument_serial")]
    {
        use serialport::SerialPortType;

        let ports =
            serialport::available_ports().map_err(|e| PortError::Enumeration(e.to_string()))?;
        Ok(ports
            .into_iter()
            .map(|info| match info.port_type {
                SerialPortType::UsbPort(usb) => PortDescriptor {
                    device: info.port_name,
                    vid: Some(usb.vid),
                    pid: Some(usb.pid),
                    manufacturer: usb.manufacturer,
                    description: usb.product,
                },
                _ => PortDescriptor::bare(info.port_name),
            })
            .collect())
    }

    #[cfg(not(feature = "instrument_serial"))]
    {
        Err(PortError::Enumeration(
            "Serial support not enabled. Rebuild with --features instrument_serial".to_string(),
        ))
    }
}

/// Vendor-id discovery used on macOS and Linux.
#[derive(Debug, Clone)]
pub struct VendorIdDiscovery {
    vendor_id: u16,
}

impl VendorIdDiscovery {
    /// Silicon Labs, the CP210x bridge vendor.
    pub const SILABS_VID: u16 = 0x10C4;

    /// Create a backend preferring the given USB vendor id.
    pub fn new(vendor_id: u16) -> Self {
        Self { vendor_id }
    }
}

impl Default for VendorIdDiscovery {
    fn default() -> Self {
        Self::new(Self::SILABS_VID)
    }
}

impl PortDiscovery for VendorIdDiscovery {
    fn name(&self) -> &'static str {
        "vendor-id"
    }

    fn enumerate(&self) -> Result<Vec<PortDescriptor>, PortError> {
        available_ports()
    }

    fn matches(&self, port: &PortDescriptor, driver_hint: &str) -> bool {
        if port.vid == Some(self.vendor_id) {
            return true;
        }
        let hint = driver_hint.to_lowercase();
        let desc = PortDescriptor::lower(&port.description);
        let mfg = PortDescriptor::lower(&port.manufacturer);
        let device = port.device.to_lowercase();

        (!hint.is_empty() && (desc.contains(&hint) || mfg.contains(&hint)))
            || desc.contains("cp210")
            || device.contains("cp210")
            || mfg.contains("silicon labs")
            || device.contains("slab")
    }
}

/// Friendly-name discovery used on Windows.
#[derive(Debug, Clone, Default)]
pub struct NameDiscovery;

impl PortDiscovery for NameDiscovery {
    fn name(&self) -> &'static str {
        "friendly-name"
    }

    fn enumerate(&self) -> Result<Vec<PortDescriptor>, PortError> {
        available_ports()
    }

    fn matches(&self, port: &PortDescriptor, driver_hint: &str) -> bool {
        let hint = driver_hint.to_lowercase();
        !hint.is_empty()
            && (PortDescriptor::lower(&port.description).contains(&hint)
                || PortDescriptor::lower(&port.manufacturer).contains(&hint))
    }
}

/// Fixed port list, for tests and for setups where ports are configured
/// rather than discovered. Every listed port matches any hint.
#[derive(Debug, Clone, Default)]
pub struct FixedPorts {
    ports: Vec<PortDescriptor>,
}

impl FixedPorts {
    /// Build from device identifiers.
    pub fn new<I, S>(devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ports: devices.into_iter().map(PortDescriptor::bare).collect(),
        }
    }
}

impl PortDiscovery for FixedPorts {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn enumerate(&self) -> Result<Vec<PortDescriptor>, PortError> {
        Ok(self.ports.clone())
    }

    fn matches(&self, _port: &PortDescriptor, _driver_hint: &str) -> bool {
        true
    }
}

/// Pick the discovery backend for the platform this binary runs on.
pub fn platform_discovery(vendor_id: u16) -> Box<dyn PortDiscovery> {
    if cfg!(windows) {
        Box::new(NameDiscovery)
    } else {
        Box::new(VendorIdDiscovery::new(vendor_id))
    }
}

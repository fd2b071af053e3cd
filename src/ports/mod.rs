//! Port registry: process-wide exclusive allocation of serial port
//! identifiers, plus the discovery contract used to find candidate ports.
//!
//! The registry is an explicitly owned value shared through `Arc`, not a
//! global, so every test can build an isolated instance.

pub mod discovery;

use std::collections::HashSet;
use std::sync::Mutex;

use tracing::{debug, error, info};

pub use discovery::{
    platform_discovery, FixedPorts, NameDiscovery, PortDescriptor, VendorIdDiscovery,
};

use crate::error::PortError;
use crate::sync::lock;

/// Capability interface implemented by each platform discovery backend.
pub trait PortDiscovery: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Enumerate every serial port visible to the OS.
    fn enumerate(&self) -> Result<Vec<PortDescriptor>, PortError>;

    /// Whether an enumerated port looks like the device behind `driver_hint`.
    fn matches(&self, port: &PortDescriptor, driver_hint: &str) -> bool;
}

/// Exclusive-allocation table over port identifiers.
pub struct PortRegistry {
    discovery: Box<dyn PortDiscovery>,
    allocated: Mutex<HashSet<String>>,
}

impl PortRegistry {
    /// Create an empty registry backed by the given discovery backend.
    pub fn new(discovery: Box<dyn PortDiscovery>) -> Self {
        Self {
            discovery,
            allocated: Mutex::new(HashSet::new()),
        }
    }

    /// Candidate ports for `driver_hint`, excluding ports already allocated.
    ///
    /// Enumeration failures are logged and treated as an empty listing, so
    /// both cases surface as [`PortError::NoMatchingDevice`].
    pub fn discover(&self, driver_hint: &str) -> Result<Vec<String>, PortError> {
        info!(
            backend = self.discovery.name(),
            hint = driver_hint,
            "Querying serial ports"
        );

        let ports = self.discovery.enumerate().unwrap_or_else(|e| {
            error!(backend = self.discovery.name(), error = %e, "Unable to query serial ports");
            Vec::new()
        });

        let mut matches = Vec::new();
        for port in ports
            .iter()
            .filter(|p| self.discovery.matches(p, driver_hint))
        {
            if self.is_allocated(&port.device) {
                info!(port = %port.device, "Skipping port because it is already being used");
                continue;
            }
            info!(
                port = %port.device,
                vid = ?port.vid,
                pid = ?port.pid,
                manufacturer = ?port.manufacturer,
                description = ?port.description,
                "Device found"
            );
            if !matches.contains(&port.device) {
                matches.push(port.device.clone());
            }
        }
        debug!(ports = ?matches, "Found ports");

        if matches.is_empty() {
            return Err(PortError::NoMatchingDevice {
                hint: driver_hint.to_string(),
            });
        }
        Ok(matches)
    }

    /// Claim `port`. Check and insert happen under one lock.
    pub fn allocate(&self, port: &str) -> Result<(), PortError> {
        if !lock(&self.allocated).insert(port.to_string()) {
            error!(port, "Attempted to allocate port, but it is already in use");
            return Err(PortError::AlreadyInUse(port.to_string()));
        }
        info!(port, "Added port to allocated ports");
        Ok(())
    }

    /// Release a previously allocated `port`.
    pub fn deallocate(&self, port: &str) -> Result<(), PortError> {
        if !lock(&self.allocated).remove(port) {
            error!(port, "Attempted to deallocate port, but it is not in use");
            return Err(PortError::NotAllocated(port.to_string()));
        }
        info!(port, "Deallocated port");
        Ok(())
    }

    /// Whether `port` is currently allocated.
    pub fn is_allocated(&self, port: &str) -> bool {
        lock(&self.allocated).contains(port)
    }

    /// Snapshot of allocated ports, sorted.
    pub fn allocated(&self) -> Vec<String> {
        let mut ports: Vec<String> = lock(&self.allocated).iter().cloned().collect();
        ports.sort();
        ports
    }
}

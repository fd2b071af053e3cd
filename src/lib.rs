//! Core library for the smell_daq acquisition pipeline.
//!
//! This library discovers and claims SmellInspector USB-serial units, drives
//! their line protocol, and runs one background acquisition session per
//! device that turns telemetry into persisted, published samples. It is used
//! by the `smell_daq` command line front end and by whatever request layer
//! embeds a [`directory::SessionDirectory`].

pub mod config;
pub mod directory;
pub mod error;
pub mod link;
pub mod ports;
pub mod session;
pub mod sink;
pub mod store;
pub mod telemetry;

mod sync;

pub use directory::SessionDirectory;
pub use error::{AppResult, DaqError};

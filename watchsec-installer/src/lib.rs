//! WatchSec Installer Runtime
//!
//! This library provides the installer runtime components:
//! - Device trust validation against the backend
//! - Elevated provisioning script launch
//! - Install orchestration and the worker loop
//! - Terminal presentation

// Re-export from watchsec-common for convenience
pub use watchsec_common::{archive, config, paths, payload, secrets, InstallError, Result};

pub mod device;
pub mod driver;
pub mod elevation;
pub mod orchestrator;
pub mod session;
pub mod trust;
pub mod ui;

#[cfg(test)]
mod testing;

//! WatchSec Installer Common Library
//!
//! Synchronous building blocks shared by the installer:
//! - Payload trailer location
//! - Zip payload extraction
//! - Payload configuration parsing
//! - Tenant key migration into secure storage
//!
//! This crate has NO async dependencies.

pub mod archive;
pub mod config;
pub mod error;
pub mod paths;
pub mod payload;
pub mod secrets;

pub use error::{InstallError, Result};

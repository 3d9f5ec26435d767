//! Installer Error Taxonomy
//!
//! Every failure the installer can surface to the operator. Whether a failure
//! halts the flow is decided here, in one place, by [`InstallError::is_fatal`].

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used across the installer crates
pub type Result<T, E = InstallError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum InstallError {
    /// The image is too small to carry a trailer
    #[error("Installer corrupted (image is {len} bytes, too small for a payload trailer)")]
    CorruptedImage { len: u64 },

    /// Trailer value is zero or negative: not a packaged build
    #[error("No embedded payload found (trailer value {raw})")]
    NoPayload { raw: i64 },

    /// Trailer points at or beyond the end of the image
    #[error("Invalid payload offset {offset} for an image of {len} bytes")]
    InvalidOffset { offset: i64, len: u64 },

    #[error("Failed to extract payload: {0}")]
    ExtractionFailed(String),

    #[error("Configuration file not found: {}", .0.display())]
    ConfigMissing(PathBuf),

    #[error("No tenant key found in installer")]
    MissingTenantKey,

    #[error("Failed to secure configuration: {0}")]
    SecretMigrationFailed(String),

    #[error("Error contacting server: {0}")]
    NetworkUnavailable(String),

    #[error("Device is not trusted; an installation PIN is required")]
    DeviceRejected,

    #[error("Invalid PIN. Ask IT Admin.")]
    PinRejected,

    /// PIN failed local validation before any request was sent
    #[error("PIN must be between 1 and {max} characters")]
    InvalidPin { max: usize },

    #[error("Provisioning script not found in payload: {}", .0.display())]
    ScriptMissing(PathBuf),

    #[error("Elevation was denied: {0}")]
    ElevationDenied(String),

    #[error("Provisioning script failed: {0}")]
    ElevationFailed(String),

    /// A phase was invoked before the phases it depends on
    #[error("Install step requested out of order: {0}")]
    OutOfOrder(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl InstallError {
    /// Whether this failure must halt the install flow.
    ///
    /// Missing optional artifacts and best-effort secret migration never
    /// halt; a rejected PIN is re-prompted.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            InstallError::ConfigMissing(_)
                | InstallError::SecretMigrationFailed(_)
                | InstallError::ScriptMissing(_)
                | InstallError::PinRejected
                | InstallError::InvalidPin { .. }
                | InstallError::DeviceRejected
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_effort_errors_are_not_fatal() {
        assert!(!InstallError::ConfigMissing(PathBuf::from("appsettings.json")).is_fatal());
        assert!(!InstallError::SecretMigrationFailed("denied".into()).is_fatal());
        assert!(!InstallError::ScriptMissing(PathBuf::from("install.sh")).is_fatal());
        assert!(!InstallError::PinRejected.is_fatal());
    }

    #[test]
    fn test_locate_and_network_errors_are_fatal() {
        assert!(InstallError::CorruptedImage { len: 3 }.is_fatal());
        assert!(InstallError::NoPayload { raw: 0 }.is_fatal());
        assert!(InstallError::InvalidOffset { offset: 10, len: 10 }.is_fatal());
        assert!(InstallError::NetworkUnavailable("refused".into()).is_fatal());
        assert!(InstallError::ElevationDenied("cancelled".into()).is_fatal());
    }

    #[test]
    fn test_messages_are_human_readable() {
        let err = InstallError::NoPayload { raw: 0 };
        assert!(err.to_string().starts_with("No embedded payload found"));
        assert_eq!(InstallError::PinRejected.to_string(), "Invalid PIN. Ask IT Admin.");
    }
}

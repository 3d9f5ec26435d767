//! Centralized Path and Name Definitions
//!
//! Every fixed name the installer depends on lives here: payload entries,
//! workspace prefixes, the secure-storage namespace and the backend default.
//! These are part of the contract with the packaging step and the backend,
//! so they must stay stable across builds.

/// Entries expected inside the payload archive
pub mod payload {
    /// Optional configuration file carrying the tenant key and backend URL
    pub const CONFIG_ENTRY: &str = "appsettings.json";

    /// Provisioning script run with elevated privileges
    #[cfg(windows)]
    pub const SCRIPT_ENTRY: &str = "install.ps1";

    /// Provisioning script run with elevated privileges
    #[cfg(not(windows))]
    pub const SCRIPT_ENTRY: &str = "install.sh";

    /// Size of the trailer at the end of the image
    pub const TRAILER_LEN: u64 = 8;
}

/// Scratch directories created under the system temp dir
pub mod workspace {
    use std::path::PathBuf;

    /// Prefix for the disposable config pre-check workspace
    pub const PRECHECK_PREFIX: &str = "WatchSec_PreCheck_";

    /// Prefix for the full install workspace (kept after the run)
    pub const INSTALL_PREFIX: &str = "WatchSec_Install_";

    /// Parent directory for all workspaces
    pub fn temp_root() -> PathBuf {
        std::env::temp_dir()
    }
}

/// Privileged secret storage location
pub mod secure_store {
    /// Registry key under HKEY_LOCAL_MACHINE
    pub const REGISTRY_KEY_PATH: &str = r"SOFTWARE\WatchSec\Agent";

    /// Root-owned directory holding one file per value
    pub const UNIX_STORE_DIR: &str = "/etc/watchsec/agent";

    /// Value name of the migrated tenant key
    pub const TENANT_KEY_NAME: &str = "TenantApiKey";
}

/// Backend endpoints
pub mod backend {
    /// Used when the payload config does not name a backend
    pub const DEFAULT_URL: &str = "http://localhost:5140";

    pub const VALIDATE_PATH: &str = "/api/install/validate";
    pub const VERIFY_TOKEN_PATH: &str = "/api/install/verify-token";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_paths_are_absolute() {
        assert!(backend::VALIDATE_PATH.starts_with('/'));
        assert!(backend::VERIFY_TOKEN_PATH.starts_with('/'));
        assert!(!backend::DEFAULT_URL.ends_with('/'));
    }

    #[test]
    fn test_workspace_prefixes_differ() {
        assert_ne!(workspace::PRECHECK_PREFIX, workspace::INSTALL_PREFIX);
    }
}

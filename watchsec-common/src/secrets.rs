//! Secret Migration
//!
//! Moves the tenant key out of the plaintext `appsettings.json` and into the
//! platform's privileged key/value store:
//! - Windows: `HKLM\SOFTWARE\WatchSec\Agent`, value `TenantApiKey`
//! - Unix: `/etc/watchsec/agent/TenantApiKey`, root-owned, mode 0600
//!
//! Once the key is stored the whole config file is deleted. Callers that
//! still need `BackendUrl` must read it before migrating.

use crate::config::{InstallerConfig, ParseMode};
use crate::error::{InstallError, Result};
use crate::paths::secure_store::TENANT_KEY_NAME;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A privileged key/value namespace.
///
/// `upsert` must replace any previous value atomically; last writer wins.
pub trait SecretStore: Send + Sync {
    fn upsert(&self, name: &str, value: &str) -> std::io::Result<()>;

    fn read(&self, name: &str) -> std::io::Result<Option<String>>;

    /// Human-readable location, for logs
    fn location(&self) -> String;
}

/// Result of a migration attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Key stored, config file removed
    Migrated { degraded: bool },
    /// Config has no tenant key; file left untouched
    NoSecret,
}

/// Relocate the tenant key from `config_path` into `store`.
///
/// A missing file is reported as `ConfigMissing`; a failed store write as
/// `SecretMigrationFailed`, leaving the file in place. Both are non-fatal to
/// the caller.
pub fn migrate_secret(config_path: &Path, store: &dyn SecretStore) -> Result<MigrationOutcome> {
    if !config_path.exists() {
        return Err(InstallError::ConfigMissing(config_path.to_path_buf()));
    }

    let (config, mode) = InstallerConfig::from_file(config_path)
        .map_err(|e| InstallError::SecretMigrationFailed(format!("cannot read config: {}", e)))?;

    let Some(key) = config.tenant_key() else {
        tracing::info!("No tenant key in {:?}; nothing to migrate", config_path);
        return Ok(MigrationOutcome::NoSecret);
    };

    store
        .upsert(TENANT_KEY_NAME, key)
        .map_err(|e| InstallError::SecretMigrationFailed(format!("{}: {}", store.location(), e)))?;
    tracing::info!("API key moved to secure storage at {}", store.location());

    std::fs::remove_file(config_path).map_err(|e| {
        InstallError::SecretMigrationFailed(format!("key stored but config not removed: {}", e))
    })?;

    Ok(MigrationOutcome::Migrated {
        degraded: mode == ParseMode::Degraded,
    })
}

/// In-process store, used by tests
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn upsert(&self, name: &str, value: &str) -> std::io::Result<()> {
        self.values
            .lock()
            .map_err(|_| std::io::Error::other("secret store lock poisoned"))?
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn read(&self, name: &str) -> std::io::Result<Option<String>> {
        Ok(self
            .values
            .lock()
            .map_err(|_| std::io::Error::other("secret store lock poisoned"))?
            .get(name)
            .cloned())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

/// One file per value inside a restricted directory.
///
/// Writes go to a temp file in the same directory and are renamed over the
/// previous value.
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    dir: PathBuf,
}

impl FileSecretStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn value_path(&self, name: &str) -> std::io::Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid secret name: {:?}", name),
            ));
        }
        Ok(self.dir.join(name))
    }
}

impl SecretStore for FileSecretStore {
    fn upsert(&self, name: &str, value: &str) -> std::io::Result<()> {
        use std::io::Write;

        let dest = self.value_path(name)?;
        std::fs::create_dir_all(&self.dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.dir, std::fs::Permissions::from_mode(0o700))?;
        }

        // NamedTempFile is created 0600 on Unix
        let mut staged = tempfile::Builder::new().prefix(".staged-").tempfile_in(&self.dir)?;
        staged.write_all(value.as_bytes())?;
        staged.as_file().sync_all()?;
        staged.persist(&dest).map_err(|e| e.error)?;
        Ok(())
    }

    fn read(&self, name: &str) -> std::io::Result<Option<String>> {
        match std::fs::read_to_string(self.value_path(name)?) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn location(&self) -> String {
        self.dir.display().to_string()
    }
}

/// HKEY_LOCAL_MACHINE subkey holding string values
#[cfg(windows)]
#[derive(Debug, Clone)]
pub struct RegistrySecretStore {
    key_path: String,
}

#[cfg(windows)]
impl RegistrySecretStore {
    pub fn new(key_path: impl Into<String>) -> Self {
        Self { key_path: key_path.into() }
    }
}

#[cfg(windows)]
mod registry {
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{ERROR_FILE_NOT_FOUND, ERROR_SUCCESS};
    use windows::Win32::System::Registry::{
        RegCloseKey, RegCreateKeyExW, RegGetValueW, RegSetValueExW, HKEY, HKEY_LOCAL_MACHINE,
        KEY_QUERY_VALUE, KEY_SET_VALUE, KEY_WOW64_64KEY, REG_OPTION_NON_VOLATILE, REG_SZ,
        RRF_RT_REG_SZ,
    };

    fn wide(value: &str) -> Vec<u16> {
        OsStr::new(value).encode_wide().chain(std::iter::once(0)).collect()
    }

    struct KeyGuard(HKEY);

    impl Drop for KeyGuard {
        fn drop(&mut self) {
            unsafe {
                let _ = RegCloseKey(self.0);
            }
        }
    }

    fn open(key_path: &str) -> std::io::Result<KeyGuard> {
        let path = wide(key_path);
        let mut hkey = HKEY::default();
        let status = unsafe {
            RegCreateKeyExW(
                HKEY_LOCAL_MACHINE,
                PCWSTR(path.as_ptr()),
                Some(0),
                None,
                REG_OPTION_NON_VOLATILE,
                KEY_SET_VALUE | KEY_QUERY_VALUE | KEY_WOW64_64KEY,
                None,
                &mut hkey,
                None,
            )
        };
        if status != ERROR_SUCCESS {
            return Err(std::io::Error::from_raw_os_error(status.0 as i32));
        }
        Ok(KeyGuard(hkey))
    }

    pub fn set_string(key_path: &str, name: &str, value: &str) -> std::io::Result<()> {
        let key = open(key_path)?;
        let name = wide(name);
        let data = wide(value);
        let bytes: Vec<u8> = data.iter().flat_map(|unit| unit.to_le_bytes()).collect();

        let status = unsafe {
            RegSetValueExW(key.0, PCWSTR(name.as_ptr()), Some(0), REG_SZ, Some(&bytes))
        };
        if status != ERROR_SUCCESS {
            return Err(std::io::Error::from_raw_os_error(status.0 as i32));
        }
        Ok(())
    }

    pub fn get_string(key_path: &str, name: &str) -> std::io::Result<Option<String>> {
        let key = open(key_path)?;
        let name = wide(name);

        let mut size: u32 = 0;
        let status = unsafe {
            RegGetValueW(
                key.0,
                PCWSTR::null(),
                PCWSTR(name.as_ptr()),
                RRF_RT_REG_SZ,
                None,
                None,
                Some(&mut size),
            )
        };
        if status == ERROR_FILE_NOT_FOUND {
            return Ok(None);
        }
        if status != ERROR_SUCCESS {
            return Err(std::io::Error::from_raw_os_error(status.0 as i32));
        }

        let mut buffer = vec![0u16; (size as usize).div_ceil(2)];
        let status = unsafe {
            RegGetValueW(
                key.0,
                PCWSTR::null(),
                PCWSTR(name.as_ptr()),
                RRF_RT_REG_SZ,
                None,
                Some(buffer.as_mut_ptr() as *mut _),
                Some(&mut size),
            )
        };
        if status != ERROR_SUCCESS {
            return Err(std::io::Error::from_raw_os_error(status.0 as i32));
        }

        let len = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
        Ok(Some(String::from_utf16_lossy(&buffer[..len])))
    }
}

#[cfg(windows)]
impl SecretStore for RegistrySecretStore {
    fn upsert(&self, name: &str, value: &str) -> std::io::Result<()> {
        registry::set_string(&self.key_path, name, value)
    }

    fn read(&self, name: &str) -> std::io::Result<Option<String>> {
        registry::get_string(&self.key_path, name)
    }

    fn location(&self) -> String {
        format!(r"HKLM\{}", self.key_path)
    }
}

/// The privileged store for this platform
#[cfg(windows)]
pub fn system_store() -> RegistrySecretStore {
    RegistrySecretStore::new(crate::paths::secure_store::REGISTRY_KEY_PATH)
}

/// The privileged store for this platform
#[cfg(not(windows))]
pub fn system_store() -> FileSecretStore {
    FileSecretStore::new(crate::paths::secure_store::UNIX_STORE_DIR)
}

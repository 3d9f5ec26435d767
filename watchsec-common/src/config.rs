//! Installer Configuration Parser
//!
//! Parses the `appsettings.json` shipped inside the payload. Structured
//! JSON parsing is always tried first. Only a file that is not valid JSON
//! goes through the degraded textual scan, which recovers the tenant key
//! from a `"TenantApiKey": "..."` marker and nothing else.

use crate::paths::backend::DEFAULT_URL;
use crate::paths::secure_store::TENANT_KEY_NAME;
use serde::Deserialize;
use std::fmt;
use std::path::Path;

/// Configuration carried in the payload
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct InstallerConfig {
    /// Tenant credential, moved to secure storage during install
    #[serde(rename = "TenantApiKey", default)]
    pub tenant_api_key: Option<String>,

    /// Base URL of the validation backend
    #[serde(rename = "BackendUrl", default = "default_backend_url")]
    pub backend_url: String,
}

fn default_backend_url() -> String {
    DEFAULT_URL.to_string()
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            tenant_api_key: None,
            backend_url: default_backend_url(),
        }
    }
}

// Never print the tenant key
impl fmt::Debug for InstallerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallerConfig")
            .field("tenant_api_key", &self.tenant_api_key.as_ref().map(|_| "<redacted>"))
            .field("backend_url", &self.backend_url)
            .finish()
    }
}

/// How a config file was read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    Structured,
    /// Not valid JSON; only the tenant key was recovered by text scan
    Degraded,
}

impl InstallerConfig {
    /// Parse config text, falling back to the textual scan on invalid JSON
    pub fn parse(text: &str) -> (Self, ParseMode) {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        match serde_json::from_str::<InstallerConfig>(text) {
            Ok(config) => (config.normalized(), ParseMode::Structured),
            Err(err) => {
                tracing::warn!("Configuration is not valid JSON ({}); scanning for tenant key", err);
                let config = InstallerConfig {
                    tenant_api_key: scan_string_field(text, TENANT_KEY_NAME),
                    ..InstallerConfig::default()
                };
                (config.normalized(), ParseMode::Degraded)
            }
        }
    }

    /// Load and parse a config file
    pub fn from_file(path: &Path) -> std::io::Result<(Self, ParseMode)> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    /// Tenant key, if present and non-empty
    pub fn tenant_key(&self) -> Option<&str> {
        self.tenant_api_key.as_deref()
    }

    fn normalized(mut self) -> Self {
        if self.tenant_api_key.as_deref().is_some_and(|key| key.trim().is_empty()) {
            self.tenant_api_key = None;
        }
        let trimmed = self.backend_url.trim().trim_end_matches('/');
        self.backend_url = if trimmed.is_empty() {
            default_backend_url()
        } else {
            trimmed.to_string()
        };
        self
    }
}

/// Find `"<field>"`, then a `:`, then return the quoted string that follows.
///
/// Escapes inside the value are not interpreted; the value ends at the next
/// double quote.
pub fn scan_string_field(text: &str, field: &str) -> Option<String> {
    let marker = format!("\"{}\"", field);
    let mut search_from = 0;

    while let Some(found) = text[search_from..].find(&marker) {
        let after_marker = search_from + found + marker.len();
        search_from = after_marker;

        let rest = text[after_marker..].trim_start();
        let Some(rest) = rest.strip_prefix(':') else {
            continue;
        };
        let Some(rest) = rest.trim_start().strip_prefix('"') else {
            continue;
        };
        let end = rest.find('"')?;
        let value = &rest[..end];
        return (!value.is_empty()).then(|| value.to_string());
    }

    None
}

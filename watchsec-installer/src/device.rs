//! Local Device Identity
//!
//! What the installer tells the backend about the machine it runs on.

use serde::Serialize;

/// Sent as-is; the server sees the real peer address
pub const PLACEHOLDER_IP: &str = "127.0.0.1";

/// Body of the device validation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    #[serde(rename = "MachineName")]
    pub machine_name: String,

    #[serde(rename = "Domain")]
    pub domain: String,

    #[serde(rename = "IP")]
    pub ip: String,
}

impl DeviceIdentity {
    /// Identity of the running machine
    pub fn local() -> Self {
        let machine_name = machine_name();
        let domain = domain_name().unwrap_or_else(|| machine_name.clone());

        Self {
            machine_name,
            domain,
            ip: PLACEHOLDER_IP.to_string(),
        }
    }
}

const UNKNOWN_HOST: &str = "unknown";

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty() && trimmed != "(none)").then(|| trimmed.to_string())
}

fn machine_name() -> String {
    match hostname::get() {
        Ok(name) => non_empty(name.to_string_lossy().into_owned())
            .unwrap_or_else(|| UNKNOWN_HOST.to_string()),
        Err(e) => {
            tracing::warn!("Cannot read host name: {}", e);
            UNKNOWN_HOST.to_string()
        }
    }
}

/// Logon domain on Windows.
///
/// Hosts outside a domain report their machine name instead.
fn domain_name() -> Option<String> {
    std::env::var("USERDOMAIN").ok().and_then(non_empty)
}

//! Install Session State
//!
//! Everything the install flow learns about the current run.

use std::path::PathBuf;
use watchsec_common::config::InstallerConfig;
use watchsec_common::paths::backend::DEFAULT_URL;
use watchsec_common::payload::PayloadInfo;

/// Where the session currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Locating,
    PreChecking,
    Validating,
    AwaitingPin,
    ReadyToInstall,
    Extracting,
    Securing,
    Provisioning,
    Completed,
    Failed,
}

impl Phase {
    /// No further steps are possible from this phase
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct InstallSession {
    pub image_path: PathBuf,
    pub phase: Phase,
    pub last_error: Option<String>,
    pub pin_verified: bool,
    pub payload: Option<PayloadInfo>,
    pub config: Option<InstallerConfig>,
    /// Install workspace; kept on disk after the run
    pub workspace: Option<PathBuf>,
    /// The provisioning script was absent from the payload
    pub provisioning_skipped: bool,
}

impl InstallSession {
    pub fn new(image_path: impl Into<PathBuf>) -> Self {
        Self {
            image_path: image_path.into(),
            phase: Phase::Starting,
            last_error: None,
            pin_verified: false,
            payload: None,
            config: None,
            workspace: None,
            provisioning_skipped: false,
        }
    }

    pub fn enter(&mut self, phase: Phase) {
        tracing::debug!("Session phase: {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    /// Record a fatal error and move to `Failed`
    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("Installation failed: {}", message);
        self.last_error = Some(message);
        self.enter(Phase::Failed);
    }

    /// Backend from the payload configuration, or the built-in default
    pub fn backend_url(&self) -> String {
        self.config
            .as_ref()
            .map(|config| config.backend_url.clone())
            .unwrap_or_else(|| DEFAULT_URL.to_string())
    }

    pub fn succeeded(&self) -> bool {
        self.phase == Phase::Completed
    }
}

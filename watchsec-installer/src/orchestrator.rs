//! Install Orchestrator
//!
//! Sequences the installer phases over an explicit [`InstallSession`]:
//!
//! 1. `analyze` - locate the payload, read its config in a throwaway workspace
//! 2. `check_device` - classify the device with the backend
//! 3. `submit_pin` - verify an operator PIN (untrusted devices only)
//! 4. `install` - extract, secure the tenant key, run the provisioning script
//!
//! Every phase reports to the display through the [`UiHandle`] and records
//! its outcome on the session. Fatal failures leave the session `Failed`;
//! nothing is rolled back.

use crate::device::DeviceIdentity;
use crate::elevation::{self, Elevator};
use crate::session::{InstallSession, Phase};
use crate::trust::{Authorization, DeviceTrust, Pin, TrustService, TrustState, TrustValidator};
use crate::ui::{Action, Severity, UiHandle};
use std::path::PathBuf;
use std::sync::Arc;
use watchsec_common::archive::{self, Strategy};
use watchsec_common::config::{InstallerConfig, ParseMode};
use watchsec_common::paths::payload::CONFIG_ENTRY;
use watchsec_common::paths::workspace::{temp_root, INSTALL_PREFIX, PRECHECK_PREFIX};
use watchsec_common::payload::{locate_payload_in_file, PayloadInfo};
use watchsec_common::secrets::{migrate_secret, MigrationOutcome, SecretStore};
use watchsec_common::{InstallError, Result};

/// What a completed install left behind
#[derive(Debug, Clone)]
pub struct InstallReport {
    /// Install workspace, kept after the run
    pub workspace: PathBuf,
    pub entries: usize,
    pub strategy: Strategy,
    /// `None` when migration failed or the config was absent
    pub secret: Option<MigrationOutcome>,
    pub provisioned: bool,
    /// Non-fatal problems shown to the operator
    pub warnings: Vec<String>,
}

pub struct Orchestrator<T, E> {
    validator: TrustValidator<T>,
    elevator: E,
    store: Arc<dyn SecretStore>,
    device: DeviceIdentity,
    ui: UiHandle,
    backend_override: Option<String>,
    workspace_root: PathBuf,
}

impl<T: TrustService, E: Elevator> Orchestrator<T, E> {
    pub fn new(
        service: T,
        elevator: E,
        store: Arc<dyn SecretStore>,
        device: DeviceIdentity,
        ui: UiHandle,
    ) -> Self {
        Self {
            validator: TrustValidator::new(service),
            elevator,
            store,
            device,
            ui,
            backend_override: None,
            workspace_root: temp_root(),
        }
    }

    /// Use this backend instead of the one named in the payload config
    pub fn with_backend_override(mut self, backend: Option<String>) -> Self {
        self.backend_override = backend.map(|url| url.trim_end_matches('/').to_string());
        self
    }

    /// Directory that receives the pre-check and install workspaces
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    pub fn ui(&self) -> &UiHandle {
        &self.ui
    }

    pub fn elevator(&self) -> &E {
        &self.elevator
    }

    pub fn validator(&self) -> &TrustValidator<T> {
        &self.validator
    }

    pub fn trust_state(&self) -> TrustState {
        self.validator.state()
    }

    /// Proof of authorization once the device is trusted or the PIN verified
    pub fn authorization(&self) -> Option<Authorization> {
        self.validator.authorization()
    }

    fn backend(&self, session: &InstallSession) -> String {
        self.backend_override
            .clone()
            .unwrap_or_else(|| session.backend_url())
    }

    /// Show `status`, fail the session and hand the error back
    fn halt(&self, session: &mut InstallSession, err: InstallError, status: &str) -> InstallError {
        self.ui.status(status, Severity::Error);
        session.fail(err.to_string());
        err
    }

    /// Locate the payload and read its configuration.
    ///
    /// The pre-check workspace is removed before this returns. A payload
    /// without a tenant key halts the flow.
    pub fn analyze(&mut self, session: &mut InstallSession) -> Result<()> {
        session.enter(Phase::Locating);
        self.ui.status("Initializing...", Severity::Info);
        self.ui.primary_action(Action::Checking, false);

        let payload = match locate_payload_in_file(&session.image_path) {
            Ok(payload) => payload,
            Err(err @ InstallError::NoPayload { .. }) => {
                tracing::info!("No embedded payload found: {}", err);
                return Err(self.halt(
                    session,
                    err,
                    "No embedded payload found.\n(Dev Mode: Ensure you built with payload)",
                ));
            }
            Err(err @ (InstallError::CorruptedImage { .. } | InstallError::InvalidOffset { .. })) => {
                return Err(self.halt(session, err, "Installer corrupted."));
            }
            Err(err) => {
                let status = format!("Initialization Failed: {}", err);
                return Err(self.halt(session, err, &status));
            }
        };

        session.enter(Phase::PreChecking);
        let config = match self.read_payload_config(&payload) {
            Ok(config) => config,
            Err(err) => {
                let status = format!("Initialization Failed: {}", err);
                return Err(self.halt(session, err, &status));
            }
        };
        session.payload = Some(payload);

        let Some(config) = config.filter(|config| config.tenant_key().is_some()) else {
            return Err(self.halt(
                session,
                InstallError::MissingTenantKey,
                "Error: No Tenant Key found in installer.",
            ));
        };

        tracing::info!("Backend: {}", config.backend_url);
        session.config = Some(config);
        Ok(())
    }

    /// Pull the config entry into a throwaway workspace and parse it
    fn read_payload_config(&self, payload: &PayloadInfo) -> Result<Option<InstallerConfig>> {
        let precheck = tempfile::Builder::new()
            .prefix(PRECHECK_PREFIX)
            .tempdir_in(&self.workspace_root)?;

        let config = match archive::extract_entry(payload, CONFIG_ENTRY, precheck.path())? {
            Some(path) => {
                let (config, mode) = InstallerConfig::from_file(&path)?;
                if mode == ParseMode::Degraded {
                    tracing::warn!("Payload configuration was read in degraded mode");
                }
                Some(config)
            }
            None => {
                tracing::warn!("Payload carries no {}", CONFIG_ENTRY);
                None
            }
        };

        precheck.close()?;
        Ok(config)
    }

    /// Ask the backend whether this device is trusted.
    ///
    /// Any failure here is terminal; no PIN is offered.
    pub async fn check_device(&mut self, session: &mut InstallSession) -> Result<DeviceTrust> {
        session.enter(Phase::Validating);
        self.ui.status("Validating Device Security...", Severity::Info);
        self.ui.primary_action(Action::Checking, false);

        let backend = self.backend(session);
        match self.validator.check_device(&backend, &self.device).await {
            Ok(DeviceTrust::Trusted) => {
                self.ui.status(
                    "Device Authorized (Office/Domain).\nReady to Install.",
                    Severity::Success,
                );
                self.ui.primary_action(Action::Install, true);
                session.enter(Phase::ReadyToInstall);
                Ok(DeviceTrust::Trusted)
            }
            Ok(DeviceTrust::RemoteUntrusted) => {
                self.ui.status(
                    "Remote Device Detected.\nEnter Installation PIN to proceed.",
                    Severity::Warning,
                );
                self.ui.show_pin_input(true);
                self.ui.primary_action(Action::VerifyPin, true);
                session.enter(Phase::AwaitingPin);
                Ok(DeviceTrust::RemoteUntrusted)
            }
            Err(err) => Err(self.halt(session, err, "Error contacting server. Check internet.")),
        }
    }

    /// Verify an operator PIN.
    ///
    /// Rejected or malformed codes leave the session awaiting a PIN with
    /// the action re-enabled.
    pub async fn submit_pin(&mut self, session: &mut InstallSession, code: &str) -> Result<()> {
        if self.validator.state() != TrustState::PinRequired {
            return Err(InstallError::OutOfOrder("no PIN is expected in this state"));
        }
        self.ui.primary_action(Action::VerifyPin, false);

        let pin = match Pin::new(code) {
            Ok(pin) => pin,
            Err(err) => {
                self.ui.notice(err.to_string());
                self.ui.primary_action(Action::VerifyPin, true);
                return Err(err);
            }
        };

        let backend = self.backend(session);
        match self.validator.verify_pin(&backend, &pin).await {
            Ok(()) => {
                session.pin_verified = true;
                self.ui.show_pin_input(false);
                self.ui.status("PIN Accepted. Ready to Install.", Severity::Success);
                self.ui.primary_action(Action::Install, true);
                session.enter(Phase::ReadyToInstall);
                Ok(())
            }
            Err(err @ InstallError::PinRejected) => {
                self.ui.notice(err.to_string());
                self.ui.primary_action(Action::VerifyPin, true);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Extract the payload, secure the tenant key and run provisioning.
    ///
    /// Requires the validator's [`Authorization`].
    pub async fn install(
        &mut self,
        session: &mut InstallSession,
        _authorization: Authorization,
    ) -> Result<InstallReport> {
        let Some(payload) = session.payload.clone() else {
            return Err(InstallError::OutOfOrder("installer has not been analyzed"));
        };

        session.enter(Phase::Extracting);
        self.ui.show_pin_input(false);
        self.ui.primary_action(Action::Installing, false);
        self.ui.progress(10);
        self.ui.status("Extracting Files...", Severity::Info);

        let workspace = match tempfile::Builder::new()
            .prefix(INSTALL_PREFIX)
            .tempdir_in(&self.workspace_root)
        {
            Ok(dir) => dir.keep(),
            Err(e) => {
                let err = InstallError::ExtractionFailed(format!("cannot create workspace: {}", e));
                let status = err.to_string();
                return Err(self.halt(session, err, &status));
            }
        };
        session.workspace = Some(workspace.clone());
        tracing::info!("Install workspace: {:?}", workspace);

        let target = workspace.clone();
        let extracted = tokio::task::spawn_blocking(move || archive::extract_all(&payload, &target))
            .await
            .map_err(|e| InstallError::ExtractionFailed(format!("extraction task failed: {}", e)))
            .and_then(|result| result);
        let extract = match extracted {
            Ok(report) => report,
            Err(err) => {
                let status = err.to_string();
                return Err(self.halt(session, err, &status));
            }
        };

        let mut warnings = Vec::new();

        session.enter(Phase::Securing);
        self.ui.progress(50);
        self.ui.status("Securing Configuration...", Severity::Info);

        let config_path = workspace.join(CONFIG_ENTRY);
        let store = Arc::clone(&self.store);
        let migrated = tokio::task::spawn_blocking(move || migrate_secret(&config_path, store.as_ref()))
            .await
            .map_err(|e| InstallError::SecretMigrationFailed(format!("migration task failed: {}", e)))
            .and_then(|result| result);
        let secret = match migrated {
            Ok(outcome) => {
                if outcome == (MigrationOutcome::Migrated { degraded: true }) {
                    tracing::warn!("Tenant key recovered from a malformed configuration file");
                }
                Some(outcome)
            }
            Err(err) if !err.is_fatal() => {
                tracing::warn!("Continuing without securing configuration: {}", err);
                self.ui.status(format!("Warning: {}", err), Severity::Warning);
                warnings.push(err.to_string());
                None
            }
            Err(err) => {
                let status = err.to_string();
                return Err(self.halt(session, err, &status));
            }
        };

        session.enter(Phase::Provisioning);
        self.ui.progress(80);
        self.ui.status("Registering Service...", Severity::Info);

        let provisioned = match elevation::run_provisioning(&self.elevator, &workspace).await {
            Ok(()) => true,
            Err(err) if !err.is_fatal() => {
                tracing::warn!("Skipping provisioning: {}", err);
                warnings.push(err.to_string());
                session.provisioning_skipped = true;
                false
            }
            Err(err) => {
                let status = err.to_string();
                return Err(self.halt(session, err, &status));
            }
        };

        self.ui.progress(100);
        if provisioned {
            self.ui.status("Installation Complete!", Severity::Success);
        } else {
            self.ui.status(
                "Installation Complete!\nThe agent service was not registered (no provisioning script).",
                Severity::Warning,
            );
        }
        self.ui.primary_action(Action::Finish, true);
        session.enter(Phase::Completed);

        tracing::info!(
            "Installed {} entries ({:?}) into {:?}",
            extract.entries,
            extract.strategy,
            workspace
        );

        Ok(InstallReport {
            workspace,
            entries: extract.entries,
            strategy: extract.strategy,
            secret,
            provisioned,
            warnings,
        })
    }
}

//! Install Worker Loop
//!
//! Owns the session and the orchestrator on the worker thread. The display
//! sends [`UserAction`]s; the worker runs the matching phase and reports back
//! through the orchestrator's [`UiHandle`](crate::ui::UiHandle). Exactly one
//! `Finished` event is emitted per run.

use crate::elevation::Elevator;
use crate::orchestrator::Orchestrator;
use crate::session::InstallSession;
use crate::trust::{DeviceTrust, TrustService};
use crate::ui::Severity;
use tokio::sync::mpsc::UnboundedReceiver;
use watchsec_common::{InstallError, Result};

/// Operator input forwarded from the display
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserAction {
    SubmitPin(String),
    Install,
    Quit,
}

/// Run the whole install flow and hand the session back.
pub async fn run<T, E>(
    mut orchestrator: Orchestrator<T, E>,
    mut session: InstallSession,
    mut actions: UnboundedReceiver<UserAction>,
) -> InstallSession
where
    T: TrustService,
    E: Elevator,
{
    if let Err(err) = flow(&mut orchestrator, &mut session, &mut actions).await {
        if !session.phase.is_terminal() {
            orchestrator
                .ui()
                .status(format!("Installation failed: {}", err), Severity::Error);
            session.fail(err.to_string());
        }
    }

    orchestrator.ui().finished(session.succeeded());
    session
}

async fn flow<T, E>(
    orchestrator: &mut Orchestrator<T, E>,
    session: &mut InstallSession,
    actions: &mut UnboundedReceiver<UserAction>,
) -> Result<()>
where
    T: TrustService,
    E: Elevator,
{
    orchestrator.analyze(session)?;
    let trust = orchestrator.check_device(session).await?;
    tracing::info!("Device classification: {:?}", trust);

    while let Some(action) = actions.recv().await {
        match action {
            UserAction::SubmitPin(code) => match orchestrator.submit_pin(session, &code).await {
                Ok(()) => {}
                Err(InstallError::OutOfOrder(reason)) => {
                    tracing::warn!("Ignoring PIN: {}", reason);
                }
                Err(err) if !err.is_fatal() => {
                    tracing::debug!("PIN not accepted: {}", err);
                }
                Err(err) => return Err(err),
            },
            UserAction::Install => {
                let Some(authorization) = orchestrator.authorization() else {
                    tracing::warn!("Install requested before the device was authorized");
                    continue;
                };
                let report = orchestrator.install(session, authorization).await?;
                if trust == DeviceTrust::RemoteUntrusted {
                    tracing::info!("Installed on a remote device after PIN verification");
                }
                tracing::info!("Installer files kept at {:?}", report.workspace);
                return Ok(());
            }
            UserAction::Quit => {
                tracing::info!("Installation cancelled");
                session.last_error = Some("Installation cancelled".to_string());
                return Ok(());
            }
        }
    }

    tracing::info!("Display closed before installation finished");
    Ok(())
}

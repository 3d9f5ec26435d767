//! WatchSec Installer - Self-extracting agent installer
//!
//! This is the main entry point. It handles:
//! 1. CLI argument parsing (--silent, --pin, etc.)
//! 2. Spawning the install worker with its own Tokio runtime
//! 3. Driving the terminal presenter on the main thread

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use watchsec_installer::device::DeviceIdentity;
use watchsec_installer::driver::{self, UserAction};
use watchsec_installer::elevation::SystemElevator;
use watchsec_installer::orchestrator::Orchestrator;
use watchsec_installer::secrets::{self, SecretStore};
use watchsec_installer::session::InstallSession;
use watchsec_installer::trust::HttpTrustService;
use watchsec_installer::ui::{self, console, Severity, UiHandle};

/// WatchSec Installer - installs the WatchSec agent on this device
#[derive(Parser, Debug)]
#[command(name = "watchsec-installer")]
#[command(about = "Self-extracting WatchSec agent installer")]
#[command(version)]
struct Args {
    /// Run without prompts; installs as soon as the device is authorized
    #[arg(long)]
    silent: bool,

    /// Installation PIN for remote devices (silent mode)
    #[arg(long, value_name = "PIN", requires = "silent")]
    pin: Option<String>,

    /// Do not ask for confirmation before installing
    #[arg(short = 'y', long)]
    yes: bool,

    /// Validation backend, overriding the one in the payload
    #[arg(long, value_name = "URL", env = "WATCHSEC_BACKEND_URL")]
    backend_url: Option<String>,

    /// Read the payload from this image instead of the running executable
    #[arg(long, value_name = "FILE", hide = true)]
    image: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if args.verbose { "debug" } else { "info" }));
    let _ = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .try_init();

    info!("WatchSec Installer v{}", env!("CARGO_PKG_VERSION"));

    let image = match args.image {
        Some(image) => image,
        None => std::env::current_exe().context("Cannot determine installer path")?,
    };
    info!("Executable: {:?}", image);

    let (ui_handle, events) = ui::channel();
    let (actions, action_receiver) = tokio::sync::mpsc::unbounded_channel();

    // The worker owns the session and its own runtime; this thread owns the display
    let backend_url = args.backend_url.clone();
    let worker = std::thread::Builder::new()
        .name("install-worker".to_string())
        .spawn(move || run_worker(image, backend_url, ui_handle, action_receiver))
        .context("Failed to start install worker")?;

    let interaction = if args.silent {
        console::Interaction::Silent { pin: args.pin }
    } else {
        console::Interaction::Interactive {
            assume_yes: args.yes,
        }
    };
    let success = console::run(events, actions, interaction);

    match worker.join() {
        Ok(Some(session)) => {
            if let Some(workspace) = &session.workspace {
                info!("Installer files kept at {:?}", workspace);
            }
            if let Some(error) = &session.last_error {
                info!("Installer finished: {}", error);
            }
        }
        Ok(None) => {}
        Err(_) => anyhow::bail!("Install worker panicked"),
    }

    if !success {
        std::process::exit(1);
    }
    Ok(())
}

fn run_worker(
    image: PathBuf,
    backend_url: Option<String>,
    ui_handle: UiHandle,
    actions: UnboundedReceiver<UserAction>,
) -> Option<InstallSession> {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            ui_handle.status(
                format!("Failed to initialize async runtime: {}", e),
                Severity::Error,
            );
            ui_handle.finished(false);
            return None;
        }
    };

    let store: Arc<dyn SecretStore> = Arc::new(secrets::system_store());
    info!("Secure storage: {}", store.location());

    let orchestrator = Orchestrator::new(
        HttpTrustService::new(),
        SystemElevator,
        store,
        DeviceIdentity::local(),
        ui_handle,
    )
    .with_backend_override(backend_url);

    let session = InstallSession::new(image);
    Some(runtime.block_on(driver::run(orchestrator, session, actions)))
}

//! Elevation Launcher - Privileged provisioning hand-off
//!
//! Runs the provisioning script shipped in the payload with administrator
//! rights and waits for it to exit:
//! - Unix: `pkexec /bin/sh <script>` (or `/bin/sh` directly when already root)
//! - Windows: `ShellExecuteExW` with the `runas` verb on `powershell.exe`
//!
//! No console surface is shown for the child.

use std::future::Future;
use std::path::{Path, PathBuf};
use watchsec_common::paths::payload::SCRIPT_ENTRY;
use watchsec_common::{InstallError, Result};

/// Exit status pkexec uses when the user dismissed the dialog
#[cfg(unix)]
const PKEXEC_DISMISSED: i32 = 126;

/// Exit status pkexec uses when authorization failed
#[cfg(unix)]
const PKEXEC_NOT_AUTHORIZED: i32 = 127;

/// Launches a script with escalated privileges
pub trait Elevator: Send + Sync {
    /// Run `script` elevated and wait for it; returns the child's exit code
    fn run_elevated(&self, script: &Path) -> impl Future<Output = Result<i32>> + Send;
}

/// Locate the provisioning script at the workspace root
pub fn find_script(workspace: &Path) -> Result<PathBuf> {
    let script = workspace.join(SCRIPT_ENTRY);
    if script.is_file() {
        Ok(script)
    } else {
        Err(InstallError::ScriptMissing(script))
    }
}

/// Find and run the provisioning script.
///
/// A nonzero exit code is reported as `ElevationFailed`.
pub async fn run_provisioning<E: Elevator>(elevator: &E, workspace: &Path) -> Result<()> {
    let script = find_script(workspace)?;
    tracing::info!("Launching installation script {:?}", script);

    let code = elevator.run_elevated(&script).await?;
    if code != 0 {
        return Err(InstallError::ElevationFailed(format!(
            "{} exited with code {}",
            SCRIPT_ENTRY, code
        )));
    }

    tracing::info!("Installation script finished");
    Ok(())
}

/// The platform's elevation mechanism
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemElevator;

#[cfg(unix)]
impl Elevator for SystemElevator {
    async fn run_elevated(&self, script: &Path) -> Result<i32> {
        let via_pkexec = !is_root();
        let mut command = if via_pkexec {
            let mut command = tokio::process::Command::new("pkexec");
            command.arg("/bin/sh");
            command
        } else {
            tokio::process::Command::new("/bin/sh")
        };

        let status = command
            .arg(script)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .map_err(|e| {
                if via_pkexec && e.kind() == std::io::ErrorKind::NotFound {
                    InstallError::ElevationFailed("pkexec is not installed".to_string())
                } else {
                    InstallError::ElevationFailed(format!("failed to start script: {}", e))
                }
            })?;

        match status.code() {
            Some(PKEXEC_DISMISSED) | Some(PKEXEC_NOT_AUTHORIZED) if via_pkexec => Err(
                InstallError::ElevationDenied("administrator authorization was not granted".into()),
            ),
            Some(code) => Ok(code),
            None => Err(InstallError::ElevationFailed(
                "script was terminated by a signal".to_string(),
            )),
        }
    }
}

#[cfg(windows)]
impl Elevator for SystemElevator {
    async fn run_elevated(&self, script: &Path) -> Result<i32> {
        let script = script.to_path_buf();
        tokio::task::spawn_blocking(move || shell::run_as_admin_hidden(&script))
            .await
            .map_err(|e| InstallError::ElevationFailed(format!("launcher task failed: {}", e)))?
    }
}

#[cfg(windows)]
mod shell {
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;
    use std::path::Path;
    use watchsec_common::{InstallError, Result};
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{CloseHandle, ERROR_CANCELLED};
    use windows::Win32::System::Threading::{GetExitCodeProcess, WaitForSingleObject, INFINITE};
    use windows::Win32::UI::Shell::{ShellExecuteExW, SEE_MASK_NOCLOSEPROCESS, SHELLEXECUTEINFOW};
    use windows::Win32::UI::WindowsAndMessaging::SW_HIDE;

    fn wide(value: &OsStr) -> Vec<u16> {
        value.encode_wide().chain(std::iter::once(0)).collect()
    }

    pub fn run_as_admin_hidden(script: &Path) -> Result<i32> {
        let parameters = format!(
            "-NoProfile -ExecutionPolicy Bypass -File \"{}\"",
            script.display()
        );
        let file_w = wide(OsStr::new("powershell.exe"));
        let verb_w = wide(OsStr::new("runas"));
        let params_w = wide(OsStr::new(&parameters));

        unsafe {
            let mut sei = SHELLEXECUTEINFOW::default();
            sei.cbSize = std::mem::size_of::<SHELLEXECUTEINFOW>() as u32;
            sei.fMask = SEE_MASK_NOCLOSEPROCESS;
            sei.lpVerb = PCWSTR(verb_w.as_ptr());
            sei.lpFile = PCWSTR(file_w.as_ptr());
            sei.lpParameters = PCWSTR(params_w.as_ptr());
            sei.nShow = SW_HIDE.0 as i32;

            if let Err(err) = ShellExecuteExW(&mut sei) {
                if err.code() == ERROR_CANCELLED.to_hresult() {
                    return Err(InstallError::ElevationDenied("User cancelled UAC prompt.".into()));
                }
                return Err(InstallError::ElevationFailed(format!("ShellExecuteExW failed: {}", err)));
            }

            let process = sei.hProcess;
            if process.is_invalid() {
                return Err(InstallError::ElevationFailed(
                    "ShellExecuteExW returned no process handle".into(),
                ));
            }

            let wait = WaitForSingleObject(process, INFINITE);
            let mut code: u32 = 1;
            let exit = GetExitCodeProcess(process, &mut code);
            let _ = CloseHandle(process);

            if wait.0 != 0 {
                return Err(InstallError::ElevationFailed(format!(
                    "WaitForSingleObject failed: {}",
                    wait.0
                )));
            }
            exit.map_err(|e| InstallError::ElevationFailed(format!("GetExitCodeProcess failed: {}", e)))?;
            Ok(code as i32)
        }
    }
}

/// Check if we're running with root privileges
#[cfg(unix)]
pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() == 0 }
}

//! VM lifecycle management
//!
//! Spawning the Firecracker process in interactive or detached mode and
//! waiting for its API socket.

use std::fs::{self, File};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::sys::termios::{self, SetArg, Termios};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::handle::VmProcess;
use crate::config::ConsoleMode;
use crate::error::{Error, Result};
use crate::retry::{poll_until, PollPolicy};

/// Starts Firecracker processes
#[derive(Debug, Clone)]
pub struct VmSupervisor {
    firecracker_bin: PathBuf,
    console_log: PathBuf,
}

impl VmSupervisor {
    /// # Arguments
    /// * `firecracker_bin` - Hypervisor executable
    /// * `console_log` - Where detached VMs write their serial console
    pub fn new(firecracker_bin: impl Into<PathBuf>, console_log: impl Into<PathBuf>) -> Self {
        Self {
            firecracker_bin: firecracker_bin.into(),
            console_log: console_log.into(),
        }
    }

    /// Spawn the hypervisor for `config_path` with its API on `socket_path`
    ///
    /// Any socket left over from a previous run is removed first. In
    /// interactive mode the process shares this terminal; in detached mode
    /// its output is appended to the console log. Either way the call returns
    /// as soon as the process is running.
    pub fn start(
        &self,
        config_path: &Path,
        socket_path: &Path,
        mode: ConsoleMode,
    ) -> Result<VmProcess> {
        remove_stale_socket(socket_path)?;

        let mut cmd = Command::new(&self.firecracker_bin);
        cmd.arg("--api-sock")
            .arg(socket_path)
            .arg("--config-file")
            .arg(config_path);

        match mode {
            ConsoleMode::Interactive => {
                cmd.stdin(Stdio::inherit())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit());
            }
            ConsoleMode::Detached => {
                if let Some(parent) = self.console_log.parent() {
                    fs::create_dir_all(parent)?;
                }
                let log = File::options().create(true).append(true).open(&self.console_log)?;
                cmd.stdin(Stdio::null())
                    .stdout(log.try_clone()?)
                    .stderr(log);
            }
        }

        let child = cmd.spawn().map_err(|e| {
            Error::Vm(format!("failed to start {}: {}", self.firecracker_bin.display(), e))
        })?;
        let process = VmProcess::new(child, socket_path.to_path_buf(), mode)?;

        info!(
            pid = process.pid(),
            %mode,
            config = %config_path.display(),
            "🚀 VM process started"
        );
        Ok(process)
    }
}

/// Remove a socket file left by a previous run
pub fn remove_stale_socket(socket_path: &Path) -> Result<()> {
    match fs::remove_file(socket_path) {
        Ok(()) => {
            debug!(socket = %socket_path.display(), "removed stale control socket");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Wait for the Firecracker API socket to become available
///
/// # Arguments
/// * `socket_path` - Path to the API socket
/// * `policy` - Poll interval and attempt limit
pub async fn wait_for_api_socket(socket_path: &Path, policy: PollPolicy) -> Result<()> {
    poll_until(policy, || socket_path.exists())
        .await
        .map(|_| ())
        .map_err(|_| {
            Error::Vm(format!(
                "API socket {} not ready after {:?}",
                socket_path.display(),
                policy.max_wait()
            ))
        })
}

/// Default wait for the API socket: 50 checks, 100ms apart
pub const API_SOCKET_POLICY: PollPolicy = PollPolicy::new(50, Duration::from_millis(100));

/// Saves stdin's terminal settings and restores them on drop
///
/// Firecracker switches the terminal to raw mode for the serial console and
/// does not always put it back when it dies.
pub struct TerminalGuard {
    saved: Option<Termios>,
}

impl TerminalGuard {
    pub fn capture() -> Self {
        let stdin = std::io::stdin();
        if !stdin.is_terminal() {
            return Self { saved: None };
        }
        match termios::tcgetattr(&stdin) {
            Ok(saved) => Self { saved: Some(saved) },
            Err(e) => {
                debug!(error = %e, "could not read terminal attributes");
                Self { saved: None }
            }
        }
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            if let Err(e) = termios::tcsetattr(&std::io::stdin(), SetArg::TCSANOW, &saved) {
                warn!(error = %e, "failed to restore terminal settings");
            }
        }
    }
}

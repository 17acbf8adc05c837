//! VM process handle
//!
//! A [`VmProcess`] owns one running Firecracker process together with the
//! paths it was started with.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use tokio::process::Child;
use tracing::{info, warn};

use super::FirecrackerClient;
use crate::config::ConsoleMode;
use crate::error::{Error, Result};

/// Status of the supervised VM process
#[derive(Debug, Clone, PartialEq)]
pub enum VmStatus {
    /// Process spawned, guest booting
    Running,
    /// Process exited with the given code (`None` if killed by a signal)
    Exited(Option<i32>),
}

/// A running Firecracker process
pub struct VmProcess {
    child: Child,
    pid: u32,
    /// Path to Firecracker API socket
    pub api_socket: PathBuf,
    /// How the console is wired
    pub mode: ConsoleMode,
    pub status: VmStatus,
    started_at: Instant,
}

impl VmProcess {
    pub(crate) fn new(child: Child, api_socket: PathBuf, mode: ConsoleMode) -> Result<Self> {
        let pid = child
            .id()
            .ok_or_else(|| Error::Vm("VM process exited before its pid was read".into()))?;
        Ok(Self {
            child,
            pid,
            api_socket,
            mode,
            status: VmStatus::Running,
            started_at: Instant::now(),
        })
    }

    /// OS process id of the hypervisor
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Time since the process was spawned
    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// API client bound to this VM's control socket
    pub fn api(&self) -> FirecrackerClient {
        FirecrackerClient::new(self.api_socket.to_string_lossy())
    }

    /// Block until the process exits and return its exit code
    pub async fn wait_for_exit(&mut self) -> Result<Option<i32>> {
        let status: ExitStatus = self.child.wait().await?;
        let code = status.code();
        self.status = VmStatus::Exited(code);
        info!(pid = self.pid, ?code, uptime = ?self.age(), "VM process exited");
        Ok(code)
    }

    /// Non-blocking exit check
    pub fn try_exit(&mut self) -> Result<Option<Option<i32>>> {
        match self.child.try_wait()? {
            Some(status) => {
                self.status = VmStatus::Exited(status.code());
                Ok(Some(status.code()))
            }
            None => Ok(None),
        }
    }

    /// Graceful shutdown: Ctrl-Alt-Del through the API, then kill after `grace`
    pub async fn shutdown(&mut self, grace: Duration) -> Result<Option<i32>> {
        if let VmStatus::Exited(code) = self.status {
            return Ok(code);
        }

        match self.api().send_ctrl_alt_del().await {
            Ok(()) => {
                if let Ok(result) = tokio::time::timeout(grace, self.child.wait()).await {
                    let code = result?.code();
                    self.status = VmStatus::Exited(code);
                    info!(pid = self.pid, "VM shut down gracefully");
                    return Ok(code);
                }
                warn!(pid = self.pid, ?grace, "VM did not stop in time; killing");
            }
            Err(e) => warn!(
                pid = self.pid,
                error = %e,
                "graceful shutdown request failed; killing"
            ),
        }

        if let Err(e) = self.child.start_kill() {
            // Process might already be dead
            warn!(pid = self.pid, error = %e, "failed to kill VM process");
        }
        self.wait_for_exit().await
    }
}

impl std::fmt::Debug for VmProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmProcess")
            .field("pid", &self.pid)
            .field("api_socket", &self.api_socket)
            .field("mode", &self.mode)
            .field("status", &self.status)
            .field("age", &self.age())
            .finish()
    }
}

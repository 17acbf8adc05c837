//! Run teardown
//!
//! The [`CleanupGuard`] is created before the first side effect and runs
//! exactly once: explicitly at the end of a run, or from `Drop` when the run
//! unwinds through an error or panic. Every step is best-effort.

use std::path::PathBuf;

use tracing::{info, warn};

use crate::exec::CommandRunner;
use crate::network::NetworkProvisioner;
use crate::vm::remove_stale_socket;
use crate::workspace::{FilesystemTool, ReconcileOutcome, WorkspaceManager};

/// What teardown managed to do
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupReport {
    /// `None` when no workspace image was registered
    pub workspace: Option<Result<ReconcileOutcome, String>>,
    pub tap_removed: bool,
    pub socket_removed: bool,
}

/// Owns the host resources of one run and releases them once
pub struct CleanupGuard<'a> {
    runner: &'a dyn CommandRunner,
    fs_tool: &'a dyn FilesystemTool,
    guest_uid: u32,
    guest_gid: u32,
    tap_device: Option<String>,
    control_socket: Option<PathBuf>,
    workspace: Option<(PathBuf, PathBuf)>,
    report: Option<CleanupReport>,
}

impl<'a> CleanupGuard<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        fs_tool: &'a dyn FilesystemTool,
        guest_uid: u32,
        guest_gid: u32,
    ) -> Self {
        Self {
            runner,
            fs_tool,
            guest_uid,
            guest_gid,
            tap_device: None,
            control_socket: None,
            workspace: None,
            report: None,
        }
    }

    /// Remove this TAP device on teardown
    pub fn track_tap(&mut self, tap: impl Into<String>) {
        self.tap_device = Some(tap.into());
    }

    /// Remove this control socket on teardown
    pub fn track_socket(&mut self, socket: impl Into<PathBuf>) {
        self.control_socket = Some(socket.into());
    }

    /// Sync `image` back onto `target_dir` on teardown
    pub fn track_workspace(&mut self, image: impl Into<PathBuf>, target_dir: impl Into<PathBuf>) {
        self.workspace = Some((image.into(), target_dir.into()));
    }

    pub fn has_run(&self) -> bool {
        self.report.is_some()
    }

    /// Run teardown; later calls return the first report without acting
    pub fn run(&mut self) -> CleanupReport {
        if let Some(report) = &self.report {
            return report.clone();
        }

        let mut report = CleanupReport::default();

        if let Some((image, target)) = &self.workspace {
            let manager = WorkspaceManager::new(self.fs_tool, self.guest_uid, self.guest_gid);
            let outcome = manager.reconcile(image, target).map_err(|e| e.to_string());
            match &outcome {
                Ok(ReconcileOutcome::Skipped(reason)) => info!(%reason, "workspace sync skipped"),
                Ok(ReconcileOutcome::Synced) => {}
                Err(e) => warn!(error = %e, "workspace sync failed"),
            }
            report.workspace = Some(outcome);
        }

        if let Some(tap) = &self.tap_device {
            report.tap_removed = NetworkProvisioner::new(self.runner).teardown(tap);
        }

        if let Some(socket) = &self.control_socket {
            let existed = socket.exists();
            match remove_stale_socket(socket) {
                Ok(()) => report.socket_removed = existed,
                Err(e) => warn!(
                    socket = %socket.display(),
                    error = %e,
                    "failed to remove control socket"
                ),
            }
        }

        info!(
            tap_removed = report.tap_removed,
            socket_removed = report.socket_removed,
            "cleanup complete"
        );
        self.report = Some(report.clone());
        report
    }
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        if !self.has_run() {
            self.run();
        }
    }
}

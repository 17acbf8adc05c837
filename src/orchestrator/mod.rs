//! Lifecycle orchestrator
//!
//! Sequences one run of the VM:
//!
//! ```text
//! idle → prerequisites_validated → network_ready → workspace_ready
//!      → config_rendered → vm_running → (vm_exited | vm_detached_running)
//!      → cleanup_complete
//! ```
//!
//! Phases run strictly one after another. A [`CleanupGuard`] is armed before
//! the first side effect, so every exit path (error, panic, signal) ends in
//! `cleanup_complete`.

pub mod cleanup;
pub mod preflight;
pub mod signals;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{ConsoleMode, RunConfig};
use crate::error::{Error, Result};
use crate::exec::CommandRunner;
use crate::network::{NetworkProvisioner, NetworkReport, TUN_DEVICE};
use crate::vm::{self, RenderParams, TerminalGuard, VmProcess, VmSupervisor, API_SOCKET_POLICY};
use crate::workspace::{FilesystemTool, WorkspaceImage, WorkspaceManager};

pub use cleanup::{CleanupGuard, CleanupReport};
pub use signals::ShutdownSignals;

/// How long a guest gets to shut down after a stop signal
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Orchestrator state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    PrerequisitesValidated,
    NetworkReady,
    WorkspaceReady,
    ConfigRendered,
    VmRunning,
    VmExited,
    VmDetachedRunning,
    CleanupComplete,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::PrerequisitesValidated => "prerequisites_validated",
            Phase::NetworkReady => "network_ready",
            Phase::WorkspaceReady => "workspace_ready",
            Phase::ConfigRendered => "config_rendered",
            Phase::VmRunning => "vm_running",
            Phase::VmExited => "vm_exited",
            Phase::VmDetachedRunning => "vm_detached_running",
            Phase::CleanupComplete => "cleanup_complete",
        };
        f.write_str(s)
    }
}

/// Everything produced by the phases before launch
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub network: NetworkReport,
    pub workspace: WorkspaceImage,
    pub config_path: PathBuf,
}

/// Outcome of a complete run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// VM exit code (`None` if it was killed by a signal)
    pub vm_exit_code: Option<i32>,
    pub cleanup: CleanupReport,
    /// Phases visited, in order
    pub phases: Vec<Phase>,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        self.vm_exit_code.unwrap_or(1)
    }
}

/// Drives one run against a host
pub struct Orchestrator<'a> {
    config: RunConfig,
    runner: &'a dyn CommandRunner,
    fs_tool: &'a dyn FilesystemTool,
    tun_device: PathBuf,
    phases: Vec<Phase>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: RunConfig,
        runner: &'a dyn CommandRunner,
        fs_tool: &'a dyn FilesystemTool,
    ) -> Self {
        Self {
            config,
            runner,
            fs_tool,
            tun_device: PathBuf::from(TUN_DEVICE),
            phases: vec![Phase::Idle],
        }
    }

    /// Use a different TUN clone device path
    pub fn with_tun_device(mut self, path: impl Into<PathBuf>) -> Self {
        self.tun_device = path.into();
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phases.last().copied().unwrap_or(Phase::Idle)
    }

    /// Phases visited so far
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    fn enter(&mut self, next: Phase) {
        debug!(from = %self.phase(), to = %next, "phase transition");
        self.phases.push(next);
    }

    fn new_cleanup(&self) -> CleanupGuard<'a> {
        let mut cleanup = CleanupGuard::new(
            self.runner,
            self.fs_tool,
            self.config.guest_uid,
            self.config.guest_gid,
        );
        cleanup.track_tap(self.config.network.tap_device.clone());
        cleanup.track_socket(self.config.paths.control_socket_path.clone());
        cleanup
    }

    /// Run every phase up to (not including) the VM launch
    ///
    /// Host resources are registered with `cleanup` up front. A stop signal
    /// received during a phase is acted on at the next phase boundary.
    pub async fn prepare(
        &mut self,
        cleanup: &mut CleanupGuard<'a>,
        signals: &mut ShutdownSignals,
    ) -> Result<PreparedRun> {
        let cfg = self.config.clone();

        preflight::ensure_directories(&cfg)?;
        preflight::validate(&cfg)?;
        self.enter(Phase::PrerequisitesValidated);
        signals.checkpoint().await?;

        let network = NetworkProvisioner::new(self.runner)
            .with_tun_device(self.tun_device.clone())
            .provision(&cfg.network)?;
        self.enter(Phase::NetworkReady);
        signals.checkpoint().await?;

        let workspace = WorkspaceManager::new(self.fs_tool, cfg.guest_uid, cfg.guest_gid)
            .materialize(
                &cfg.paths.workspace_dir,
                &cfg.paths.workspace_image_path,
                cfg.profile.workspace_size_mb,
            )?;
        cleanup.track_workspace(&workspace.path, &cfg.paths.workspace_dir);
        self.enter(Phase::WorkspaceReady);
        signals.checkpoint().await?;

        preflight::prepare_vm_log(&cfg.paths.vm_log_path)?;
        vm::write_config(
            &cfg.paths.rendered_config_path,
            cfg.config_template.as_deref(),
            &RenderParams::from_run_config(&cfg),
        )?;
        self.enter(Phase::ConfigRendered);
        signals.checkpoint().await?;

        Ok(PreparedRun {
            network,
            workspace,
            config_path: cfg.paths.rendered_config_path.clone(),
        })
    }

    /// Prepare, launch, supervise and clean up
    ///
    /// Errors from any phase are returned after cleanup has run. Stop
    /// signals are caught from the first step on, so an interrupted run
    /// still ends in `cleanup_complete`.
    pub async fn run(mut self) -> Result<RunOutcome> {
        let mut signals = ShutdownSignals::install();
        let mut cleanup = self.new_cleanup();

        let result = self.run_phases(&mut cleanup, &mut signals).await;
        if let Err(Error::Interrupted(signal)) = &result {
            warn!(signal = *signal, phase = %self.phase(), "stop requested before launch");
        }

        let report = cleanup.run();
        self.enter(Phase::CleanupComplete);

        let vm_exit_code = result?;
        Ok(RunOutcome {
            vm_exit_code,
            cleanup: report,
            phases: self.phases,
        })
    }

    async fn run_phases(
        &mut self,
        cleanup: &mut CleanupGuard<'a>,
        signals: &mut ShutdownSignals,
    ) -> Result<Option<i32>> {
        let prepared = self.prepare(cleanup, signals).await?;
        let cfg = &self.config;
        let mode = cfg.profile.console_mode;

        info!(
            vcpus = cfg.profile.vcpu_count,
            memory_mb = cfg.profile.memory_mb,
            workspace_mb = prepared.workspace.size_mb,
            nat = prepared.network.nat_path(),
            %mode,
            "launching VM"
        );

        let supervisor = VmSupervisor::new(&cfg.firecracker_bin, &cfg.paths.console_log_path);
        let socket = cfg.paths.control_socket_path.clone();

        let _terminal = (mode == ConsoleMode::Interactive).then(TerminalGuard::capture);
        let mut process = supervisor.start(&prepared.config_path, &socket, mode)?;
        self.enter(Phase::VmRunning);

        if mode == ConsoleMode::Detached {
            tokio::select! {
                _ = self.announce_detached(&process) => {}
                sig = signals.recv() => {
                    info!(
                        signal = sig,
                        pid = process.pid(),
                        "stop requested during boot"
                    );
                    let code = process.shutdown(SHUTDOWN_GRACE).await?;
                    self.enter(Phase::VmExited);
                    return Ok(code);
                }
            }
            self.enter(Phase::VmDetachedRunning);
        }

        let code = supervise(&mut process, signals).await?;
        self.enter(Phase::VmExited);
        Ok(code)
    }

    async fn announce_detached(&self, process: &VmProcess) {
        let cfg = &self.config;
        tokio::time::sleep(Duration::from_secs(cfg.boot_wait_secs)).await;

        match vm::wait_for_api_socket(&process.api_socket, API_SOCKET_POLICY).await {
            Ok(()) => match process.api().describe_instance().await {
                Ok(instance) => info!(
                    state = %instance.state,
                    vmm = %instance.vmm_version,
                    "VM instance reported"
                ),
                Err(e) => debug!(error = %e, "instance query failed"),
            },
            Err(e) => warn!(error = %e, "control socket did not appear"),
        }

        println!("VM running in background (pid {})", process.pid());
        println!("  console log: {}", cfg.paths.console_log_path.display());
        println!("  guest address: {}", cfg.network.vm_address);
        println!("  stop with: kill {}", std::process::id());
    }
}

/// Wait for the VM to exit, stopping it gracefully on SIGINT/SIGTERM/SIGHUP
async fn supervise(process: &mut VmProcess, signals: &mut ShutdownSignals) -> Result<Option<i32>> {
    let received = tokio::select! {
        code = process.wait_for_exit() => return code,
        sig = signals.recv() => sig,
    };
    info!(signal = received, pid = process.pid(), "stop requested");
    process.shutdown(SHUTDOWN_GRACE).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_names() {
        assert_eq!(
            Phase::PrerequisitesValidated.to_string(),
            "prerequisites_validated"
        );
        assert_eq!(Phase::VmDetachedRunning.to_string(), "vm_detached_running");
        assert_eq!(Phase::CleanupComplete.to_string(), "cleanup_complete");
    }

    #[test]
    fn test_signal_exit_maps_to_failure() {
        let outcome = RunOutcome {
            vm_exit_code: None,
            cleanup: CleanupReport::default(),
            phases: vec![],
        };
        assert_eq!(outcome.exit_code(), 1);
    }
}

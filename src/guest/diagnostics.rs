//! Engine failure diagnostics
//!
//! Collected once, when the engine never answers within the readiness window.

use std::fmt;
use std::path::Path;

use crate::exec::CommandRunner;
use crate::guest::engine::{tail_lines, TierFailure};

/// Snapshot of everything useful for debugging a dead engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticBundle {
    pub socket_path: String,
    pub socket_exists: bool,
    pub containerd_status: String,
    pub docker_status: String,
    pub tier_failures: Vec<TierFailure>,
    pub daemon_log: Vec<String>,
    pub journal: Vec<String>,
}

fn unit_status(runner: &dyn CommandRunner, unit: &str) -> String {
    match runner.run("systemctl", &["is-active", unit]) {
        Ok(out) => {
            let status = out.stdout.trim();
            if status.is_empty() {
                "unknown".to_string()
            } else {
                status.to_string()
            }
        }
        Err(e) => format!("unavailable ({})", e),
    }
}

impl DiagnosticBundle {
    pub fn collect(
        runner: &dyn CommandRunner,
        socket: &Path,
        daemon_log: &Path,
        tier_failures: Vec<TierFailure>,
        lines: usize,
    ) -> Self {
        let n = lines.to_string();
        let journal = match runner.run("journalctl", &["-u", "docker", "-n", &n, "--no-pager"]) {
            Ok(out) if out.success() => out.stdout.lines().map(str::to_string).collect(),
            Ok(out) => vec![format!("journalctl failed: {}", out.stderr.trim())],
            Err(e) => vec![format!("journalctl unavailable: {}", e)],
        };

        Self {
            socket_path: socket.display().to_string(),
            socket_exists: socket.exists(),
            containerd_status: unit_status(runner, "containerd"),
            docker_status: unit_status(runner, "docker"),
            tier_failures,
            daemon_log: tail_lines(daemon_log, lines),
            journal,
        }
    }
}

impl fmt::Display for DiagnosticBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== container engine diagnostics ===")?;
        writeln!(
            f,
            "socket {}: {}",
            self.socket_path,
            if self.socket_exists { "present" } else { "missing" }
        )?;
        writeln!(f, "containerd service: {}", self.containerd_status)?;
        writeln!(f, "docker service: {}", self.docker_status)?;

        if !self.tier_failures.is_empty() {
            writeln!(f, "start attempts:")?;
            for failure in &self.tier_failures {
                writeln!(f, "  - {}", failure)?;
                for line in &failure.log_tail {
                    writeln!(f, "      | {}", line)?;
                }
            }
        }

        writeln!(f, "--- daemon log ---")?;
        if self.daemon_log.is_empty() {
            writeln!(f, "(empty)")?;
        }
        for line in &self.daemon_log {
            writeln!(f, "{}", line)?;
        }

        writeln!(f, "--- docker journal ---")?;
        for line in &self.journal {
            writeln!(f, "{}", line)?;
        }
        write!(f, "====================================")
    }
}

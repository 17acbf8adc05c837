//! Control-group hierarchy setup
//!
//! Prefers the unified (v2) hierarchy. When it cannot be mounted, falls back
//! to a tmpfs with one v1 hierarchy per controller, each mounted independently.

use std::fs;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::exec::{display_command, CommandRunner};
use crate::workspace::sync::is_non_empty_dir;

/// Controllers mounted individually in the legacy layout
pub const LEGACY_CONTROLLERS: &[&str] = &[
    "cpuset", "cpu", "cpuacct", "blkio", "memory", "devices", "freezer", "net_cls", "pids",
];

/// Resulting cgroup layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CgroupMode {
    /// Unified hierarchy was already mounted
    UnifiedPresent,
    /// Unified hierarchy mounted by us
    UnifiedMounted,
    /// Per-controller v1 hierarchies
    Legacy { mounted: Vec<String>, failed: Vec<String> },
}

impl CgroupMode {
    pub fn is_unified(&self) -> bool {
        matches!(self, CgroupMode::UnifiedPresent | CgroupMode::UnifiedMounted)
    }
}

fn mount(runner: &dyn CommandRunner, args: &[&str]) -> bool {
    match runner.run("mount", args) {
        Ok(out) if out.success() => true,
        Ok(out) => {
            debug!(
                command = %display_command("mount", args),
                stderr = %out.stderr.trim(),
                "mount failed"
            );
            false
        }
        Err(e) => {
            debug!(error = %e, "mount could not be spawned");
            false
        }
    }
}

/// Make sure a cgroup hierarchy is available under `root`
pub fn setup(runner: &dyn CommandRunner, root: &Path) -> CgroupMode {
    if root.join("cgroup.controllers").exists() {
        info!(root = %root.display(), "unified cgroup hierarchy present");
        return CgroupMode::UnifiedPresent;
    }

    if let Err(e) = fs::create_dir_all(root) {
        warn!(root = %root.display(), error = %e, "cannot create cgroup root");
    }
    let root_str = root.to_string_lossy();

    if mount(runner, &["-t", "cgroup2", "cgroup2", &root_str]) {
        info!(root = %root_str, "mounted unified cgroup hierarchy");
        return CgroupMode::UnifiedMounted;
    }

    warn!("unified cgroup hierarchy unavailable; falling back to per-controller hierarchies");
    if !is_non_empty_dir(root)
        && !mount(
            runner,
            &["-t", "tmpfs", "-o", "mode=755", "cgroup", &root_str],
        )
    {
        warn!(root = %root_str, "tmpfs for cgroup root not mounted");
    }

    let mut mounted = Vec::new();
    let mut failed = Vec::new();
    for &controller in LEGACY_CONTROLLERS {
        let dir = root.join(controller);
        let dir_str = dir.to_string_lossy();
        if is_non_empty_dir(&dir) {
            mounted.push(controller.to_string());
            continue;
        }
        let ok = fs::create_dir_all(&dir).is_ok()
            && mount(
                runner,
                &["-t", "cgroup", "-o", controller, "cgroup", &dir_str],
            );
        if ok {
            mounted.push(controller.to_string());
        } else {
            failed.push(controller.to_string());
        }
    }

    if failed.is_empty() {
        info!(
            controllers = mounted.len(),
            "legacy cgroup hierarchies mounted"
        );
    } else {
        warn!(failed = ?failed, "some cgroup controllers could not be mounted");
    }
    CgroupMode::Legacy { mounted, failed }
}

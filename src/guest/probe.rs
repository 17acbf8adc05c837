//! Kernel feature probe
//!
//! Only reports; a missing feature is logged as a warning and the sequence
//! continues.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use tracing::{info, warn};

use crate::exec::{run_succeeds, CommandRunner};

/// Kernel facilities the container engine relies on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelFeatures {
    pub cgroup_v1: bool,
    pub cgroup_v2: bool,
    pub pid_namespace: bool,
    pub net_namespace: bool,
    pub overlay: bool,
}

impl KernelFeatures {
    /// Names of the missing features
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.cgroup_v1 && !self.cgroup_v2 {
            missing.push("cgroups");
        }
        if !self.pid_namespace {
            missing.push("pid namespace");
        }
        if !self.net_namespace {
            missing.push("network namespace");
        }
        if !self.overlay {
            missing.push("overlay filesystem");
        }
        missing
    }
}

/// Filesystem types listed in `/proc/filesystems`
///
/// Each line is an optional `nodev` flag followed by the type name.
pub fn parse_filesystems(contents: &str) -> HashSet<String> {
    contents
        .lines()
        .filter_map(|line| line.split_whitespace().last())
        .filter(|name| *name != "nodev")
        .map(str::to_string)
        .collect()
}

fn read_filesystems(path: &Path) -> HashSet<String> {
    match fs::read_to_string(path) {
        Ok(contents) => parse_filesystems(&contents),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read filesystem list");
            HashSet::new()
        }
    }
}

/// Probe cgroup, namespace and overlay support
///
/// Tries `modprobe overlay` once if overlay is not listed yet.
pub fn probe(runner: &dyn CommandRunner, proc_filesystems: &Path, ns_dir: &Path) -> KernelFeatures {
    let mut filesystems = read_filesystems(proc_filesystems);

    if !filesystems.contains("overlay") && run_succeeds(runner, "modprobe", &["overlay"]) {
        filesystems = read_filesystems(proc_filesystems);
    }

    let features = KernelFeatures {
        cgroup_v1: filesystems.contains("cgroup"),
        cgroup_v2: filesystems.contains("cgroup2"),
        pid_namespace: ns_dir.join("pid").exists(),
        net_namespace: ns_dir.join("net").exists(),
        overlay: filesystems.contains("overlay"),
    };

    let missing = features.missing();
    if missing.is_empty() {
        info!("kernel features present");
    } else {
        for feature in missing {
            warn!(feature, "kernel feature missing");
        }
    }
    features
}

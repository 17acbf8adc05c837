//! Guest bootstrap sequencer
//!
//! Runs once inside the VM after boot and tries to leave behind a usable
//! container engine:
//!
//! ```text
//! network wait → DNS → kernel probe → cgroups → daemon config
//!     → engine start (containerd unit → docker unit → direct dockerd)
//!     → readiness wait (diagnostics on failure) → finalize → banner
//! ```
//!
//! Only the network wait can hold the sequence up for long, and even it gives
//! up with a warning. Every later step tolerates failure.

pub mod cgroups;
pub mod diagnostics;
pub mod engine;
pub mod network;
pub mod probe;
pub mod sequencer;

use std::path::PathBuf;

use crate::retry::PollPolicy;

pub use cgroups::CgroupMode;
pub use diagnostics::DiagnosticBundle;
pub use engine::{EngineState, StartTier, StorageDriver, TierFailure};
pub use network::DnsMode;
pub use probe::KernelFeatures;
pub use sequencer::{BootstrapReport, GuestBootstrap};

/// Filesystem locations the sequencer reads and writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestLayout {
    pub resolv_conf: PathBuf,
    pub resolved_stub: PathBuf,
    pub proc_filesystems: PathBuf,
    pub proc_ns_dir: PathBuf,
    pub cgroup_root: PathBuf,
    pub daemon_config: PathBuf,
    pub engine_socket: PathBuf,
    pub engine_log: PathBuf,
    pub workspace_dir: PathBuf,
    pub home_root: PathBuf,
}

impl Default for GuestLayout {
    fn default() -> Self {
        Self {
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
            resolved_stub: PathBuf::from("/run/systemd/resolve/stub-resolv.conf"),
            proc_filesystems: PathBuf::from("/proc/filesystems"),
            proc_ns_dir: PathBuf::from("/proc/self/ns"),
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            daemon_config: PathBuf::from("/etc/docker/daemon.json"),
            engine_socket: PathBuf::from("/var/run/docker.sock"),
            engine_log: PathBuf::from("/var/log/dockerd.log"),
            workspace_dir: PathBuf::from("/workspace"),
            home_root: PathBuf::from("/home"),
        }
    }
}

/// Tunables for one bootstrap run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestOptions {
    /// Primary network interface
    pub interface: String,
    /// Unprivileged account that owns the workspace
    pub user: String,
    pub uid: u32,
    pub gid: u32,
    pub nameservers: Vec<String>,
    pub network_wait: PollPolicy,
    pub socket_wait: PollPolicy,
    pub readiness_wait: PollPolicy,
    /// Lines of engine log and journal included in diagnostics
    pub diagnostic_lines: usize,
}

impl Default for GuestOptions {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
            user: "dev".to_string(),
            uid: 1000,
            gid: 1000,
            nameservers: vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()],
            network_wait: PollPolicy::seconds(30),
            socket_wait: PollPolicy::seconds(30),
            readiness_wait: PollPolicy::seconds(30),
            diagnostic_lines: 20,
        }
    }
}

impl GuestOptions {
    /// Home directory of the unprivileged user
    pub fn home_dir(&self, layout: &GuestLayout) -> PathBuf {
        layout.home_root.join(&self.user)
    }
}

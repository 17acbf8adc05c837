//! Run configuration
//!
//! Settings come from CLI flags or `FCNEST_*` environment variables and are
//! resolved once into an immutable [`RunConfig`] before the orchestrator
//! touches the host.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Largest workspace image accepted (16 TiB, the ext4 file size limit)
pub const MAX_WORKSPACE_SIZE_MB: u64 = 16 * 1024 * 1024;

/// Hypervisor log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    #[value(alias = "warn")]
    Warning,
    Info,
    Debug,
}

impl LogLevel {
    /// Equivalent `tracing` filter directive
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warning => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Error => "Error",
            LogLevel::Warning => "Warning",
            LogLevel::Info => "Info",
            LogLevel::Debug => "Debug",
        };
        f.write_str(s)
    }
}

/// How the VM console is wired to the invoking terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ConsoleMode {
    /// Serial console attached to this terminal; blocks until the VM exits
    Interactive,
    /// Output goes to a log file; the VM runs in the background
    Detached,
}

impl fmt::Display for ConsoleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsoleMode::Interactive => f.write_str("interactive"),
            ConsoleMode::Detached => f.write_str("detached"),
        }
    }
}

/// CLI/environment settings before validation
#[derive(Debug, Clone, Args)]
pub struct Settings {
    /// Number of vCPUs
    #[arg(
        long,
        global = true,
        env = "FCNEST_VCPUS",
        default_value_t = 2,
        value_parser = clap::value_parser!(u32).range(1..),
    )]
    pub vcpus: u32,

    /// Guest memory in MiB
    #[arg(
        long,
        global = true,
        env = "FCNEST_MEMORY_MB",
        default_value_t = 2048,
        value_parser = clap::value_parser!(u32).range(1..),
    )]
    pub memory_mb: u32,

    /// Minimum workspace image size in MiB
    #[arg(
        long,
        global = true,
        env = "FCNEST_WORKSPACE_SIZE_MB",
        default_value_t = 1024,
        value_parser = clap::value_parser!(u64).range(1..=MAX_WORKSPACE_SIZE_MB),
    )]
    pub workspace_size_mb: u64,

    /// Guest kernel image
    #[arg(long, global = true, env = "FCNEST_KERNEL", default_value = "images/vmlinux")]
    pub kernel: PathBuf,

    /// Guest root filesystem image
    #[arg(long, global = true, env = "FCNEST_ROOTFS", default_value = "images/rootfs.ext4")]
    pub rootfs: PathBuf,

    /// Host directory exposed to the guest as its workspace
    #[arg(long, global = true, env = "FCNEST_WORKSPACE", default_value = "workspace")]
    pub workspace: PathBuf,

    /// Directory for the control socket, rendered config, workspace image and logs
    #[arg(long, global = true, env = "FCNEST_RUN_DIR", default_value = "run")]
    pub run_dir: PathBuf,

    /// Host TAP device name
    #[arg(long, global = true, env = "FCNEST_TAP_DEVICE", default_value = "tap0")]
    pub tap_device: String,

    /// Host-side address of the TAP device
    #[arg(long, global = true, env = "FCNEST_TAP_IP", default_value = "172.16.0.1")]
    pub tap_ip: Ipv4Addr,

    /// Guest address
    #[arg(long, global = true, env = "FCNEST_VM_IP", default_value = "172.16.0.2")]
    pub vm_ip: Ipv4Addr,

    /// Hypervisor log level
    #[arg(
        long,
        global = true,
        env = "FCNEST_LOG_LEVEL",
        value_enum,
        default_value_t = LogLevel::Info,
    )]
    pub log_level: LogLevel,

    /// Console mode for `start`
    #[arg(
        long,
        global = true,
        env = "FCNEST_CONSOLE",
        value_enum,
        default_value_t = ConsoleMode::Interactive,
    )]
    pub console: ConsoleMode,

    /// Hypervisor binary
    #[arg(long, global = true, env = "FCNEST_FIRECRACKER", default_value = "firecracker")]
    pub firecracker: PathBuf,

    /// Virtualization device that must be read/write accessible
    #[arg(long, global = true, env = "FCNEST_KVM_DEVICE", default_value = "/dev/kvm")]
    pub kvm_device: PathBuf,

    /// Optional VM config template (JSON, same schema as the rendered config)
    #[arg(long, global = true, env = "FCNEST_CONFIG_TEMPLATE")]
    pub config_template: Option<PathBuf>,

    /// Owner uid of workspace files inside the guest
    #[arg(long, global = true, env = "FCNEST_GUEST_UID", default_value_t = 1000)]
    pub guest_uid: u32,

    /// Owner gid of workspace files inside the guest
    #[arg(long, global = true, env = "FCNEST_GUEST_GID", default_value_t = 1000)]
    pub guest_gid: u32,

    /// Seconds to let a detached VM boot before waiting on it
    #[arg(long, global = true, env = "FCNEST_BOOT_WAIT_SECS", default_value_t = 3)]
    pub boot_wait_secs: u64,
}

/// CPU, memory and console sizing for one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceProfile {
    pub vcpu_count: u32,
    pub memory_mb: u32,
    pub workspace_size_mb: u64,
    pub log_level: LogLevel,
    pub console_mode: ConsoleMode,
}

/// TAP device and addressing between host and guest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkEndpoint {
    pub tap_device: String,
    pub tap_address: Ipv4Addr,
    pub vm_address: Ipv4Addr,
    /// Prefix length of the shared subnet
    pub prefix_len: u8,
}

impl NetworkEndpoint {
    pub const PREFIX_LEN: u8 = 24;

    pub fn new(
        tap_device: impl Into<String>,
        tap_address: Ipv4Addr,
        vm_address: Ipv4Addr,
    ) -> Result<Self> {
        let tap_device = tap_device.into();
        // IFNAMSIZ is 16 including the trailing NUL
        if tap_device.is_empty() || tap_device.len() > 15 {
            return Err(Error::InvalidConfig(format!(
                "TAP device name `{}` must be 1-15 characters",
                tap_device
            )));
        }
        if tap_address == vm_address {
            return Err(Error::InvalidConfig(format!(
                "TAP and VM addresses must differ (both {})",
                tap_address
            )));
        }
        let endpoint = Self {
            tap_device,
            tap_address,
            vm_address,
            prefix_len: Self::PREFIX_LEN,
        };
        if endpoint.network_of(tap_address) != endpoint.network_of(vm_address) {
            return Err(Error::InvalidConfig(format!(
                "TAP address {} and VM address {} are not in the same /{} subnet",
                tap_address, vm_address, Self::PREFIX_LEN
            )));
        }
        Ok(endpoint)
    }

    fn mask(&self) -> u32 {
        u32::MAX << (32 - u32::from(self.prefix_len))
    }

    fn network_of(&self, addr: Ipv4Addr) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(addr) & self.mask())
    }

    /// Subnet in CIDR notation, e.g. `172.16.0.0/24`
    pub fn subnet(&self) -> String {
        format!("{}/{}", self.network_of(self.tap_address), self.prefix_len)
    }

    /// Host address with prefix, e.g. `172.16.0.1/24`
    pub fn tap_cidr(&self) -> String {
        format!("{}/{}", self.tap_address, self.prefix_len)
    }

    /// Dotted netmask, e.g. `255.255.255.0`
    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.mask())
    }

    /// Locally administered guest MAC derived from the VM address
    pub fn guest_mac(&self) -> String {
        let [a, b, c, d] = self.vm_address.octets();
        format!("06:00:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d)
    }
}

/// Files the run reads or produces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub kernel_path: PathBuf,
    pub rootfs_path: PathBuf,
    pub workspace_dir: PathBuf,
    pub workspace_image_path: PathBuf,
    pub control_socket_path: PathBuf,
    pub rendered_config_path: PathBuf,
    pub vm_log_path: PathBuf,
    pub console_log_path: PathBuf,
}

impl ArtifactPaths {
    pub fn new(
        kernel: PathBuf,
        rootfs: PathBuf,
        workspace_dir: PathBuf,
        run_dir: &std::path::Path,
    ) -> Self {
        Self {
            kernel_path: kernel,
            rootfs_path: rootfs,
            workspace_dir,
            workspace_image_path: run_dir.join("workspace.ext4"),
            control_socket_path: run_dir.join("firecracker.socket"),
            rendered_config_path: run_dir.join("vm-config.json"),
            vm_log_path: run_dir.join("firecracker.log"),
            console_log_path: run_dir.join("console.log"),
        }
    }
}

/// Fully resolved, immutable configuration for one orchestrator run
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub profile: ResourceProfile,
    pub network: NetworkEndpoint,
    pub paths: ArtifactPaths,
    pub run_dir: PathBuf,
    pub firecracker_bin: PathBuf,
    pub kvm_device: PathBuf,
    pub config_template: Option<PathBuf>,
    pub guest_uid: u32,
    pub guest_gid: u32,
    pub boot_wait_secs: u64,
}

impl Settings {
    /// Validate settings and resolve them into a [`RunConfig`]
    pub fn resolve(&self) -> Result<RunConfig> {
        if self.vcpus == 0 || self.memory_mb == 0 || self.workspace_size_mb == 0 {
            return Err(Error::InvalidConfig(
                "vcpus, memory and workspace size must be positive".to_string(),
            ));
        }

        let network = NetworkEndpoint::new(self.tap_device.clone(), self.tap_ip, self.vm_ip)?;
        let paths = ArtifactPaths::new(
            self.kernel.clone(),
            self.rootfs.clone(),
            self.workspace.clone(),
            &self.run_dir,
        );

        Ok(RunConfig {
            profile: ResourceProfile {
                vcpu_count: self.vcpus,
                memory_mb: self.memory_mb,
                workspace_size_mb: self.workspace_size_mb,
                log_level: self.log_level,
                console_mode: self.console,
            },
            network,
            paths,
            run_dir: self.run_dir.clone(),
            firecracker_bin: self.firecracker.clone(),
            kvm_device: self.kvm_device.clone(),
            config_template: self.config_template.clone(),
            guest_uid: self.guest_uid,
            guest_gid: self.guest_gid,
            boot_wait_secs: self.boot_wait_secs,
        })
    }
}

impl RunConfig {
    /// Copy of this configuration with a different console mode
    pub fn with_console_mode(mut self, mode: ConsoleMode) -> Self {
        self.profile.console_mode = mode;
        self
    }
}

impl fmt::Display for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = &self.paths;
        writeln!(f, "fcnest configuration")?;
        writeln!(f, "  vcpus:            {}", self.profile.vcpu_count)?;
        writeln!(f, "  memory:           {} MiB", self.profile.memory_mb)?;
        writeln!(
            f,
            "  workspace size:   {} MiB (minimum)",
            self.profile.workspace_size_mb
        )?;
        writeln!(f, "  log level:        {}", self.profile.log_level)?;
        writeln!(f, "  console:          {}", self.profile.console_mode)?;
        writeln!(f, "  kernel:           {}", p.kernel_path.display())?;
        writeln!(f, "  rootfs:           {}", p.rootfs_path.display())?;
        writeln!(f, "  workspace dir:    {}", p.workspace_dir.display())?;
        writeln!(
            f,
            "  workspace image:  {}",
            p.workspace_image_path.display()
        )?;
        writeln!(f, "  control socket:   {}", p.control_socket_path.display())?;
        writeln!(
            f,
            "  vm config:        {}",
            p.rendered_config_path.display()
        )?;
        writeln!(f, "  vm log:           {}", p.vm_log_path.display())?;
        writeln!(f, "  tap device:       {}", self.network.tap_device)?;
        writeln!(f, "  tap address:      {}", self.network.tap_cidr())?;
        writeln!(f, "  vm address:       {}", self.network.vm_address)?;
        writeln!(f, "  subnet:           {}", self.network.subnet())?;
        writeln!(f, "  hypervisor:       {}", self.firecracker_bin.display())?;
        writeln!(f, "  kvm device:       {}", self.kvm_device.display())?;
        match &self.config_template {
            Some(t) => write!(f, "  config template:  {}", t.display()),
            None => write!(f, "  config template:  (built-in)"),
        }
    }
}

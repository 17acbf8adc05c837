//! Firecracker VM configuration document
//!
//! These structs mirror the JSON accepted by `firecracker --config-file`.
//! Rendering fills typed fields from the resolved run parameters; paths are
//! never spliced into text, so any character in a path is serialized safely.
//! Keys the renderer does not manage (`vsock`, `balloon`, a drive's
//! `io_engine`, ...) are carried through from the template in `extra`.

use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::{LogLevel, RunConfig};
use crate::error::{Error, Result};

/// Boot arguments used when the template does not provide any
pub const DEFAULT_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off root=/dev/vda rw";

pub const ROOTFS_DRIVE_ID: &str = "rootfs";
pub const WORKSPACE_DRIVE_ID: &str = "workspace";
pub const GUEST_IFACE_ID: &str = "eth0";

/// Boot source configuration for the VM kernel
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct BootSource {
    pub kernel_image_path: String,
    #[serde(default)]
    pub boot_args: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Block device (drive) configuration
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: String,
    pub is_root_device: bool,
    pub is_read_only: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// vCPU and memory sizing
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MachineConfig {
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
    #[serde(default)]
    pub smt: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            vcpu_count: 1,
            mem_size_mib: 128,
            smt: false,
            extra: Map::new(),
        }
    }
}

/// Guest network interface backed by a host TAP device
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NetworkInterface {
    pub iface_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub guest_mac: Option<String>,
    pub host_dev_name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Hypervisor logger configuration
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Logger {
    pub log_path: String,
    pub level: LogLevel,
    #[serde(default)]
    pub show_level: bool,
    #[serde(default)]
    pub show_log_origin: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Complete `--config-file` document
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct VmConfigDocument {
    #[serde(rename = "boot-source", default)]
    pub boot_source: BootSource,
    #[serde(default)]
    pub drives: Vec<Drive>,
    #[serde(rename = "machine-config", default)]
    pub machine_config: MachineConfig,
    #[serde(rename = "network-interfaces", default)]
    pub network_interfaces: Vec<NetworkInterface>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub logger: Option<Logger>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Values the renderer writes into the document
#[derive(Debug, Clone, PartialEq)]
pub struct RenderParams {
    pub kernel_path: PathBuf,
    pub rootfs_path: PathBuf,
    pub workspace_image_path: PathBuf,
    pub vcpu_count: u32,
    pub memory_mb: u32,
    pub tap_device: String,
    pub tap_address: Ipv4Addr,
    pub vm_address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub guest_mac: String,
    pub log_path: Option<PathBuf>,
    pub log_level: LogLevel,
}

impl RenderParams {
    pub fn from_run_config(cfg: &RunConfig) -> Self {
        Self {
            kernel_path: cfg.paths.kernel_path.clone(),
            rootfs_path: cfg.paths.rootfs_path.clone(),
            workspace_image_path: cfg.paths.workspace_image_path.clone(),
            vcpu_count: cfg.profile.vcpu_count,
            memory_mb: cfg.profile.memory_mb,
            tap_device: cfg.network.tap_device.clone(),
            tap_address: cfg.network.tap_address,
            vm_address: cfg.network.vm_address,
            netmask: cfg.network.netmask(),
            guest_mac: cfg.network.guest_mac(),
            log_path: Some(cfg.paths.vm_log_path.clone()),
            log_level: cfg.profile.log_level,
        }
    }

    /// Kernel `ip=` clause for static guest addressing
    pub fn ip_boot_arg(&self) -> String {
        format!(
            "ip={}::{}:{}::{}:off",
            self.vm_address, self.tap_address, self.netmask, GUEST_IFACE_ID
        )
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Insert `drive`, or overwrite the managed fields of the drive with its id
fn upsert_drive(drives: &mut Vec<Drive>, drive: Drive) {
    match drives.iter_mut().find(|d| d.drive_id == drive.drive_id) {
        Some(existing) => {
            existing.path_on_host = drive.path_on_host;
            existing.is_root_device = drive.is_root_device;
            existing.is_read_only = drive.is_read_only;
        }
        None => drives.push(drive),
    }
}

/// Apply `params` to a base document (a template or the built-in default)
pub fn render(template: VmConfigDocument, params: &RenderParams) -> VmConfigDocument {
    let mut doc = template;

    let base_args = if doc.boot_source.boot_args.trim().is_empty() {
        DEFAULT_BOOT_ARGS.to_string()
    } else {
        doc.boot_source.boot_args.clone()
    };
    let mut args: Vec<String> = base_args
        .split_whitespace()
        .filter(|a| !a.starts_with("ip="))
        .map(str::to_string)
        .collect();
    args.push(params.ip_boot_arg());

    doc.boot_source.kernel_image_path = path_string(&params.kernel_path);
    doc.boot_source.boot_args = args.join(" ");

    // the root device must come first
    doc.drives.retain(|d| !d.is_root_device || d.drive_id == ROOTFS_DRIVE_ID);
    upsert_drive(
        &mut doc.drives,
        Drive {
            drive_id: ROOTFS_DRIVE_ID.to_string(),
            path_on_host: path_string(&params.rootfs_path),
            is_root_device: true,
            is_read_only: false,
            extra: Map::new(),
        },
    );
    upsert_drive(
        &mut doc.drives,
        Drive {
            drive_id: WORKSPACE_DRIVE_ID.to_string(),
            path_on_host: path_string(&params.workspace_image_path),
            is_root_device: false,
            is_read_only: false,
            extra: Map::new(),
        },
    );
    doc.drives.sort_by_key(|d| !d.is_root_device);

    doc.machine_config.vcpu_count = params.vcpu_count;
    doc.machine_config.mem_size_mib = params.memory_mb;

    match doc.network_interfaces.iter_mut().find(|i| i.iface_id == GUEST_IFACE_ID) {
        Some(existing) => {
            existing.guest_mac = Some(params.guest_mac.clone());
            existing.host_dev_name = params.tap_device.clone();
        }
        None => doc.network_interfaces.push(NetworkInterface {
            iface_id: GUEST_IFACE_ID.to_string(),
            guest_mac: Some(params.guest_mac.clone()),
            host_dev_name: params.tap_device.clone(),
            extra: Map::new(),
        }),
    }

    let logger_extra = doc.logger.take().map(|l| l.extra).unwrap_or_default();
    doc.logger = params.log_path.as_ref().map(|path| Logger {
        log_path: path_string(path),
        level: params.log_level,
        show_level: true,
        show_log_origin: false,
        extra: logger_extra,
    });

    doc
}

/// Load a template document from disk
pub fn load_template(path: &Path) -> Result<VmConfigDocument> {
    let text = fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| {
        Error::InvalidConfig(format!("config template {}: {}", path.display(), e))
    })
}

/// Render and write the config file, replacing any previous one
///
/// The old file is removed before anything else so a failed render never
/// leaves a stale document behind for the next step to pick up.
pub fn write_config(
    output: &Path,
    template: Option<&Path>,
    params: &RenderParams,
) -> Result<VmConfigDocument> {
    if output.exists() {
        fs::remove_file(output)?;
    }

    let base = match template {
        Some(path) => load_template(path)?,
        None => VmConfigDocument::default(),
    };
    let doc = render(base, params);

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = output.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(&doc)?)?;
    fs::rename(&tmp, output)?;

    debug!(path = %output.display(), "VM config rendered");
    Ok(doc)
}

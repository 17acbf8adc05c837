//! Pre-flight checks
//!
//! Nothing here touches host networking or images. A failure aborts the run
//! before any resource is provisioned.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;

use tracing::debug;

use crate::config::RunConfig;
use crate::error::{Error, Result};

/// Create the run directory and the host workspace directory
pub fn ensure_directories(cfg: &RunConfig) -> Result<()> {
    fs::create_dir_all(&cfg.run_dir)?;
    fs::create_dir_all(&cfg.paths.workspace_dir)?;
    Ok(())
}

/// Check boot artifacts and the virtualization device
pub fn validate(cfg: &RunConfig) -> Result<()> {
    require_file("kernel image", &cfg.paths.kernel_path)?;
    require_file("root filesystem image", &cfg.paths.rootfs_path)?;
    check_device(&cfg.kvm_device)?;
    debug!("prerequisites validated");
    Ok(())
}

fn require_file(what: &'static str, path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(Error::MissingArtifact {
            what,
            path: path.to_path_buf(),
        })
    }
}

const KVM_PERMISSION_HINT: &str =
    "permission denied (add your user to the `kvm` group or run as root)";

/// The device must exist and open read/write
pub fn check_device(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(Error::DeviceUnavailable {
            path: path.to_path_buf(),
            reason: "device not present (is KVM enabled in the BIOS and kernel?)".to_string(),
        });
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map(|_| ())
        .map_err(|e| Error::DeviceUnavailable {
            path: path.to_path_buf(),
            reason: match e.kind() {
                io::ErrorKind::PermissionDenied => KVM_PERMISSION_HINT.to_string(),
                _ => e.to_string(),
            },
        })
}

/// Create an empty hypervisor log file; Firecracker refuses a missing one
pub fn prepare_vm_log(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    File::create(path)?;
    Ok(())
}

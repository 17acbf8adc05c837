//! Error type shared by the host orchestrator and the guest bootstrap

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by fcnest operations
///
/// Pre-flight failures (`MissingArtifact`, `DeviceUnavailable`, `InvalidConfig`)
/// stop the run before any host resource is touched. Everything else surfaces
/// from a phase that already started provisioning.
#[derive(Debug, Error)]
pub enum Error {
    /// A required input file (kernel, rootfs) is absent
    #[error("{what} not found at {}", path.display())]
    MissingArtifact { what: &'static str, path: PathBuf },

    /// The virtualization device is missing or not read/write accessible
    #[error("virtualization device {} unavailable: {reason}", path.display())]
    DeviceUnavailable { path: PathBuf, reason: String },

    /// Settings that cannot be resolved into a consistent run configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An external command exited unsuccessfully
    #[error("`{command}` failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    /// The hypervisor control API rejected a request or was unreachable
    #[error("VM API error on {endpoint}: {message}")]
    Api { endpoint: String, message: String },

    /// The VM process could not be started or supervised
    #[error("VM process error: {0}")]
    Vm(String),

    /// A stop signal arrived before the VM was launched
    #[error("interrupted by {0}")]
    Interrupted(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True for failures detected before any side effect
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            Error::MissingArtifact { .. }
                | Error::DeviceUnavailable { .. }
                | Error::InvalidConfig(_)
        )
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        if self.is_preflight() {
            2
        } else {
            1
        }
    }
}

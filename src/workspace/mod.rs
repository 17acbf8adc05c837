//! Workspace image management
//!
//! The host workspace directory reaches the guest as a second block device.
//! [`WorkspaceManager::materialize`] builds a fresh ext4 image from the
//! directory before boot, and [`WorkspaceManager::reconcile`] mirrors the
//! image back onto the directory after the VM exits.
//!
//! ```text
//! host dir ──materialize──► workspace.ext4 ──(VM runs)──► reconcile ──► host dir
//! ```

pub mod image;
pub mod sync;

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};

pub use image::{Ext4Tool, FilesystemTool, MountGuard};
pub use sync::{dir_size_kb, is_non_empty_dir, mirror_dir};

/// Size of the image for a source tree of `source_kb` KiB
///
/// `max(requested_mb, ceil(source_kb / 1024 * 1.2))`
pub fn image_size_mb(source_kb: u64, requested_mb: u64) -> u64 {
    // ceil(source_kb * 12 / 10240) without floating point
    let needed = source_kb.saturating_mul(12).div_ceil(10240);
    needed.max(requested_mb)
}

/// An image produced by [`WorkspaceManager::materialize`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceImage {
    pub path: PathBuf,
    pub size_mb: u64,
    /// Whether host content was copied in
    pub populated: bool,
}

/// Result of [`WorkspaceManager::reconcile`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Synced,
    Skipped(String),
}

/// Builds workspace images and syncs them back
pub struct WorkspaceManager<'a> {
    tool: &'a dyn FilesystemTool,
    uid: u32,
    gid: u32,
}

impl<'a> WorkspaceManager<'a> {
    /// # Arguments
    /// * `tool` - Filesystem operations backend
    /// * `uid`, `gid` - Guest identity that should own workspace files
    pub fn new(tool: &'a dyn FilesystemTool, uid: u32, gid: u32) -> Self {
        Self { tool, uid, gid }
    }

    /// Build a fresh image at `output` from `source_dir`
    ///
    /// A missing or empty source yields an empty filesystem of exactly
    /// `requested_mb`. Any previous image at `output` is replaced.
    pub fn materialize(
        &self,
        source_dir: &Path,
        output: &Path,
        requested_mb: u64,
    ) -> Result<WorkspaceImage> {
        let populated = is_non_empty_dir(source_dir);
        let size_mb = if populated {
            let source_kb = dir_size_kb(source_dir)?;
            debug!(source = %source_dir.display(), source_kb, "measured workspace");
            image_size_mb(source_kb, requested_mb)
        } else {
            requested_mb
        };
        let size_bytes = size_mb.checked_mul(1024 * 1024).ok_or_else(|| {
            Error::InvalidConfig(format!("workspace image of {} MiB is too large", size_mb))
        })?;

        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)?;
        }
        if output.exists() {
            fs::remove_file(output)?;
        }
        let file = File::create(output)?;
        file.set_len(size_bytes)?;
        drop(file);

        self.tool.format(output)?;

        if populated {
            let mount = MountGuard::mount(self.tool, output)?;
            mirror_dir(source_dir, mount.path())?;
            self.tool.chown_tree(mount.path(), self.uid, self.gid)?;
            mount.unmount()?;
        }

        info!(
            image = %output.display(),
            size_mb,
            populated,
            "workspace image ready"
        );
        Ok(WorkspaceImage {
            path: output.to_path_buf(),
            size_mb,
            populated,
        })
    }

    /// Mirror the image's content onto `target_dir`
    ///
    /// Files in `target_dir` that no longer exist in the image are deleted.
    /// If either side is missing or the image cannot be mounted, nothing
    /// happens.
    pub fn reconcile(&self, image: &Path, target_dir: &Path) -> Result<ReconcileOutcome> {
        if !image.is_file() {
            return Ok(ReconcileOutcome::Skipped(format!("no image at {}", image.display())));
        }
        if !target_dir.is_dir() {
            return Ok(ReconcileOutcome::Skipped(format!(
                "no workspace directory at {}",
                target_dir.display()
            )));
        }

        let mount = match MountGuard::mount(self.tool, image) {
            Ok(mount) => mount,
            Err(e) => {
                debug!(error = %e, "workspace image not mountable; skipping sync");
                return Ok(ReconcileOutcome::Skipped(e.to_string()));
            }
        };

        if let Err(e) = mirror_dir(mount.path(), target_dir) {
            warn!(error = %e, target = %target_dir.display(), "workspace sync incomplete");
            mount.unmount()?;
            return Err(e.into());
        }
        mount.unmount()?;

        info!(target = %target_dir.display(), "workspace synced back to host");
        Ok(ReconcileOutcome::Synced)
    }
}

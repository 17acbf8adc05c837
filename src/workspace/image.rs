//! Block-image filesystem operations
//!
//! [`FilesystemTool`] is the seam between workspace logic and the privileged
//! tools that format and loop-mount images.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::Result;
use crate::exec::{run_checked, CommandRunner};

use super::sync::chown_tree;

/// Formats, mounts and re-owns filesystem images
pub trait FilesystemTool: Send + Sync {
    /// Put an empty filesystem on an existing, zero-filled image file
    fn format(&self, image: &Path) -> Result<()>;

    /// Loop-mount `image` read-write at `mountpoint`
    fn mount(&self, image: &Path, mountpoint: &Path) -> Result<()>;

    fn unmount(&self, mountpoint: &Path) -> Result<()>;

    /// Recursively set ownership of everything under `path`
    fn chown_tree(&self, path: &Path, uid: u32, gid: u32) -> Result<()>;
}

/// ext4 images via `mkfs.ext4` and loop mounts
pub struct Ext4Tool<'a> {
    runner: &'a dyn CommandRunner,
    label: String,
}

impl<'a> Ext4Tool<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self {
            runner,
            label: "workspace".to_string(),
        }
    }
}

impl FilesystemTool for Ext4Tool<'_> {
    fn format(&self, image: &Path) -> Result<()> {
        let image = image.to_string_lossy();
        run_checked(
            self.runner,
            "mkfs.ext4",
            &["-F", "-q", "-L", &self.label, &image],
        )?;
        Ok(())
    }

    fn mount(&self, image: &Path, mountpoint: &Path) -> Result<()> {
        run_checked(
            self.runner,
            "mount",
            &["-o", "loop,rw", &image.to_string_lossy(), &mountpoint.to_string_lossy()],
        )?;
        Ok(())
    }

    fn unmount(&self, mountpoint: &Path) -> Result<()> {
        run_checked(self.runner, "umount", &[&mountpoint.to_string_lossy()])?;
        Ok(())
    }

    fn chown_tree(&self, path: &Path, uid: u32, gid: u32) -> Result<()> {
        chown_tree(path, uid, gid)?;
        Ok(())
    }
}

/// An image mounted on a private temporary directory
///
/// Dropping the guard unmounts. If unmounting fails the mount point is left
/// in place rather than deleted, since it would still expose the image.
pub struct MountGuard<'a> {
    tool: &'a dyn FilesystemTool,
    dir: Option<tempfile::TempDir>,
    mountpoint: PathBuf,
    mounted: bool,
}

impl<'a> MountGuard<'a> {
    /// Create a temporary mount point and mount `image` on it
    pub fn mount(tool: &'a dyn FilesystemTool, image: &Path) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("fcnest-mnt-").tempdir()?;
        let mountpoint = dir.path().to_path_buf();
        tool.mount(image, &mountpoint)?;
        Ok(Self {
            tool,
            dir: Some(dir),
            mountpoint,
            mounted: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.mountpoint
    }

    /// Unmount now and report the result
    pub fn unmount(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if !self.mounted {
            return Ok(());
        }
        self.mounted = false;
        match self.tool.unmount(&self.mountpoint) {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Some(dir) = self.dir.take() {
                    std::mem::forget(dir);
                }
                Err(e)
            }
        }
    }
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(
                mountpoint = %self.mountpoint.display(),
                error = %e,
                "failed to unmount workspace image"
            );
        }
    }
}

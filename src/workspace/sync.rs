//! Directory mirroring and tree helpers
//!
//! `mirror_dir` is a one-way, delete-aware sync: after it returns, `dst`
//! contains exactly the entries of `src` (minus excluded top-level names).

use std::collections::HashSet;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::{lchown, symlink, MetadataExt};
use std::path::Path;

/// Top-level names never copied or deleted by [`mirror_dir`]
pub const MIRROR_EXCLUDES: &[&str] = &["lost+found"];

/// Disk usage of a directory tree in KiB, like `du -sk`
pub fn dir_size_kb(path: &Path) -> io::Result<u64> {
    let meta = fs::symlink_metadata(path)?;
    // st_blocks is in 512-byte units
    let mut total = meta.blocks() / 2;
    if meta.is_dir() {
        for entry in fs::read_dir(path)? {
            total += dir_size_kb(&entry?.path())?;
        }
    }
    Ok(total)
}

/// True if `path` is a directory with at least one entry
pub fn is_non_empty_dir(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Make `dst` an exact copy of `src`
///
/// Regular files are copied with their permissions and modification time,
/// symlinks are recreated, and anything in `dst` that is absent from `src`
/// is removed.
pub fn mirror_dir(src: &Path, dst: &Path) -> io::Result<()> {
    mirror_inner(src, dst, MIRROR_EXCLUDES)
}

fn mirror_inner(src: &Path, dst: &Path, excludes: &[&str]) -> io::Result<()> {
    fs::create_dir_all(dst)?;

    let mut seen: HashSet<OsString> = HashSet::new();

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if excludes.iter().any(|ex| name == *ex) {
            continue;
        }
        seen.insert(name.clone());

        let from = entry.path();
        let to = dst.join(&name);
        let file_type = entry.file_type()?;

        // replace entries whose type changed
        if let Ok(existing) = fs::symlink_metadata(&to) {
            let same_kind = existing.file_type().is_dir() == file_type.is_dir()
                && existing.file_type().is_symlink() == file_type.is_symlink();
            if !same_kind {
                remove_entry(&to)?;
            }
        }

        if file_type.is_dir() {
            mirror_inner(&from, &to, &[])?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(&from)?;
            if fs::read_link(&to).ok().as_deref() != Some(target.as_path()) {
                let _ = fs::remove_file(&to);
                symlink(&target, &to)?;
            }
        } else if file_type.is_file() {
            copy_file(&from, &to)?;
        }
    }

    for entry in fs::read_dir(dst)? {
        let entry = entry?;
        let name = entry.file_name();
        if excludes.iter().any(|ex| name == *ex) || seen.contains(&name) {
            continue;
        }
        remove_entry(&entry.path())?;
    }

    fs::set_permissions(dst, fs::metadata(src)?.permissions())?;
    Ok(())
}

fn copy_file(from: &Path, to: &Path) -> io::Result<()> {
    let src_meta = fs::metadata(from)?;
    if let Ok(dst_meta) = fs::symlink_metadata(to) {
        if dst_meta.len() == src_meta.len()
            && dst_meta.modified().ok() == src_meta.modified().ok()
        {
            return Ok(());
        }
        fs::remove_file(to)?;
    }
    fs::copy(from, to)?;
    File::open(to)?.set_modified(src_meta.modified()?)?;
    Ok(())
}

fn remove_entry(path: &Path) -> io::Result<()> {
    if fs::symlink_metadata(path)?.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Recursively change ownership without following symlinks
pub fn chown_tree(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
    lchown(path, Some(uid), Some(gid))?;
    if fs::symlink_metadata(path)?.is_dir() {
        for entry in fs::read_dir(path)? {
            chown_tree(&entry?.path(), uid, gid)?;
        }
    }
    Ok(())
}

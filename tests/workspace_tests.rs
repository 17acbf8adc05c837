//! Workspace image materialize/reconcile

mod common;

use std::fs;
use std::path::Path;
use std::sync::atomic::Ordering;

use common::DirImageTool;
use fcnest::workspace::{ReconcileOutcome, WorkspaceManager};
use fcnest::Error;

fn write(path: &Path, contents: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

#[test]
fn test_empty_source_gives_requested_size() {
    let dir = tempfile::tempdir().unwrap();
    let tool = DirImageTool::new(&dir.path().join("fs"));
    let manager = WorkspaceManager::new(&tool, 1000, 1000);

    let image = manager
        .materialize(
            &dir.path().join("missing"),
            &dir.path().join("run/ws.ext4"),
            64,
        )
        .unwrap();

    assert_eq!(image.size_mb, 64);
    assert!(!image.populated);
    assert_eq!(fs::metadata(&image.path).unwrap().len(), 64 * 1024 * 1024);
    // formatted but never mounted
    assert!(tool.backing(&image.path).is_some());
    assert_eq!(tool.unmounts.load(Ordering::SeqCst), 0);
}

#[test]
fn test_materialize_copies_and_chowns() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    write(&src.join("main.rs"), "fn main() {}");
    write(&src.join("docs/readme.md"), "hello");
    let tool = DirImageTool::new(&dir.path().join("fs"));
    let manager = WorkspaceManager::new(&tool, 1000, 1001);

    let image = manager.materialize(&src, &dir.path().join("ws.ext4"), 1).unwrap();

    assert!(image.populated);
    let backing = tool.backing(&image.path).unwrap();
    assert_eq!(
        fs::read_to_string(backing.join("main.rs")).unwrap(),
        "fn main() {}"
    );
    assert_eq!(
        fs::read_to_string(backing.join("docs/readme.md")).unwrap(),
        "hello"
    );
    let chowned = tool.chowned.lock().unwrap();
    assert_eq!(chowned.len(), 1);
    assert_eq!((chowned[0].1, chowned[0].2), (1000, 1001));
    assert_eq!(tool.active_mounts(), 0);
}

#[test]
fn test_materialize_replaces_previous_image() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("ws.ext4");
    fs::write(&output, vec![0xAB; 4096]).unwrap();
    let tool = DirImageTool::new(&dir.path().join("fs"));

    let image = WorkspaceManager::new(&tool, 0, 0)
        .materialize(&dir.path().join("none"), &output, 2)
        .unwrap();

    assert_eq!(fs::metadata(&image.path).unwrap().len(), 2 * 1024 * 1024);
}

#[test]
fn test_reconcile_mirrors_guest_changes() {
    let dir = tempfile::tempdir().unwrap();
    let host = dir.path().join("workspace");
    write(&host.join("keep.txt"), "original");
    write(&host.join("deleted-in-guest.txt"), "gone soon");
    let tool = DirImageTool::new(&dir.path().join("fs"));
    let manager = WorkspaceManager::new(&tool, 1000, 1000);
    let image = manager.materialize(&host, &dir.path().join("ws.ext4"), 1).unwrap();

    // what the guest did while running
    let backing = tool.backing(&image.path).unwrap();
    fs::write(backing.join("keep.txt"), "edited in guest").unwrap();
    fs::remove_file(backing.join("deleted-in-guest.txt")).unwrap();
    write(&backing.join("new/output.log"), "built");

    let outcome = manager.reconcile(&image.path, &host).unwrap();

    assert_eq!(outcome, ReconcileOutcome::Synced);
    assert_eq!(
        fs::read_to_string(host.join("keep.txt")).unwrap(),
        "edited in guest"
    );
    assert!(!host.join("deleted-in-guest.txt").exists());
    assert_eq!(
        fs::read_to_string(host.join("new/output.log")).unwrap(),
        "built"
    );
    assert_eq!(tool.active_mounts(), 0);
}

#[test]
fn test_reconcile_skips_when_mount_fails() {
    let dir = tempfile::tempdir().unwrap();
    let host = dir.path().join("workspace");
    write(&host.join("file.txt"), "untouched");
    let image = dir.path().join("ws.ext4");
    fs::write(&image, b"").unwrap();
    let mut tool = DirImageTool::new(&dir.path().join("fs"));
    tool.fail_mount = true;

    let outcome = WorkspaceManager::new(&tool, 1000, 1000).reconcile(&image, &host).unwrap();

    assert!(matches!(outcome, ReconcileOutcome::Skipped(_)));
    assert_eq!(
        fs::read_to_string(host.join("file.txt")).unwrap(),
        "untouched"
    );
}

#[test]
fn test_reconcile_skips_missing_sides() {
    let dir = tempfile::tempdir().unwrap();
    let tool = DirImageTool::new(&dir.path().join("fs"));
    let manager = WorkspaceManager::new(&tool, 1000, 1000);

    let no_image = manager
        .reconcile(&dir.path().join("absent.ext4"), dir.path())
        .unwrap();
    assert!(matches!(no_image, ReconcileOutcome::Skipped(_)));

    let image = dir.path().join("ws.ext4");
    fs::write(&image, b"").unwrap();
    let no_target = manager.reconcile(&image, &dir.path().join("absent")).unwrap();
    assert!(matches!(no_target, ReconcileOutcome::Skipped(_)));
}

#[test]
fn test_chown_failure_releases_mount() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    write(&src.join("main.rs"), "fn main() {}");
    let mut tool = DirImageTool::new(&dir.path().join("fs"));
    tool.fail_chown = true;

    let err = WorkspaceManager::new(&tool, 1000, 1000)
        .materialize(&src, &dir.path().join("ws.ext4"), 1)
        .unwrap_err();

    assert!(matches!(err, Error::Io(_)));
    assert_eq!(tool.active_mounts(), 0);
    assert_eq!(tool.unmounts.load(Ordering::SeqCst), 1);
}

#[test]
fn test_copy_failure_releases_mount() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    write(&src.join("secret.txt"), "hidden");
    fs::set_permissions(src.join("secret.txt"), fs::Permissions::from_mode(0o000)).unwrap();
    if fs::read(src.join("secret.txt")).is_ok() {
        // running as root: permissions don't stop the copy
        return;
    }
    let tool = DirImageTool::new(&dir.path().join("fs"));

    let result =
        WorkspaceManager::new(&tool, 1000, 1000).materialize(&src, &dir.path().join("ws.ext4"), 1);

    assert!(result.is_err());
    assert_eq!(tool.active_mounts(), 0);
}

#[test]
fn test_oversized_image_rejected_before_touching_disk() {
    let dir = tempfile::tempdir().unwrap();
    let tool = DirImageTool::new(&dir.path().join("fs"));
    let output = dir.path().join("run/ws.ext4");

    let err = WorkspaceManager::new(&tool, 1000, 1000)
        .materialize(&dir.path().join("none"), &output, u64::MAX / 1024)
        .unwrap_err();

    assert!(matches!(err, Error::InvalidConfig(_)));
    assert!(!output.exists());
}

/// Real mkfs.ext4 + loop mount; needs root
#[test]
#[ignore]
fn test_ext4_round_trip() {
    use fcnest::{Ext4Tool, SystemRunner};

    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    write(&src.join("hello.txt"), "hi");
    let runner = SystemRunner;
    let tool = Ext4Tool::new(&runner);
    let manager = WorkspaceManager::new(&tool, 1000, 1000);

    let image = manager.materialize(&src, &dir.path().join("ws.ext4"), 16).unwrap();
    fs::remove_file(src.join("hello.txt")).unwrap();
    write(&src.join("stale.txt"), "stale");

    assert_eq!(
        manager.reconcile(&image.path, &src).unwrap(),
        ReconcileOutcome::Synced
    );
    assert_eq!(fs::read_to_string(src.join("hello.txt")).unwrap(), "hi");
    assert!(!src.join("stale.txt").exists());
    assert!(!src.join("lost+found").exists());
}

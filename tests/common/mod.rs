//! Shared fakes for integration tests
//!
//! - `FakeHost`: in-memory model of links, addresses, forwarding and iptables
//! - `DirImageTool`: "images" backed by plain directories
//! - `ScriptedGuest`: guest commands and a fake engine daemon

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use fcnest::exec::{display_command, BackgroundProcess, CommandOutput, CommandRunner};
use fcnest::workspace::mirror_dir;
use fcnest::{Error, FilesystemTool, RunConfig, Settings};

// ---------------------------------------------------------------------------
// Host networking
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct HostState {
    pub links: BTreeSet<String>,
    pub addrs: BTreeMap<String, Vec<String>>,
    /// `"<table> <chain> <spec...>"`
    pub rules: Vec<String>,
    pub default_route: Option<String>,
    pub ip_forward: bool,
}

/// Command runner that applies `ip`, `sysctl` and `iptables` to [`HostState`]
#[derive(Default)]
pub struct FakeHost {
    state: Mutex<HostState>,
    log: Mutex<Vec<String>>,
    fail_prefixes: Mutex<Vec<String>>,
}

impl FakeHost {
    pub fn with_uplink(uplink: &str) -> Self {
        let host = Self::default();
        host.state.lock().unwrap().default_route = Some(uplink.to_string());
        host
    }

    pub fn without_default_route() -> Self {
        Self::default()
    }

    pub fn state(&self) -> HostState {
        self.state.lock().unwrap().clone()
    }

    /// Every command line run so far
    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Make every command starting with `prefix` fail
    pub fn fail_on(&self, prefix: &str) {
        self.fail_prefixes.lock().unwrap().push(prefix.to_string());
    }

    fn ip(&self, state: &mut HostState, args: &[&str]) -> CommandOutput {
        match args {
            ["link", "show", "dev", dev] => {
                if state.links.contains(*dev) {
                    CommandOutput::ok(format!("5: {}: <BROADCAST,MULTICAST> mtu 1500\n", dev))
                } else {
                    CommandOutput::failed(1, format!("Device \"{}\" does not exist.", dev))
                }
            }
            ["tuntap", "add", "dev", dev, "mode", "tap"] => {
                if !state.links.insert(dev.to_string()) {
                    return CommandOutput::failed(1, "ioctl(TUNSETIFF): Device or resource busy");
                }
                CommandOutput::ok("")
            }
            ["-4", "addr", "show", "dev", dev] => {
                if !state.links.contains(*dev) {
                    return CommandOutput::failed(1, "Device does not exist.");
                }
                let body: String = state
                    .addrs
                    .get(*dev)
                    .into_iter()
                    .flatten()
                    .map(|cidr| format!("    inet {} scope global {}\n", cidr, dev))
                    .collect();
                CommandOutput::ok(body)
            }
            ["addr", "add", cidr, "dev", dev] => {
                if !state.links.contains(*dev) {
                    return CommandOutput::failed(1, "Cannot find device");
                }
                let addrs = state.addrs.entry(dev.to_string()).or_default();
                if addrs.iter().any(|a| a == cidr) {
                    return CommandOutput::failed(2, "RTNETLINK answers: File exists");
                }
                addrs.push(cidr.to_string());
                CommandOutput::ok("")
            }
            ["link", "set", "dev", dev, "up"] => {
                if state.links.contains(*dev) {
                    CommandOutput::ok("")
                } else {
                    CommandOutput::failed(1, "Cannot find device")
                }
            }
            ["route", "show", "default"] => match &state.default_route {
                Some(uplink) => CommandOutput::ok(format!(
                    "default via 192.168.1.1 dev {} proto dhcp metric 100\n",
                    uplink
                )),
                None => CommandOutput::ok(""),
            },
            ["link", "del", "dev", dev] => {
                if state.links.remove(*dev) {
                    state.addrs.remove(*dev);
                    CommandOutput::ok("")
                } else {
                    CommandOutput::failed(1, "Cannot find device")
                }
            }
            _ => CommandOutput::failed(255, format!("unsupported: ip {}", args.join(" "))),
        }
    }

    fn iptables(&self, state: &mut HostState, args: &[&str]) -> CommandOutput {
        let ["-t", table, action, chain, spec @ ..] = args else {
            return CommandOutput::failed(2, "bad invocation");
        };
        let rule = format!("{} {} {}", table, chain, spec.join(" "));
        let present = state.rules.contains(&rule);
        match *action {
            "-C" if present => CommandOutput::ok(""),
            "-C" => CommandOutput::failed(
                1,
                "Bad rule (does a matching rule exist in that chain?).",
            ),
            "-A" => {
                state.rules.push(rule);
                CommandOutput::ok("")
            }
            _ => CommandOutput::failed(1, "no such rule"),
        }
    }
}

impl CommandRunner for FakeHost {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
        let line = display_command(program, args);
        self.log.lock().unwrap().push(line.clone());

        if self.fail_prefixes.lock().unwrap().iter().any(|p| line.starts_with(p)) {
            return Ok(CommandOutput::failed(1, "injected failure"));
        }

        let mut state = self.state.lock().unwrap();
        Ok(match program {
            "ip" => self.ip(&mut state, args),
            "iptables" => self.iptables(&mut state, args),
            "sysctl" => {
                state.ip_forward = true;
                CommandOutput::ok("")
            }
            _ => CommandOutput::failed(127, format!("{}: command not found", program)),
        })
    }

    fn spawn_logged(
        &self,
        program: &str,
        _args: &[&str],
        _log: &Path,
    ) -> io::Result<Box<dyn BackgroundProcess>> {
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} not available", program),
        ))
    }
}

// ---------------------------------------------------------------------------
// Workspace images
// ---------------------------------------------------------------------------

/// Filesystem tool where each image's filesystem is a backing directory
///
/// Mounting copies the backing directory onto the mount point; unmounting
/// copies it back and empties the mount point.
pub struct DirImageTool {
    root: PathBuf,
    images: Mutex<HashMap<PathBuf, PathBuf>>,
    mounts: Mutex<HashMap<PathBuf, PathBuf>>,
    next: AtomicUsize,
    pub fail_format: bool,
    pub fail_mount: bool,
    pub fail_chown: bool,
    /// Send SIGTERM to this process while formatting
    pub sigterm_on_format: bool,
    pub chowned: Mutex<Vec<(PathBuf, u32, u32)>>,
    pub unmounts: AtomicUsize,
}

impl DirImageTool {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            images: Mutex::new(HashMap::new()),
            mounts: Mutex::new(HashMap::new()),
            next: AtomicUsize::new(0),
            fail_format: false,
            fail_mount: false,
            fail_chown: false,
            sigterm_on_format: false,
            chowned: Mutex::new(Vec::new()),
            unmounts: AtomicUsize::new(0),
        }
    }

    /// Directory holding the filesystem content of `image`
    pub fn backing(&self, image: &Path) -> Option<PathBuf> {
        self.images.lock().unwrap().get(image).cloned()
    }

    pub fn active_mounts(&self) -> usize {
        self.mounts.lock().unwrap().len()
    }

    fn failure(command: &str, stderr: &str) -> Error {
        Error::CommandFailed {
            command: command.to_string(),
            status: "exit status 32".to_string(),
            stderr: stderr.to_string(),
        }
    }
}

impl FilesystemTool for DirImageTool {
    fn format(&self, image: &Path) -> fcnest::Result<()> {
        if self.fail_format {
            return Err(Self::failure("mkfs.ext4", "injected format failure"));
        }
        if self.sigterm_on_format {
            deliver_sigterm();
        }
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let backing = self.root.join(format!("fs-{}", n));
        fs::create_dir_all(&backing)?;
        self.images.lock().unwrap().insert(image.to_path_buf(), backing);
        Ok(())
    }

    fn mount(&self, image: &Path, mountpoint: &Path) -> fcnest::Result<()> {
        if self.fail_mount {
            return Err(Self::failure("mount", "wrong fs type, bad superblock"));
        }
        let backing = self
            .backing(image)
            .ok_or_else(|| Self::failure("mount", "not a filesystem image"))?;
        mirror_dir(&backing, mountpoint)?;
        self.mounts
            .lock()
            .unwrap()
            .insert(mountpoint.to_path_buf(), image.to_path_buf());
        Ok(())
    }

    fn unmount(&self, mountpoint: &Path) -> fcnest::Result<()> {
        let image = self
            .mounts
            .lock()
            .unwrap()
            .remove(mountpoint)
            .ok_or_else(|| Self::failure("umount", "not mounted"))?;
        if let Some(backing) = self.backing(&image) {
            mirror_dir(mountpoint, &backing)?;
        }
        for entry in fs::read_dir(mountpoint)? {
            let path = entry?.path();
            if fs::symlink_metadata(&path)?.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        self.unmounts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn chown_tree(&self, path: &Path, uid: u32, gid: u32) -> fcnest::Result<()> {
        if self.fail_chown {
            return Err(Error::Io(io::Error::from_raw_os_error(1)));
        }
        self.chowned.lock().unwrap().push((path.to_path_buf(), uid, gid));
        Ok(())
    }
}

/// Raise SIGTERM in this process and give the runtime's signal driver time
/// to pick it up
pub fn deliver_sigterm() {
    nix::sys::signal::raise(nix::sys::signal::Signal::SIGTERM).unwrap();
    std::thread::sleep(Duration::from_millis(100));
}

// ---------------------------------------------------------------------------
// Run configuration
// ---------------------------------------------------------------------------

#[derive(Parser)]
struct TestCli {
    #[command(flatten)]
    settings: Settings,
}

/// Paths for a run rooted in a temp directory
pub struct Sandbox {
    pub dir: tempfile::TempDir,
}

impl Sandbox {
    /// Kernel, rootfs, kvm device and tun device all present
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("images")).unwrap();
        fs::write(dir.path().join("images/vmlinux"), b"kernel").unwrap();
        fs::write(dir.path().join("images/rootfs.ext4"), b"rootfs").unwrap();
        fs::write(dir.path().join("kvm"), b"").unwrap();
        fs::write(dir.path().join("tun"), b"").unwrap();
        fs::create_dir_all(dir.path().join("fs")).unwrap();
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn p(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    /// Write an executable shell script standing in for the hypervisor
    pub fn fake_hypervisor(&self, script: &str) -> PathBuf {
        let bin = self.p("fake-firecracker");
        fs::write(&bin, format!("#!/bin/sh\n{}\n", script)).unwrap();
        fs::set_permissions(&bin, fs::Permissions::from_mode(0o755)).unwrap();
        bin
    }

    /// Resolve settings pointing into the sandbox, plus `extra` flags
    pub fn run_config(&self, extra: &[&str]) -> RunConfig {
        let s = |rel: &str| self.p(rel).to_string_lossy().into_owned();
        let mut argv = vec![
            "fcnest".to_string(),
            "--kernel".into(),
            s("images/vmlinux"),
            "--rootfs".into(),
            s("images/rootfs.ext4"),
            "--workspace".into(),
            s("workspace"),
            "--run-dir".into(),
            s("run"),
            "--kvm-device".into(),
            s("kvm"),
            "--firecracker".into(),
            s("fake-firecracker"),
            "--boot-wait-secs".into(),
            "0".into(),
        ];
        argv.extend(extra.iter().map(|a| a.to_string()));
        TestCli::try_parse_from(argv).unwrap().settings.resolve().unwrap()
    }
}

// ---------------------------------------------------------------------------
// Guest
// ---------------------------------------------------------------------------

/// How the fake engine daemon behaves when launched directly
#[derive(Debug, Clone)]
pub enum DaemonBehavior {
    /// Creates the socket and starts answering
    Serves,
    /// Writes `log` and exits with `code` before any socket appears
    Crashes { code: i32, log: Vec<String> },
    /// Runs but never creates a socket
    Hangs,
}

#[derive(Debug, Default)]
struct GuestState {
    engine_running: bool,
    address_after: Option<usize>,
    addr_queries: usize,
    engine_queries: usize,
    spawns: usize,
}

/// Guest command runner
pub struct ScriptedGuest {
    pub address: Option<String>,
    pub resolved_active: bool,
    /// Units whose `systemctl start` succeeds
    pub startable_units: Vec<String>,
    /// Units that bring the engine up when started
    pub engine_units: Vec<String>,
    /// `mount` succeeds if any argument equals one of these
    pub mount_allowed: Vec<String>,
    pub daemon: DaemonBehavior,
    pub engine_socket: PathBuf,
    state: Mutex<GuestState>,
    exit_checks: Arc<AtomicUsize>,
    log: Mutex<Vec<String>>,
}

impl ScriptedGuest {
    pub fn new(engine_socket: &Path) -> Self {
        Self {
            address: Some("172.16.0.2/24".to_string()),
            resolved_active: false,
            startable_units: Vec::new(),
            engine_units: vec!["docker".to_string()],
            mount_allowed: Vec::new(),
            daemon: DaemonBehavior::Hangs,
            engine_socket: engine_socket.to_path_buf(),
            state: Mutex::new(GuestState::default()),
            exit_checks: Arc::new(AtomicUsize::new(0)),
            log: Mutex::new(Vec::new()),
        }
    }

    /// The address only shows up on the `n`th query
    pub fn address_after(self, n: usize) -> Self {
        self.state.lock().unwrap().address_after = Some(n);
        self
    }

    pub fn addr_queries(&self) -> usize {
        self.state.lock().unwrap().addr_queries
    }

    pub fn engine_queries(&self) -> usize {
        self.state.lock().unwrap().engine_queries
    }

    pub fn spawns(&self) -> usize {
        self.state.lock().unwrap().spawns
    }

    /// How many times the direct daemon's exit status was checked
    pub fn daemon_exit_checks(&self) -> usize {
        self.exit_checks.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl CommandRunner for ScriptedGuest {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
        self.log.lock().unwrap().push(display_command(program, args));
        let mut state = self.state.lock().unwrap();

        let out = match (program, args) {
            ("ip", ["-4", "-o", "addr", "show", "dev", dev]) => {
                state.addr_queries += 1;
                let queries = state.addr_queries;
                let visible = state.address_after.map_or(true, |n| queries >= n);
                match (&self.address, visible) {
                    (Some(cidr), true) => CommandOutput::ok(format!(
                        "2: {}    inet {} brd 172.16.0.255 scope global {}\n",
                        dev, cidr, dev
                    )),
                    _ => CommandOutput::ok(""),
                }
            }
            ("systemctl", ["is-active", "--quiet", "systemd-resolved"]) => {
                if self.resolved_active {
                    CommandOutput::ok("")
                } else {
                    CommandOutput::failed(3, "")
                }
            }
            ("systemctl", ["is-active", unit]) => {
                let active = self.startable_units.iter().any(|u| u == unit) && state.engine_running;
                if active {
                    CommandOutput::ok("active\n")
                } else {
                    CommandOutput {
                        code: Some(3),
                        stdout: "failed\n".to_string(),
                        stderr: String::new(),
                    }
                }
            }
            ("systemctl", ["start", unit]) => {
                if self.startable_units.iter().any(|u| u == unit) {
                    if self.engine_units.iter().any(|u| u == unit) {
                        state.engine_running = true;
                    }
                    CommandOutput::ok("")
                } else {
                    CommandOutput::failed(
                        1,
                        format!(
                            "Job for {}.service failed because the control process \
                             exited with error code.",
                            unit
                        ),
                    )
                }
            }
            ("docker", ["info", ..]) => {
                state.engine_queries += 1;
                if state.engine_running {
                    CommandOutput::ok("24.0.7\n")
                } else {
                    CommandOutput::failed(1, "Cannot connect to the Docker daemon")
                }
            }
            ("mount", args) => {
                if args.iter().any(|a| self.mount_allowed.iter().any(|m| m == a)) {
                    CommandOutput::ok("")
                } else {
                    CommandOutput::failed(32, "mount: permission denied")
                }
            }
            ("journalctl", _) => CommandOutput::ok("-- No entries --\n"),
            ("modprobe", _) => {
                CommandOutput::failed(1, "modprobe: FATAL: Module overlay not found")
            }
            ("usermod", _) => CommandOutput::ok(""),
            _ => CommandOutput::failed(127, "command not found"),
        };
        Ok(out)
    }

    fn spawn_logged(
        &self,
        program: &str,
        args: &[&str],
        log_path: &Path,
    ) -> io::Result<Box<dyn BackgroundProcess>> {
        self.log.lock().unwrap().push(display_command(program, args));
        let mut state = self.state.lock().unwrap();
        state.spawns += 1;

        let exit = match &self.daemon {
            DaemonBehavior::Serves => {
                fs::write(&self.engine_socket, b"")?;
                state.engine_running = true;
                None
            }
            DaemonBehavior::Crashes { code, log } => {
                let mut body = log.join("\n");
                body.push('\n');
                fs::write(log_path, body)?;
                Some(*code)
            }
            DaemonBehavior::Hangs => None,
        };
        Ok(Box::new(FakeDaemon {
            exit,
            checks: Arc::clone(&self.exit_checks),
        }))
    }
}

struct FakeDaemon {
    exit: Option<i32>,
    checks: Arc<AtomicUsize>,
}

impl BackgroundProcess for FakeDaemon {
    fn id(&self) -> u32 {
        4242
    }

    fn try_exit_code(&mut self) -> io::Result<Option<i32>> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        Ok(self.exit)
    }
}

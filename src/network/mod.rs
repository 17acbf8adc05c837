//! Host network plumbing for the VM
//!
//! Creates the TAP device, addresses it, enables forwarding and installs NAT
//! so the guest reaches external networks through the host's default route.
//! Every step is idempotent: running the provisioner twice with the same
//! endpoint leaves interfaces and rules exactly as a single run would.

pub mod firewall;

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::NetworkEndpoint;
use crate::error::{Error, Result};
use crate::exec::{run_checked, run_succeeds, CommandRunner};

pub use firewall::{FirewallRule, RuleOutcome};

/// Default location of the TUN/TAP clone device
pub const TUN_DEVICE: &str = "/dev/net/tun";

/// What the provisioner did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkReport {
    pub tap_created: bool,
    pub address_assigned: bool,
    pub ip_forward_enabled: bool,
    /// Uplink the NAT rules point at, `None` if no default route was found
    pub nat_interface: Option<String>,
    pub rules_appended: usize,
}

impl NetworkReport {
    /// Uplink name for display; `"none"` when NAT was skipped
    pub fn nat_path(&self) -> &str {
        self.nat_interface.as_deref().unwrap_or("none")
    }
}

/// Sets up and tears down the TAP/NAT path for one endpoint
pub struct NetworkProvisioner<'a> {
    runner: &'a dyn CommandRunner,
    tun_device: PathBuf,
}

impl<'a> NetworkProvisioner<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self {
            runner,
            tun_device: PathBuf::from(TUN_DEVICE),
        }
    }

    /// Use a different TUN clone device path
    pub fn with_tun_device(mut self, path: impl Into<PathBuf>) -> Self {
        self.tun_device = path.into();
        self
    }

    /// Bring up the TAP device and NAT path
    pub fn provision(&self, endpoint: &NetworkEndpoint) -> Result<NetworkReport> {
        let tap = endpoint.tap_device.as_str();
        let mut report = NetworkReport::default();

        ensure_tun_device(&self.tun_device)?;

        if self.link_exists(tap) {
            debug!(tap, "TAP device already exists");
        } else {
            self.tolerate_exists(run_checked(
                self.runner,
                "ip",
                &["tuntap", "add", "dev", tap, "mode", "tap"],
            ))?;
            report.tap_created = true;
        }

        let cidr = endpoint.tap_cidr();
        if self.has_address(tap, &cidr) {
            debug!(tap, %cidr, "address already assigned");
        } else {
            self.tolerate_exists(run_checked(
                self.runner,
                "ip",
                &["addr", "add", &cidr, "dev", tap],
            ))?;
            report.address_assigned = true;
        }

        run_checked(self.runner, "ip", &["link", "set", "dev", tap, "up"])?;

        report.ip_forward_enabled =
            run_succeeds(
                self.runner,
                "sysctl",
                &["-q", "-w", "net.ipv4.ip_forward=1"],
            );
        if !report.ip_forward_enabled {
            warn!("could not enable IPv4 forwarding; guest traffic may not leave the host");
        }

        report.nat_interface = self.default_route_device();
        match &report.nat_interface {
            Some(uplink) => {
                for rule in firewall::nat_rules(&endpoint.subnet(), tap, uplink) {
                    if rule.ensure(self.runner)? == RuleOutcome::Appended {
                        report.rules_appended += 1;
                    }
                }
            }
            None => info!("no default route interface found; NAT via none"),
        }

        for rule in firewall::tap_rules(tap) {
            if rule.ensure(self.runner)? == RuleOutcome::Appended {
                report.rules_appended += 1;
            }
        }

        info!(
            tap,
            address = %cidr,
            vm = %endpoint.vm_address,
            nat = report.nat_path(),
            "network ready"
        );
        Ok(report)
    }

    /// Delete the TAP device; returns whether it was removed
    pub fn teardown(&self, tap: &str) -> bool {
        if !self.link_exists(tap) {
            return false;
        }
        let removed = run_succeeds(self.runner, "ip", &["link", "del", "dev", tap]);
        if removed {
            info!(tap, "TAP device removed");
        } else {
            warn!(tap, "failed to remove TAP device");
        }
        removed
    }

    fn link_exists(&self, tap: &str) -> bool {
        run_succeeds(self.runner, "ip", &["link", "show", "dev", tap])
    }

    fn has_address(&self, tap: &str, cidr: &str) -> bool {
        match self.runner.run("ip", &["-4", "addr", "show", "dev", tap]) {
            Ok(out) if out.success() => out
                .stdout
                .split_whitespace()
                .collect::<Vec<_>>()
                .windows(2)
                .any(|w| w[0] == "inet" && w[1] == cidr),
            _ => false,
        }
    }

    fn default_route_device(&self) -> Option<String> {
        let out = self.runner.run("ip", &["route", "show", "default"]).ok()?;
        if !out.success() {
            return None;
        }
        firewall::parse_default_route_device(&out.stdout)
    }

    fn tolerate_exists(&self, result: Result<String>) -> Result<()> {
        match result {
            Ok(_) => Ok(()),
            Err(Error::CommandFailed { ref stderr, .. }) if is_already_exists(stderr) => {
                debug!(%stderr, "treating as already configured");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn is_already_exists(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("file exists") || stderr.contains("already") || stderr.contains("resource busy")
}

/// Create the TUN clone device node (char 10:200) if it is missing
pub fn ensure_tun_device(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }

    use nix::sys::stat::{makedev, mknod, Mode, SFlag};

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    mknod(
        path,
        SFlag::S_IFCHR,
        Mode::from_bits_truncate(0o666),
        makedev(10, 200),
    )
    .map_err(|errno| Error::Io(io::Error::from(errno)))?;

    info!(path = %path.display(), "created TUN device node");
    Ok(())
}

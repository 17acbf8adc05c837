//! Guest network wait and resolver setup

use std::convert::Infallible;
use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::os::unix::fs::symlink;
use std::path::Path;

use tracing::{info, warn};

use crate::exec::{run_succeeds, CommandRunner};
use crate::retry::{poll, Check, PollPolicy};

/// How name resolution was configured
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsMode {
    /// resolv.conf points at the local resolver stub
    LocalResolver,
    /// resolv.conf lists fixed public nameservers
    Static(Vec<String>),
    /// Neither could be written
    Unconfigured(String),
}

/// Pull the first IPv4 address out of `ip -4 -o addr show` output
///
/// ```text
/// 2: eth0    inet 172.16.0.2/24 brd 172.16.0.255 scope global eth0\ ...
/// ```
pub fn parse_inet_address(output: &str) -> Option<Ipv4Addr> {
    let mut tokens = output.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "inet" {
            let cidr = tokens.next()?;
            let addr = cidr.split('/').next()?;
            return addr.parse().ok();
        }
    }
    None
}

/// Wait for `interface` to carry an IPv4 address
///
/// Returns `None` when the policy runs out; the caller carries on regardless.
pub async fn wait_for_address(
    runner: &dyn CommandRunner,
    interface: &str,
    policy: PollPolicy,
) -> Option<Ipv4Addr> {
    let result = poll(policy, |_| {
        let check = match runner.run("ip", &["-4", "-o", "addr", "show", "dev", interface]) {
            Ok(out) if out.success() => match parse_inet_address(&out.stdout) {
                Some(addr) => Check::<_, Infallible>::Ready(addr),
                None => Check::Pending,
            },
            _ => Check::Pending,
        };
        async move { check }
    })
    .await;

    match result {
        Ok(addr) => {
            info!(%interface, %addr, "network is up");
            Some(addr)
        }
        Err(e) => {
            warn!(%interface, error = %e, "no IPv4 address; continuing without network");
            None
        }
    }
}

/// Point resolv.conf at the local resolver if it is active, otherwise write
/// static nameservers
pub fn configure_dns(
    runner: &dyn CommandRunner,
    resolv_conf: &Path,
    resolver_stub: &Path,
    nameservers: &[String],
) -> DnsMode {
    if run_succeeds(
        runner,
        "systemctl",
        &["is-active", "--quiet", "systemd-resolved"],
    ) {
        match link_resolver(resolv_conf, resolver_stub) {
            Ok(()) => {
                info!(stub = %resolver_stub.display(), "using local resolver");
                return DnsMode::LocalResolver;
            }
            Err(e) => warn!(error = %e, "could not link resolver stub; writing static nameservers"),
        }
    }

    match write_static(resolv_conf, nameservers) {
        Ok(()) => {
            info!(nameservers = ?nameservers, "wrote static resolv.conf");
            DnsMode::Static(nameservers.to_vec())
        }
        Err(e) => {
            warn!(error = %e, "could not write resolv.conf");
            DnsMode::Unconfigured(e.to_string())
        }
    }
}

fn link_resolver(resolv_conf: &Path, stub: &Path) -> io::Result<()> {
    if fs::read_link(resolv_conf).ok().as_deref() == Some(stub) {
        return Ok(());
    }
    remove_if_present(resolv_conf)?;
    symlink(stub, resolv_conf)
}

fn write_static(resolv_conf: &Path, nameservers: &[String]) -> io::Result<()> {
    // a dangling link to an inactive stub would swallow the write
    remove_if_present(resolv_conf)?;
    if let Some(parent) = resolv_conf.parent() {
        fs::create_dir_all(parent)?;
    }
    let body: String = nameservers
        .iter()
        .map(|ns| format!("nameserver {}\n", ns))
        .collect();
    fs::write(resolv_conf, body)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

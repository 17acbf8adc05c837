//! Guest bootstrap - runs once inside the Firecracker VM at boot
//!
//! Started by `fcnest-bootstrap.service`. Always exits 0 so a degraded boot
//! still reaches a login prompt; the console banner and diagnostics tell the
//! user what did not come up.

use std::path::PathBuf;

use clap::Parser;

use fcnest::config::LogLevel;
use fcnest::guest::{GuestBootstrap, GuestLayout, GuestOptions};
use fcnest::logging::init_tracing;
use fcnest::retry::PollPolicy;
use fcnest::SystemRunner;

#[derive(Debug, Parser)]
#[command(
    name = "fcnest-guest-init",
    version,
    about = "Bring up the container engine inside the VM"
)]
struct Args {
    /// Primary network interface
    #[arg(long, env = "FCNEST_GUEST_IFACE", default_value = "eth0")]
    interface: String,

    /// Unprivileged user that owns the workspace
    #[arg(long, env = "FCNEST_GUEST_USER", default_value = "dev")]
    user: String,

    #[arg(long, env = "FCNEST_GUEST_UID", default_value_t = 1000)]
    uid: u32,

    #[arg(long, env = "FCNEST_GUEST_GID", default_value_t = 1000)]
    gid: u32,

    /// Workspace mount point
    #[arg(long, env = "FCNEST_GUEST_WORKSPACE", default_value = "/workspace")]
    workspace: PathBuf,

    /// Attempts (1s apart) for each wait: network, engine socket, engine readiness
    #[arg(long, env = "FCNEST_GUEST_POLL_ATTEMPTS", default_value_t = 30,
          value_parser = clap::value_parser!(u32).range(1..))]
    poll_attempts: u32,

    /// Lines of logs and journal in the failure report
    #[arg(long, env = "FCNEST_GUEST_DIAG_LINES", default_value_t = 20)]
    diagnostic_lines: usize,

    #[arg(long, env = "FCNEST_LOG_LEVEL", value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing("fcnest-guest-init", args.log_level, false);

    println!("[GUEST] fcnest bootstrap starting");
    if !nix::unistd::Uid::effective().is_root() {
        tracing::warn!("not running as root; mounts and service starts will likely fail");
    }

    let policy = PollPolicy::seconds(args.poll_attempts);
    let layout = GuestLayout {
        workspace_dir: args.workspace,
        ..GuestLayout::default()
    };
    let options = GuestOptions {
        interface: args.interface,
        user: args.user,
        uid: args.uid,
        gid: args.gid,
        network_wait: policy,
        socket_wait: policy,
        readiness_wait: policy,
        diagnostic_lines: args.diagnostic_lines,
        ..GuestOptions::default()
    };

    let runner = SystemRunner;
    let report = GuestBootstrap::new(&runner, layout, options).run().await;

    if report.engine_ready() {
        println!("[GUEST] bootstrap complete");
    } else {
        println!("[GUEST] bootstrap finished without a container engine");
    }
}

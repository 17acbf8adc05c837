//! One-shot bootstrap run

use std::convert::Infallible;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use tracing::{info, warn};

use crate::exec::{run_succeeds, CommandRunner};
use crate::guest::engine::{self, EngineStarter, START_TIERS};
use crate::guest::{
    cgroups, network, probe, CgroupMode, DiagnosticBundle, DnsMode, EngineState, GuestLayout,
    GuestOptions, KernelFeatures, StartTier, StorageDriver, TierFailure,
};
use crate::retry::{poll, Check};
use crate::workspace::sync::chown_tree;

/// Directories created under the user's home
pub const HOME_SUBDIRS: &[&str] = &[".docker", ".cache", ".local/bin"];

/// What the bootstrap run achieved
#[derive(Debug, Clone)]
pub struct BootstrapReport {
    /// Guest address, `None` if the network wait ran out
    pub address: Option<Ipv4Addr>,
    pub dns: DnsMode,
    pub features: KernelFeatures,
    pub cgroups: CgroupMode,
    pub storage_driver: StorageDriver,
    /// Tier after which the engine answered
    pub started_by: Option<StartTier>,
    pub tier_failures: Vec<TierFailure>,
    pub engine: EngineState,
    /// Present only when the engine never became ready
    pub diagnostics: Option<DiagnosticBundle>,
}

impl BootstrapReport {
    pub fn engine_ready(&self) -> bool {
        matches!(self.engine, EngineState::Ready { .. })
    }

    /// Console status banner
    pub fn banner(&self, options: &GuestOptions, layout: &GuestLayout) -> String {
        let address = self
            .address
            .map(|a| a.to_string())
            .unwrap_or_else(|| "not configured".to_string());
        let dns = match &self.dns {
            DnsMode::LocalResolver => "local resolver".to_string(),
            DnsMode::Static(servers) => servers.join(", "),
            DnsMode::Unconfigured(_) => "not configured".to_string(),
        };
        let cgroups = if self.cgroups.is_unified() { "v2" } else { "v1 (legacy)" };

        let mut lines = vec![
            "========================================".to_string(),
            " fcnest guest ready".to_string(),
            "========================================".to_string(),
            format!(" address:    {} ({})", address, options.interface),
            format!(" dns:        {}", dns),
            format!(" cgroups:    {}", cgroups),
            format!(" storage:    {}", self.storage_driver),
            format!(" engine:     {}", self.engine),
            format!(" workspace:  {}", layout.workspace_dir.display()),
            format!(
                " user:       {} ({}:{})",
                options.user,
                options.uid,
                options.gid
            ),
        ];
        if !self.engine_ready() {
            lines.push(" engine did not start; see diagnostics above".to_string());
        }
        lines.push("========================================".to_string());
        lines.join("\n")
    }
}

/// Runs the bootstrap steps against a guest
pub struct GuestBootstrap<'a> {
    runner: &'a dyn CommandRunner,
    layout: GuestLayout,
    options: GuestOptions,
    tiers: Vec<StartTier>,
}

impl<'a> GuestBootstrap<'a> {
    pub fn new(runner: &'a dyn CommandRunner, layout: GuestLayout, options: GuestOptions) -> Self {
        Self {
            runner,
            layout,
            options,
            tiers: START_TIERS.to_vec(),
        }
    }

    /// Replace the default start tiers
    pub fn with_tiers(mut self, tiers: Vec<StartTier>) -> Self {
        self.tiers = tiers;
        self
    }

    pub fn layout(&self) -> &GuestLayout {
        &self.layout
    }

    pub fn options(&self) -> &GuestOptions {
        &self.options
    }

    /// Run every step once
    ///
    /// Never fails: each step degrades to a warning and the next step runs.
    pub async fn run(&self) -> BootstrapReport {
        let layout = &self.layout;
        let opts = &self.options;

        let address =
            network::wait_for_address(self.runner, &opts.interface, opts.network_wait).await;
        let dns = network::configure_dns(
            self.runner,
            &layout.resolv_conf,
            &layout.resolved_stub,
            &opts.nameservers,
        );
        let features = probe::probe(self.runner, &layout.proc_filesystems, &layout.proc_ns_dir);
        let cgroups = cgroups::setup(self.runner, &layout.cgroup_root);

        let storage_driver = StorageDriver::for_kernel(features.overlay);
        if let Err(e) = engine::write_daemon_config(&layout.daemon_config, storage_driver) {
            warn!(error = %e, "could not write engine config");
        }

        let starter = EngineStarter {
            runner: self.runner,
            socket: &layout.engine_socket,
            log_path: &layout.engine_log,
            socket_wait: opts.socket_wait,
            log_lines: opts.diagnostic_lines,
        };
        let attempts = starter.start(&self.tiers).await;

        let (engine, diagnostics) = match self.wait_ready().await {
            Some(version) => (EngineState::Ready { version }, None),
            None => {
                let bundle = DiagnosticBundle::collect(
                    self.runner,
                    &layout.engine_socket,
                    &layout.engine_log,
                    attempts.failures.clone(),
                    opts.diagnostic_lines,
                );
                println!("{}", bundle);
                (EngineState::Failed, Some(bundle))
            }
        };

        self.finalize();

        let report = BootstrapReport {
            address,
            dns,
            features,
            cgroups,
            storage_driver,
            started_by: attempts.succeeded,
            tier_failures: attempts.failures,
            engine,
            diagnostics,
        };
        println!("{}", report.banner(opts, layout));
        report
    }

    /// Poll the liveness query; `Some(version)` once the engine answers
    async fn wait_ready(&self) -> Option<Option<String>> {
        let runner = self.runner;
        let result = poll(self.options.readiness_wait, |_| {
            let check = match engine::query_engine(runner) {
                Some(version) if version.is_empty() => Check::<_, Infallible>::Ready(None),
                Some(version) => Check::Ready(Some(version)),
                None => Check::Pending,
            };
            async move { check }
        })
        .await;

        match result {
            Ok(version) => {
                info!(
                    version = version.as_deref().unwrap_or("unknown"),
                    "container engine ready"
                );
                Some(version)
            }
            Err(e) => {
                warn!(error = %e, "container engine never became ready");
                None
            }
        }
    }

    /// Fix ownership of the workspace and home, create home subdirectories
    pub fn finalize(&self) {
        let opts = &self.options;
        let home = opts.home_dir(&self.layout);

        for dir in HOME_SUBDIRS {
            if let Err(e) = fs::create_dir_all(home.join(dir)) {
                warn!(dir = %home.join(dir).display(), error = %e, "cannot create directory");
            }
        }

        self.chown(&self.layout.workspace_dir);
        self.chown(&home);

        if !run_succeeds(self.runner, "usermod", &["-aG", "docker", &opts.user]) {
            warn!(user = %opts.user, "could not add user to docker group");
        }
        info!(user = %opts.user, "environment finalized");
    }

    fn chown(&self, path: &Path) {
        if !path.exists() {
            warn!(path = %path.display(), "not present; ownership unchanged");
            return;
        }
        if let Err(e) = chown_tree(path, self.options.uid, self.options.gid) {
            warn!(path = %path.display(), error = %e, "could not fix ownership");
        }
    }
}

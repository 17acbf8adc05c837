//! Container engine configuration and startup
//!
//! # Start tiers
//!
//! ```text
//! ServiceManager("containerd")  ── systemctl start containerd
//! ServiceManager("docker")      ── systemctl start docker
//! DirectDaemon                  ── dockerd in the background, logs to a file
//! ```
//!
//! Tiers run in order and stop at the first one after which the engine
//! answers a liveness query. A failing tier is recorded and the next one is
//! tried.

use std::fmt;
use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::exec::{display_command, BackgroundProcess, CommandRunner};
use crate::retry::{poll, Check, PollError, PollPolicy};

/// Binary started by the direct tier
pub const DAEMON_BINARY: &str = "dockerd";

/// Graph driver written to the engine config
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageDriver {
    Overlay2,
    Vfs,
}

impl StorageDriver {
    /// Overlay when the kernel has it, otherwise the copy-based driver
    pub fn for_kernel(overlay_available: bool) -> Self {
        if overlay_available {
            StorageDriver::Overlay2
        } else {
            StorageDriver::Vfs
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageDriver::Overlay2 => "overlay2",
            StorageDriver::Vfs => "vfs",
        }
    }
}

impl fmt::Display for StorageDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings fcnest owns in the engine's `daemon.json`
pub fn managed_settings(driver: StorageDriver) -> Map<String, Value> {
    let value = json!({
        "storage-driver": driver.as_str(),
        "log-driver": "json-file",
        "log-opts": {
            "max-size": "10m",
            "max-file": "3"
        },
        "iptables": true,
        "ip-forward": true
    });
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Overlay the managed settings onto an existing document
///
/// Keys fcnest does not manage are kept. A document that is not a JSON
/// object is replaced.
pub fn merge_daemon_config(existing: Option<&str>, driver: StorageDriver) -> Value {
    let mut base = match existing.map(serde_json::from_str::<Value>) {
        Some(Ok(Value::Object(map))) => map,
        Some(Ok(_)) => {
            warn!("engine config is not a JSON object; replacing it");
            Map::new()
        }
        Some(Err(e)) => {
            warn!(error = %e, "engine config is not valid JSON; replacing it");
            Map::new()
        }
        None => Map::new(),
    };
    base.extend(managed_settings(driver));
    Value::Object(base)
}

/// Write the merged engine config to `path`
pub fn write_daemon_config(path: &Path, driver: StorageDriver) -> Result<()> {
    let existing = match fs::read_to_string(path) {
        Ok(contents) => Some(contents),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };
    let merged = merge_daemon_config(existing.as_deref(), driver);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut body = serde_json::to_string_pretty(&merged)?;
    body.push('\n');
    fs::write(path, body)?;
    info!(path = %path.display(), storage_driver = %driver, "engine config written");
    Ok(())
}

/// One way of getting the engine running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartTier {
    /// Ask the service manager to start a unit
    ServiceManager(&'static str),
    /// Launch the daemon binary ourselves
    DirectDaemon,
}

/// Default tier order
pub const START_TIERS: [StartTier; 3] = [
    StartTier::ServiceManager("containerd"),
    StartTier::ServiceManager("docker"),
    StartTier::DirectDaemon,
];

impl fmt::Display for StartTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartTier::ServiceManager(unit) => write!(f, "systemctl start {}", unit),
            StartTier::DirectDaemon => write!(f, "direct {}", DAEMON_BINARY),
        }
    }
}

/// Why a tier did not produce a running engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierFailure {
    pub tier: StartTier,
    pub reason: String,
    /// Tail of the daemon log, for the direct tier
    pub log_tail: Vec<String>,
}

impl fmt::Display for TierFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.tier, self.reason)
    }
}

/// Engine status at the end of the sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    /// Answering liveness queries
    Ready { version: Option<String> },
    Failed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Ready { version: Some(v) } => write!(f, "ready ({})", v),
            EngineState::Ready { version: None } => f.write_str("ready"),
            EngineState::Failed => f.write_str("failed"),
        }
    }
}

/// Liveness query; returns the server version when the engine answers
pub fn query_engine(runner: &dyn CommandRunner) -> Option<String> {
    match runner.run("docker", &["info", "--format", "{{.ServerVersion}}"]) {
        Ok(out) if out.success() => Some(out.stdout.trim().to_string()),
        _ => None,
    }
}

/// Last `n` lines of a log file; empty if it cannot be read
pub fn tail_lines(path: &Path, n: usize) -> Vec<String> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(_) => return Vec::new(),
    };
    let lines: Vec<String> = BufReader::new(file).lines().map_while(|l| l.ok()).collect();
    let skip = lines.len().saturating_sub(n);
    lines.into_iter().skip(skip).collect()
}

/// Drives the start tiers
pub struct EngineStarter<'a> {
    pub runner: &'a dyn CommandRunner,
    pub socket: &'a Path,
    pub log_path: &'a Path,
    pub socket_wait: PollPolicy,
    pub log_lines: usize,
}

/// Result of walking the tiers
#[derive(Debug, Default)]
pub struct StartAttempts {
    /// Tier after which the engine answered, if any
    pub succeeded: Option<StartTier>,
    pub failures: Vec<TierFailure>,
}

impl EngineStarter<'_> {
    /// Try each tier in order until the engine answers
    pub async fn start(&self, tiers: &[StartTier]) -> StartAttempts {
        let mut attempts = StartAttempts::default();

        for &tier in tiers {
            info!(%tier, "starting container engine");
            match self.attempt(tier).await {
                Ok(()) => {
                    if query_engine(self.runner).is_some() {
                        info!(%tier, "container engine is answering");
                        attempts.succeeded = Some(tier);
                        break;
                    }
                    debug!(%tier, "tier completed but engine is not answering yet");
                }
                Err(failure) => {
                    warn!(%failure, last_log = ?failure.log_tail.last(), "start tier failed");
                    attempts.failures.push(failure);
                }
            }
        }
        attempts
    }

    async fn attempt(&self, tier: StartTier) -> std::result::Result<(), TierFailure> {
        match tier {
            StartTier::ServiceManager(unit) => self.start_unit(tier, unit),
            StartTier::DirectDaemon => self.start_direct(tier).await,
        }
    }

    fn start_unit(&self, tier: StartTier, unit: &str) -> std::result::Result<(), TierFailure> {
        let args = ["start", unit];
        let reason = match self.runner.run("systemctl", &args) {
            Ok(out) if out.success() => return Ok(()),
            Ok(out) => format!(
                "{} failed: {}",
                display_command("systemctl", &args),
                out.stderr.trim()
            ),
            Err(e) => format!("systemctl unavailable: {}", e),
        };
        Err(TierFailure {
            tier,
            reason,
            log_tail: Vec::new(),
        })
    }

    async fn start_direct(&self, tier: StartTier) -> std::result::Result<(), TierFailure> {
        let failure = |reason: String| TierFailure {
            tier,
            reason,
            log_tail: tail_lines(self.log_path, self.log_lines),
        };

        if let Some(parent) = self.log_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let mut daemon: Box<dyn BackgroundProcess> = self
            .runner
            .spawn_logged(DAEMON_BINARY, &[], self.log_path)
            .map_err(|e| failure(format!("could not launch {}: {}", DAEMON_BINARY, e)))?;
        info!(pid = daemon.id(), log = %self.log_path.display(), "engine daemon launched");

        let socket = self.socket;
        let waited = poll(self.socket_wait, |_| {
            let check = if socket.exists() {
                Check::Ready(())
            } else {
                match daemon.try_exit_code() {
                    Ok(Some(code)) => Check::Abort(code),
                    Ok(None) => Check::Pending,
                    Err(e) => {
                        debug!(error = %e, "cannot query daemon status");
                        Check::Pending
                    }
                }
            };
            async move { check }
        })
        .await;

        match waited {
            Ok(()) => Ok(()),
            Err(PollError::Aborted(code)) => Err(failure(format!(
                "{} exited with status {}",
                DAEMON_BINARY, code
            ))),
            Err(PollError::Exhausted { waited, .. }) => Err(failure(format!(
                "socket {} did not appear within {:?}",
                socket.display(),
                waited
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_preserves_unmanaged_keys() {
        let existing =
            r#"{"registry-mirrors": ["https://mirror.local"], "storage-driver": "devicemapper"}"#;
        let merged = merge_daemon_config(Some(existing), StorageDriver::Overlay2);

        assert_eq!(merged["registry-mirrors"][0], "https://mirror.local");
        assert_eq!(merged["storage-driver"], "overlay2");
        assert_eq!(merged["log-opts"]["max-size"], "10m");
        assert_eq!(merged["log-opts"]["max-file"], "3");
        assert_eq!(merged["iptables"], true);
        assert_eq!(merged["ip-forward"], true);
    }

    #[test]
    fn test_merge_replaces_garbage() {
        let merged = merge_daemon_config(Some("not json"), StorageDriver::Vfs);
        assert_eq!(merged["storage-driver"], "vfs");
        assert_eq!(merged["log-driver"], "json-file");
    }

    #[test]
    fn test_write_daemon_config_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docker/daemon.json");
        write_daemon_config(&path, StorageDriver::Overlay2).unwrap();
        let doc: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["storage-driver"], "overlay2");
    }

    #[test]
    fn test_storage_driver_selection() {
        assert_eq!(StorageDriver::for_kernel(true), StorageDriver::Overlay2);
        assert_eq!(StorageDriver::for_kernel(false), StorageDriver::Vfs);
    }

    #[test]
    fn test_tail_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("d.log");
        fs::write(&log, "a\nb\nc\nd\n").unwrap();
        assert_eq!(tail_lines(&log, 2), vec!["c", "d"]);
        assert_eq!(tail_lines(&log, 10).len(), 4);
        assert!(tail_lines(&dir.path().join("missing"), 5).is_empty());
    }

    #[test]
    fn test_tier_order() {
        assert_eq!(START_TIERS[0].to_string(), "systemctl start containerd");
        assert_eq!(START_TIERS[2], StartTier::DirectDaemon);
    }
}

//! fcnest - run a nested container engine inside a Firecracker microVM
//!
//! The host side validates prerequisites, wires up a TAP device with NAT,
//! packs a host directory into a block-device image, renders the VM config,
//! supervises the Firecracker process and always cleans up afterwards. The
//! guest side (`fcnest-guest-init`) brings up networking, cgroups and the
//! container engine inside the VM.
//!
//! # Modules
//!
//! - `config` - CLI/environment settings resolved into a `RunConfig`
//! - `orchestrator` - phase sequencing, pre-flight checks, cleanup
//! - `network` - TAP device, forwarding and NAT rules
//! - `workspace` - workspace image materialize/reconcile
//! - `vm` - config rendering, API client, process supervision
//! - `guest` - bootstrap sequencer that runs inside the VM
//! - `exec` / `retry` - command execution and bounded polling primitives
//!
//! # Quick Start
//!
//! ```ignore
//! use fcnest::{Ext4Tool, Orchestrator, SystemRunner};
//!
//! let runner = SystemRunner;
//! let fs_tool = Ext4Tool::new(&runner);
//! let outcome = Orchestrator::new(run_config, &runner, &fs_tool).run().await?;
//! std::process::exit(outcome.exit_code());
//! ```

pub mod config;
pub mod error;
pub mod exec;
pub mod guest;
pub mod logging;
pub mod network;
pub mod orchestrator;
pub mod retry;
pub mod vm;
pub mod workspace;

pub use config::{ConsoleMode, LogLevel, RunConfig, Settings};
pub use error::{Error, Result};
pub use exec::{CommandRunner, SystemRunner};
pub use orchestrator::{Orchestrator, Phase, RunOutcome};
pub use workspace::{Ext4Tool, FilesystemTool};

//! Firecracker VM management module
//!
//! This module provides abstractions for running the Firecracker VM:
//! - VM configuration document (boot source, drives, machine, network)
//! - Firecracker API client
//! - VM lifecycle management (spawn, wait, shutdown)

pub mod config;
pub mod firecracker;
pub mod handle;
pub mod lifecycle;

pub use config::*;
pub use firecracker::FirecrackerClient;
pub use handle::{VmProcess, VmStatus};
pub use lifecycle::*;

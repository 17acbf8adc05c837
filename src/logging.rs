//! Structured logging setup
//!
//! Console logging via `tracing-subscriber`. `RUST_LOG` takes precedence;
//! otherwise the filter follows the configured log level.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogLevel;

/// Filter used when `RUST_LOG` is unset
pub fn default_filter(level: LogLevel) -> String {
    format!("warn,fcnest={}", level.as_filter())
}

/// Initialize the tracing subscriber
///
/// # Arguments
/// * `service_name` - Recorded on the first log line
/// * `level` - Verbosity for fcnest's own targets
/// * `json` - Emit JSON lines instead of human-readable output
///
/// Calling this more than once is harmless; later calls are ignored.
pub fn init_tracing(service_name: &str, level: LogLevel, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(level)));

    let registry = tracing_subscriber::registry().with(filter);

    let result = if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };

    if result.is_ok() {
        tracing::debug!(
            service = service_name,
            version = env!("CARGO_PKG_VERSION"),
            "logging initialized"
        );
    }
}

//! Tracing/logging initialization.
//!
//! Services log JSON to stdout; the operator CLI logs compact text to stderr
//! so its reports on stdout stay machine-readable.

use tracing_subscriber::EnvFilter;

/// Output shape of log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line on stdout.
    #[default]
    Json,
    /// Human-readable lines on stderr.
    Compact,
}

/// Initialize JSON tracing for the process, filtered by `RUST_LOG` (default `info`).
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with(LogFormat::Json, "info");
}

/// Initialize tracing with `format`, using `default_filter` when `RUST_LOG` is unset.
pub fn init_with(format: LogFormat, default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let _ = match format {
        LogFormat::Json => builder
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .try_init(),
        LogFormat::Compact => builder
            .compact()
            .with_writer(std::io::stderr)
            .try_init(),
    };
}

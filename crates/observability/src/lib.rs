//! Tracing, logging, metrics (shared setup).

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Deduplication counters.
pub mod metrics;

pub use metrics::{DeduplicationMetrics, DeduplicationStats};
pub use self::tracing::LogFormat;

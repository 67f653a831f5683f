//! Counters fed by the deduplication strategies.
//!
//! The counters are plain atomics so they can be shared across worker threads
//! without locking; exporters read them through [`DeduplicationMetrics::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Live deduplication counters.
#[derive(Debug, Default)]
pub struct DeduplicationMetrics {
    dropped: AtomicU64,
    skipped: AtomicU64,
    store_errors: AtomicU64,
    wal_failures: AtomicU64,
    flag_failures: AtomicU64,
    rescheduled: AtomicU64,
}

/// Point-in-time copy of [`DeduplicationMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DeduplicationStats {
    /// Duplicates suppressed before enqueue
    pub dropped: u64,
    /// Duplicates not executed after dequeue
    pub skipped: u64,
    /// Key-store failures seen by a strategy
    pub store_errors: u64,
    /// WAL bookkeeping failures (logged, never fatal)
    pub wal_failures: u64,
    /// Reschedule-flag writes or reads that failed (logged, never fatal)
    pub flag_failures: u64,
    /// Jobs re-enqueued by reschedule-once
    pub rescheduled: u64,
}

impl DeduplicationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_wal_failure(&self) {
        self.wal_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flag_failure(&self) {
        self.flag_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rescheduled(&self) {
        self.rescheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DeduplicationStats {
        DeduplicationStats {
            dropped: self.dropped.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            wal_failures: self.wal_failures.load(Ordering::Relaxed),
            flag_failures: self.flag_failures.load(Ordering::Relaxed),
            rescheduled: self.rescheduled.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counters_accumulate_across_threads() {
        let metrics = Arc::new(DeduplicationMetrics::new());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        m.record_dropped();
                    }
                    m.record_skipped();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let stats = metrics.snapshot();
        assert_eq!(stats.dropped, 400);
        assert_eq!(stats.skipped, 4);
        assert_eq!(stats.store_errors, 0);
    }
}

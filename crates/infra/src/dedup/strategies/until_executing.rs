//! Hold the dedup window from schedule until the job finishes successfully.

use chrono::Utc;
use tracing::{info, warn};

use jobguard_core::JobPayload;

use super::{Performed, StrategyContext, attach_latest_wal_locations};
use crate::dedup::error::DedupError;
use crate::dedup::guard::DuplicateJobGuard;
use crate::store::KeyStore;

pub(super) fn perform<S, T, E, F>(
    ctx: &StrategyContext<'_>,
    guard: &mut DuplicateJobGuard<'_, S>,
    job: &mut JobPayload,
    next: F,
) -> Result<Performed<T>, E>
where
    S: KeyStore + ?Sized,
    E: From<DedupError>,
    F: FnOnce(&mut JobPayload) -> Result<T, E>,
{
    attach_latest_wal_locations(ctx, guard, job);

    // Same jid re-claims its own window; anything else means another
    // instance is pending or already ran inside the TTL.
    let expiry = guard.expiry(Utc::now());
    if let Err(e) = guard.check(expiry) {
        ctx.on_store_error("perform", job, e)?;
        return next(job).map(Performed::Executed);
    }

    if guard.is_duplicate()? {
        let duplicate_of = guard
            .existing_jid()
            .cloned()
            .ok_or(DedupError::NotChecked)?;
        ctx.metrics.record_skipped();
        info!(
            jid = %job.jid,
            worker = %job.class,
            duplicate_of = %duplicate_of,
            idempotency_key = %guard.idempotency_key(),
            "skipped duplicate job"
        );
        return Ok(Performed::Skipped { duplicate_of });
    }

    let value = next(job)?;

    if let Err(e) = guard.delete() {
        ctx.metrics.record_store_error();
        warn!(
            jid = %job.jid,
            worker = %job.class,
            error = %e,
            "failed to release duplicate job keys, leaving them to expire"
        );
    }
    Ok(Performed::Executed(value))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use jobguard_core::{Jid, LsnDistance, StaticWorkerRegistry, StrategyKind, WorkerOptions};
    use jobguard_observability::DeduplicationMetrics;

    use super::*;
    use crate::config::{DedupConfig, FailurePolicy};
    use crate::dedup::strategies;
    use crate::store::InMemoryKeyStore;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Dedup(DedupError),
        Job(&'static str),
    }

    impl From<DedupError> for TestError {
        fn from(e: DedupError) -> Self {
            TestError::Dedup(e)
        }
    }

    struct Fixture {
        store: InMemoryKeyStore,
        registry: StaticWorkerRegistry,
        config: DedupConfig,
        metrics: DeduplicationMetrics,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: InMemoryKeyStore::new(),
                registry: StaticWorkerRegistry::new().with("Worker", WorkerOptions::idempotent()),
                config: DedupConfig::default(),
                metrics: DeduplicationMetrics::new(),
            }
        }

        fn ctx(&self, failure_policy: FailurePolicy) -> StrategyContext<'_> {
            StrategyContext {
                failure_policy,
                metrics: &self.metrics,
                rescheduler: None,
            }
        }

        fn perform(
            &self,
            policy: FailurePolicy,
            job: &mut JobPayload,
            result: Result<u32, &'static str>,
        ) -> Result<Performed<u32>, TestError> {
            let mut guard = DuplicateJobGuard::new(
                job,
                &self.store,
                &self.registry,
                &LsnDistance,
                &self.config,
            );
            let ctx = self.ctx(policy);
            strategies::perform(StrategyKind::UntilExecuting, &ctx, &mut guard, job, |_| {
                result.map_err(TestError::Job)
            })
        }
    }

    fn job(jid: &str) -> JobPayload {
        JobPayload::new("Worker", vec![json!(7)]).with_jid(jid)
    }

    #[test]
    fn success_releases_the_window() {
        let fx = Fixture::new();
        let mut job = job("1");

        assert_eq!(
            fx.perform(FailurePolicy::Open, &mut job, Ok(5)).unwrap(),
            Performed::Executed(5)
        );
        assert!(fx.store.is_empty());
    }

    #[test]
    fn failure_keeps_the_window() {
        let fx = Fixture::new();
        let mut job = job("1");

        assert_eq!(
            fx.perform(FailurePolicy::Open, &mut job, Err("boom")),
            Err(TestError::Job("boom"))
        );
        assert!(fx.store.contains(job.idempotency_key.as_deref().unwrap()));
    }

    #[test]
    fn skips_when_another_instance_holds_the_window() {
        let fx = Fixture::new();
        let mut first = job("1");
        let mut guard =
            DuplicateJobGuard::new(&mut first, &fx.store, &fx.registry, &LsnDistance, &fx.config);
        guard.check(Duration::from_secs(60)).unwrap();

        let mut second = job("2");
        let outcome = fx
            .perform(FailurePolicy::Open, &mut second, Ok(1))
            .unwrap();
        assert_eq!(
            outcome,
            Performed::Skipped {
                duplicate_of: Jid::from("1")
            }
        );
        assert_eq!(fx.metrics.snapshot().skipped, 1);
    }

    #[test]
    fn failure_policy_governs_unavailable_store() {
        let fx = Fixture::new();
        fx.store.set_available(false);

        let mut open = job("1");
        assert_eq!(
            fx.perform(FailurePolicy::Open, &mut open, Ok(1)).unwrap(),
            Performed::Executed(1)
        );

        let mut closed = job("2");
        let err = fx
            .perform(FailurePolicy::Closed, &mut closed, Ok(1))
            .unwrap_err();
        assert!(matches!(err, TestError::Dedup(ref e) if e.is_retryable()));
        assert_eq!(fx.metrics.snapshot().store_errors, 2);
    }
}

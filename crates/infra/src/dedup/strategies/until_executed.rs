//! Hold the dedup window through the whole execution, released whatever the
//! outcome. Duplicates dropped meanwhile may trigger one reschedule.

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

    let outcome = next(job);

    // Read before the delete below clears the flag.
    let reschedule = match guard.should_reschedule() {
        Ok(flagged) => flagged,
        Err(e) => {
            ctx.on_flag_error(job, e);
            false
        }
    };

    if let Err(e) = guard.delete() {
        ctx.metrics.record_store_error();
        warn!(
            jid = %job.jid,
            worker = %job.class,
            error = %e,
            "failed to release duplicate job keys, leaving them to expire"
        );
    }

    let value = outcome?;

    if reschedule {
        reschedule_once(ctx, job);
    }
    Ok(Performed::Executed(value))
}

fn reschedule_once(ctx: &StrategyContext<'_>, job: &JobPayload) {
    let Some(rescheduler) = ctx.rescheduler else {
        warn!(jid = %job.jid, worker = %job.class, "no rescheduler configured, not rescheduling");
        return;
    };

    let fresh = job.respawn();
    let jid = fresh.jid.clone();
    match rescheduler.reschedule(fresh) {
        Ok(()) => {
            ctx.metrics.record_rescheduled();
            info!(
                jid = %job.jid,
                worker = %job.class,
                rescheduled_jid = %jid,
                "rescheduled deduplicated job"
            );
        }
        Err(e) => {
            warn!(
                jid = %job.jid,
                worker = %job.class,
                error = %e,
                "failed to reschedule deduplicated job"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use jobguard_core::{LsnDistance, StaticWorkerRegistry, StrategyKind, WorkerOptions};
    use jobguard_observability::DeduplicationMetrics;

    use super::*;
    use crate::config::{DedupConfig, FailurePolicy};
    use crate::dedup::strategies::{self, Rescheduler};
    use crate::store::InMemoryKeyStore;

    #[derive(Default)]
    struct RecordingRescheduler {
        jobs: Mutex<Vec<JobPayload>>,
    }

    impl Rescheduler for RecordingRescheduler {
        fn reschedule(&self, job: JobPayload) -> anyhow::Result<()> {
            self.jobs.lock().unwrap().push(job);
            Ok(())
        }
    }

    struct Fixture {
        store: InMemoryKeyStore,
        registry: StaticWorkerRegistry,
        config: DedupConfig,
        metrics: DeduplicationMetrics,
        rescheduler: RecordingRescheduler,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: InMemoryKeyStore::new(),
                registry: StaticWorkerRegistry::new().with(
                    "Worker",
                    WorkerOptions::idempotent()
                        .with_strategy("until_executed")
                        .reschedule_once(),
                ),
                config: DedupConfig::default(),
                metrics: DeduplicationMetrics::new(),
                rescheduler: RecordingRescheduler::default(),
            }
        }

        fn ctx(&self) -> StrategyContext<'_> {
            StrategyContext {
                failure_policy: FailurePolicy::Open,
                metrics: &self.metrics,
                rescheduler: Some(&self.rescheduler),
            }
        }

        fn guard<'a>(&'a self, job: &mut JobPayload) -> DuplicateJobGuard<'a, InMemoryKeyStore> {
            DuplicateJobGuard::new(job, &self.store, &self.registry, &LsnDistance, &self.config)
        }

        fn schedule(&self, job: &mut JobPayload) -> bool {
            let mut guard = self.guard(job);
            let ctx = self.ctx();
            let scheduled = strategies::schedule(
                StrategyKind::UntilExecuted,
                &ctx,
                &mut guard,
                job,
                |_| Ok::<_, DedupError>(()),
            );
            scheduled.unwrap().is_enqueued()
        }

        fn perform(&self, job: &mut JobPayload, ok: bool) -> Result<Performed<()>, DedupError> {
            let mut guard = self.guard(job);
            strategies::perform(StrategyKind::UntilExecuted, &self.ctx(), &mut guard, job, |_| {
                if ok { Ok(()) } else { Err(DedupError::NotChecked) }
            })
        }

        fn rescheduled(&self) -> Vec<JobPayload> {
            self.rescheduler.jobs.lock().unwrap().clone()
        }
    }

    fn job(jid: &str) -> JobPayload {
        JobPayload::new("Worker", vec![json!("x")]).with_jid(jid)
    }

    #[test]
    fn releases_after_execution_without_rescheduling() {
        let fx = Fixture::new();
        let mut first = job("1");
        assert!(fx.schedule(&mut first));

        assert_eq!(fx.perform(&mut first, true).unwrap(), Performed::Executed(()));
        assert!(fx.store.is_empty());
        assert!(fx.rescheduled().is_empty());
    }

    #[test]
    fn dropped_duplicate_triggers_one_reschedule() {
        let fx = Fixture::new();
        let mut first = job("1");
        let mut second = job("2");
        let mut third = job("3");
        assert!(fx.schedule(&mut first));
        assert!(!fx.schedule(&mut second));
        assert!(!fx.schedule(&mut third));

        fx.perform(&mut first, true).unwrap();

        let rescheduled = fx.rescheduled();
        assert_eq!(rescheduled.len(), 1);
        assert_eq!(rescheduled[0].class, "Worker");
        assert_eq!(rescheduled[0].args, first.args);
        assert_ne!(rescheduled[0].jid, first.jid);
        assert!(fx.store.is_empty());

        let stats = fx.metrics.snapshot();
        assert_eq!((stats.dropped, stats.rescheduled), (2, 1));
    }

    #[test]
    fn unreadable_flag_is_counted_apart_from_wal_bookkeeping() {
        let fx = Fixture::new();
        let mut first = job("1");
        let mut second = job("2");
        assert!(fx.schedule(&mut first));
        assert!(!fx.schedule(&mut second));

        fx.store.set_available(false);
        assert_eq!(fx.perform(&mut first, true).unwrap(), Performed::Executed(()));
        assert!(fx.rescheduled().is_empty());

        let stats = fx.metrics.snapshot();
        assert_eq!(stats.flag_failures, 1);
        assert_eq!(stats.wal_failures, 0);
        assert_eq!(stats.store_errors, 1, "failed release");
    }

    #[test]
    fn failed_execution_releases_but_does_not_reschedule() {
        let fx = Fixture::new();
        let mut first = job("1");
        let mut second = job("2");
        assert!(fx.schedule(&mut first));
        assert!(!fx.schedule(&mut second));

        assert_eq!(fx.perform(&mut first, false), Err(DedupError::NotChecked));
        assert!(fx.store.is_empty());
        assert!(fx.rescheduled().is_empty());
    }
}

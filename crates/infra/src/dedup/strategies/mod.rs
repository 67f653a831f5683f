//! Deduplication strategies.
//!
//! A strategy decides when a guard's key is written and released relative
//! to scheduling and execution. Strategies are a closed set
//! ([`StrategyKind`]) resolved once per job.
//!
//! Store-failure handling is explicit per call site:
//!
//! - schedule: `check` failing follows the [`FailurePolicy`] (open enqueues,
//!   closed returns the error); WAL and reschedule-flag bookkeeping failures
//!   are logged and counted only
//! - perform: `check` failing follows the policy (open executes without a
//!   release afterwards); `delete` failing is logged and left to TTL expiry

use chrono::Utc;
use tracing::{info, warn};

use jobguard_core::{Jid, JobPayload, StrategyKind};
use jobguard_observability::DeduplicationMetrics;

use super::error::DedupError;
use super::guard::DuplicateJobGuard;
use crate::config::FailurePolicy;
use crate::store::KeyStore;

mod until_executed;
mod until_executing;

/// Re-enqueues a fresh instance of a job (the queue transport).
pub trait Rescheduler: Send + Sync {
    fn reschedule(&self, job: JobPayload) -> anyhow::Result<()>;
}

/// Outcome of scheduling through a strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scheduled<T> {
    /// The continuation ran.
    Enqueued(T),
    /// Another instance holds the dedup window; nothing was enqueued.
    Dropped { duplicate_of: Jid },
}

impl<T> Scheduled<T> {
    pub fn is_enqueued(&self) -> bool {
        matches!(self, Scheduled::Enqueued(_))
    }
}

/// Outcome of performing through a strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Performed<T> {
    /// The continuation ran and succeeded.
    Executed(T),
    /// Another instance holds the dedup window; the job was not run.
    Skipped { duplicate_of: Jid },
}

impl<T> Performed<T> {
    pub fn is_executed(&self) -> bool {
        matches!(self, Performed::Executed(_))
    }
}

/// Collaborators a strategy reports to.
pub struct StrategyContext<'a> {
    pub failure_policy: FailurePolicy,
    pub metrics: &'a DeduplicationMetrics,
    pub rescheduler: Option<&'a dyn Rescheduler>,
}

impl StrategyContext<'_> {
    /// Apply the failure policy to a store error. `Ok` means "proceed".
    fn on_store_error(
        &self,
        stage: &'static str,
        job: &JobPayload,
        e: DedupError,
    ) -> Result<(), DedupError> {
        self.metrics.record_store_error();
        match self.failure_policy {
            FailurePolicy::Open => {
                warn!(
                    stage,
                    jid = %job.jid,
                    worker = %job.class,
                    error = %e,
                    "duplicate check failed, proceeding without deduplication"
                );
                Ok(())
            }
            FailurePolicy::Closed => {
                warn!(
                    stage,
                    jid = %job.jid,
                    worker = %job.class,
                    error = %e,
                    "duplicate check failed, refusing job"
                );
                Err(e)
            }
        }
    }

    fn on_wal_error(&self, job: &JobPayload, e: DedupError) {
        self.metrics.record_wal_failure();
        warn!(jid = %job.jid, worker = %job.class, error = %e, "WAL location bookkeeping failed");
    }

    fn on_flag_error(&self, job: &JobPayload, e: DedupError) {
        self.metrics.record_flag_failure();
        warn!(jid = %job.jid, worker = %job.class, error = %e, "reschedule flag unavailable");
    }
}

/// Run the schedule side of `strategy` around `next` (the enqueue).
pub fn schedule<S, T, E, F>(
    strategy: StrategyKind,
    ctx: &StrategyContext<'_>,
    guard: &mut DuplicateJobGuard<'_, S>,
    job: &mut JobPayload,
    next: F,
) -> Result<Scheduled<T>, E>
where
    S: KeyStore + ?Sized,
    E: From<DedupError>,
    F: FnOnce(&mut JobPayload) -> Result<T, E>,
{
    match strategy {
        StrategyKind::UntilExecuting | StrategyKind::UntilExecuted => {
            deduplicate_on_schedule(strategy, ctx, guard, job, next)
        }
        StrategyKind::None => next(job).map(Scheduled::Enqueued),
    }
}

/// Run the perform side of `strategy` around `next` (the job body).
pub fn perform<S, T, E, F>(
    strategy: StrategyKind,
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
    match strategy {
        StrategyKind::UntilExecuting => until_executing::perform(ctx, guard, job, next),
        StrategyKind::UntilExecuted => until_executed::perform(ctx, guard, job, next),
        StrategyKind::None => next(job).map(Performed::Executed),
    }
}

/// Schedule path shared by the locking strategies.
fn deduplicate_on_schedule<S, T, E, F>(
    strategy: StrategyKind,
    ctx: &StrategyContext<'_>,
    guard: &mut DuplicateJobGuard<'_, S>,
    job: &mut JobPayload,
    next: F,
) -> Result<Scheduled<T>, E>
where
    S: KeyStore + ?Sized,
    E: From<DedupError>,
    F: FnOnce(&mut JobPayload) -> Result<T, E>,
{
    if guard.scheduled() && !guard.deduplication_options().including_scheduled {
        return next(job).map(Scheduled::Enqueued);
    }

    let expiry = guard.expiry(Utc::now());
    if let Err(e) = guard.check(expiry) {
        ctx.on_store_error("schedule", job, e)?;
        return next(job).map(Scheduled::Enqueued);
    }
    if let Err(e) = guard.update_latest_wal_location() {
        ctx.on_wal_error(job, e);
    }

    if guard.is_duplicate()? {
        let duplicate_of = guard
            .existing_jid()
            .cloned()
            .ok_or(DedupError::NotChecked)?;
        job.duplicate_of = Some(duplicate_of.clone());

        if let Err(e) = guard.set_deduplicated_flag(expiry) {
            ctx.on_flag_error(job, e);
        }
        ctx.metrics.record_dropped();
        info!(
            jid = %job.jid,
            worker = %job.class,
            duplicate_of = %duplicate_of,
            idempotency_key = %guard.idempotency_key(),
            strategy = strategy.name(),
            "dropped duplicate job"
        );
        return Ok(Scheduled::Dropped { duplicate_of });
    }

    next(job).map(Scheduled::Enqueued)
}

/// Hand the tracked latest WAL locations to the job before it runs.
fn attach_latest_wal_locations<S>(
    ctx: &StrategyContext<'_>,
    guard: &mut DuplicateJobGuard<'_, S>,
    job: &mut JobPayload,
) where
    S: KeyStore + ?Sized,
{
    match guard.latest_wal_locations() {
        Ok(latest) if !latest.is_empty() => job.dedup_wal_locations = latest,
        Ok(_) => {}
        Err(e) => ctx.on_wal_error(job, e),
    }
}

//! Entry point for the client (schedule) and server (perform) middleware.

use std::sync::Arc;

use tracing::debug;

use jobguard_core::{
    AllEnabled, DeduplicationFlags, JobPayload, LsnDistance, StaticWorkerRegistry, StrategyKind,
    WalDistance, WorkerRegistry,
};
use jobguard_observability::DeduplicationMetrics;

use super::error::DedupError;
use super::guard::DuplicateJobGuard;
use super::strategies::{self, Performed, Rescheduler, Scheduled, StrategyContext};
use crate::config::DedupConfig;
use crate::store::KeyStore;

/// Wraps job scheduling and execution with duplicate detection.
///
/// ```ignore
/// let dedup = Deduplicator::new(store)
///     .with_registry(registry)
///     .with_config(DedupConfig::from_env()?);
///
/// match dedup.schedule(&mut job, |job| queue.push(job))? {
///     Scheduled::Enqueued(_) => {}
///     Scheduled::Dropped { duplicate_of } => debug!(%duplicate_of, "dropped"),
/// }
/// ```
pub struct Deduplicator<S: KeyStore> {
    store: S,
    registry: Arc<dyn WorkerRegistry>,
    flags: Arc<dyn DeduplicationFlags>,
    distance: Arc<dyn WalDistance>,
    config: DedupConfig,
    metrics: Arc<DeduplicationMetrics>,
    rescheduler: Option<Arc<dyn Rescheduler>>,
}

impl<S: KeyStore> Deduplicator<S> {
    /// A deduplicator with an empty registry (so every job passes through
    /// until workers are registered), all flags on, and Postgres LSNs.
    pub fn new(store: S) -> Self {
        Self {
            store,
            registry: Arc::new(StaticWorkerRegistry::new()),
            flags: Arc::new(AllEnabled),
            distance: Arc::new(LsnDistance),
            config: DedupConfig::default(),
            metrics: Arc::new(DeduplicationMetrics::new()),
            rescheduler: None,
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn WorkerRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_flags(mut self, flags: Arc<dyn DeduplicationFlags>) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_distance(mut self, distance: Arc<dyn WalDistance>) -> Self {
        self.distance = distance;
        self
    }

    pub fn with_config(mut self, config: DedupConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<DeduplicationMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_rescheduler(mut self, rescheduler: Arc<dyn Rescheduler>) -> Self {
        self.rescheduler = Some(rescheduler);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<DeduplicationMetrics> {
        &self.metrics
    }

    /// Schedule `job`, calling `next` to enqueue it unless it is a duplicate.
    pub fn schedule<T, E, F>(&self, job: &mut JobPayload, next: F) -> Result<Scheduled<T>, E>
    where
        E: From<DedupError>,
        F: FnOnce(&mut JobPayload) -> Result<T, E>,
    {
        let mut guard = self.guard(job);
        let strategy = guard.strategy(self.flags.as_ref());
        debug!(jid = %job.jid, worker = %job.class, strategy = strategy.name(), "schedule");
        strategies::schedule(strategy, &self.context(), &mut guard, job, next)
    }

    /// Run `job`, calling `next` to execute it unless it is a duplicate.
    pub fn perform<T, E, F>(&self, job: &mut JobPayload, next: F) -> Result<Performed<T>, E>
    where
        E: From<DedupError>,
        F: FnOnce(&mut JobPayload) -> Result<T, E>,
    {
        let mut guard = self.guard(job);
        let strategy = guard.strategy(self.flags.as_ref());
        debug!(jid = %job.jid, worker = %job.class, strategy = strategy.name(), "perform");
        strategies::perform(strategy, &self.context(), &mut guard, job, next)
    }

    /// Strategy `job` would run under right now.
    pub fn strategy_for(&self, job: &mut JobPayload) -> StrategyKind {
        self.guard(job).strategy(self.flags.as_ref())
    }

    fn guard(&self, job: &mut JobPayload) -> DuplicateJobGuard<'_, S> {
        DuplicateJobGuard::new(
            job,
            &self.store,
            self.registry.as_ref(),
            self.distance.as_ref(),
            &self.config,
        )
    }

    fn context(&self) -> StrategyContext<'_> {
        StrategyContext {
            failure_policy: self.config.failure_policy,
            metrics: &self.metrics,
            rescheduler: self.rescheduler.as_deref(),
        }
    }
}

//! Worker-type metadata and deduplication strategy selection.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// What to do after a duplicate has been dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IfDeduplicated {
    /// Drop the duplicate and forget it.
    #[default]
    Drop,
    /// Run the logical job once more after the current instance finishes.
    RescheduleOnce,
}

/// Per-worker deduplication settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeduplicationOptions {
    pub enabled: bool,
    /// Strategy name; empty means "pick the default"
    #[serde(default)]
    pub strategy: String,
    /// Overrides the configured dedup window
    #[serde(default)]
    pub ttl: Option<Duration>,
    /// Also deduplicate jobs scheduled for the future
    #[serde(default)]
    pub including_scheduled: bool,
    #[serde(default)]
    pub if_deduplicated: IfDeduplicated,
}

impl Default for DeduplicationOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: String::new(),
            ttl: None,
            including_scheduled: false,
            if_deduplicated: IfDeduplicated::Drop,
        }
    }
}

/// Registry entry for one worker type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerOptions {
    pub idempotent: bool,
    #[serde(default)]
    pub deduplication: DeduplicationOptions,
}

impl WorkerOptions {
    /// An idempotent worker using the default strategy.
    pub fn idempotent() -> Self {
        Self {
            idempotent: true,
            deduplication: DeduplicationOptions::default(),
        }
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.deduplication.strategy = strategy.into();
        self
    }

    /// A zero `ttl` falls back to the configured dedup window.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.deduplication.ttl = Some(ttl);
        self
    }

    pub fn including_scheduled(mut self) -> Self {
        self.deduplication.including_scheduled = true;
        self
    }

    pub fn reschedule_once(mut self) -> Self {
        self.deduplication.if_deduplicated = IfDeduplicated::RescheduleOnce;
        self
    }

    pub fn without_deduplication(mut self) -> Self {
        self.deduplication.enabled = false;
        self
    }
}

/// Lookup of worker metadata by worker-type name.
pub trait WorkerRegistry: Send + Sync {
    /// `None` for unknown worker types.
    fn lookup(&self, worker: &str) -> Option<WorkerOptions>;
}

impl<T: WorkerRegistry + ?Sized> WorkerRegistry for Arc<T> {
    fn lookup(&self, worker: &str) -> Option<WorkerOptions> {
        (**self).lookup(worker)
    }
}

/// In-process registry filled at startup.
#[derive(Debug, Default)]
pub struct StaticWorkerRegistry {
    workers: RwLock<HashMap<String, WorkerOptions>>,
}

impl StaticWorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, worker: impl Into<String>, options: WorkerOptions) -> &Self {
        if let Ok(mut workers) = self.workers.write() {
            workers.insert(worker.into(), options);
        }
        self
    }

    pub fn with(self, worker: impl Into<String>, options: WorkerOptions) -> Self {
        self.register(worker, options);
        self
    }
}

impl WorkerRegistry for StaticWorkerRegistry {
    fn lookup(&self, worker: &str) -> Option<WorkerOptions> {
        self.workers.read().ok()?.get(worker).cloned()
    }
}

/// Feature flags gating deduplication per worker type.
pub trait DeduplicationFlags: Send + Sync {
    fn enabled_for(&self, worker: &str) -> bool;
}

impl<T: DeduplicationFlags + ?Sized> DeduplicationFlags for Arc<T> {
    fn enabled_for(&self, worker: &str) -> bool {
        (**self).enabled_for(worker)
    }
}

/// Deduplication is never gated off.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllEnabled;

impl DeduplicationFlags for AllEnabled {
    fn enabled_for(&self, _worker: &str) -> bool {
        true
    }
}

/// Deduplication is switched off for the listed worker types.
#[derive(Debug, Default)]
pub struct DisabledWorkers {
    disabled: RwLock<HashSet<String>>,
}

impl DisabledWorkers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disable(&self, worker: impl Into<String>) {
        if let Ok(mut disabled) = self.disabled.write() {
            disabled.insert(worker.into());
        }
    }

    pub fn enable(&self, worker: &str) {
        if let Ok(mut disabled) = self.disabled.write() {
            disabled.remove(worker);
        }
    }
}

impl DeduplicationFlags for DisabledWorkers {
    fn enabled_for(&self, worker: &str) -> bool {
        self.disabled
            .read()
            .map(|d| !d.contains(worker))
            .unwrap_or(true)
    }
}

/// When a job's deduplication key is written and released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Held from scheduling until the job completes successfully.
    UntilExecuting,
    /// Held from scheduling through execution, released whatever the outcome.
    UntilExecuted,
    /// No deduplication.
    None,
}

impl StrategyKind {
    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::UntilExecuting => "until_executing",
            StrategyKind::UntilExecuted => "until_executed",
            StrategyKind::None => "none",
        }
    }

    /// Resolve the strategy for a worker.
    ///
    /// Unknown workers, non-idempotent workers, workers that disabled
    /// deduplication and workers gated off by `flag_enabled == false` all get
    /// [`StrategyKind::None`]. An idempotent worker with an empty or
    /// unrecognised strategy name gets [`StrategyKind::UntilExecuting`].
    pub fn resolve(options: Option<&WorkerOptions>, flag_enabled: bool) -> Self {
        let Some(options) = options else {
            return StrategyKind::None;
        };
        if !options.idempotent || !options.deduplication.enabled || !flag_enabled {
            return StrategyKind::None;
        }

        match options.deduplication.strategy.parse() {
            Ok(kind) => kind,
            Err(_) => {
                if !options.deduplication.strategy.is_empty() {
                    tracing::warn!(
                        strategy = %options.deduplication.strategy,
                        "unknown deduplication strategy, using until_executing"
                    );
                }
                StrategyKind::UntilExecuting
            }
        }
    }
}

impl core::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StrategyKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "until_executing" => Ok(StrategyKind::UntilExecuting),
            "until_executed" => Ok(StrategyKind::UntilExecuted),
            "none" => Ok(StrategyKind::None),
            other => Err(CoreError::unknown_strategy(other)),
        }
    }
}

//! Per-job deduplication guard.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use jobguard_core::{
    DeduplicationFlags, DeduplicationOptions, IdempotencyKey, IfDeduplicated, Jid, JobPayload,
    StrategyKind, WalDistance, WorkerOptions, WorkerRegistry,
};

use super::error::DedupError;
use crate::config::DedupConfig;
use crate::store::{BatchOp, KeyStore, KeyStoreError, StoreScript};

const DEDUPLICATED_FLAG_VALUE: &str = "1";

/// Owns one job instance's deduplication lifecycle: check, inspect, release.
///
/// The guard snapshots the job's identity at construction, so the payload
/// itself stays free to be handed to the continuation. It is not shared
/// between threads; concurrent instances coordinate only through the store.
///
/// Records kept per logical job:
///
/// - `<key>`: jid of the instance that won the dedup window
/// - `<key>:<config>:existing_wal_location`: first writer's WAL position
/// - `<key>:<config>:wal_location`: `[location, offset]` of the newest position seen
/// - `<key>:deduplicate_flag`: set when a duplicate was dropped (reschedule-once)
/// - `<key>:wal_configs`: every config with WAL records under the key, so a
///   release reaches records written by instances carrying other configs
///
/// Worker metadata is read from the registry once, at construction.
pub struct DuplicateJobGuard<'a, S: KeyStore + ?Sized> {
    store: &'a S,
    distance: &'a dyn WalDistance,
    config: &'a DedupConfig,

    worker: String,
    options: Option<WorkerOptions>,
    jid: Jid,
    key: IdempotencyKey,
    wal_locations: BTreeMap<String, String>,
    at: Option<DateTime<Utc>>,

    existing_jid: Option<Jid>,
    existing_wal_locations: BTreeMap<String, String>,
    latest_wal_locations: Option<BTreeMap<String, String>>,
}

impl<'a, S: KeyStore + ?Sized> DuplicateJobGuard<'a, S> {
    /// Build a guard for `job`, caching its idempotency key on the payload.
    pub fn new(
        job: &mut JobPayload,
        store: &'a S,
        registry: &'a dyn WorkerRegistry,
        distance: &'a dyn WalDistance,
        config: &'a DedupConfig,
    ) -> Self {
        let key = IdempotencyKey::for_job(&config.namespace, job);
        Self {
            store,
            distance,
            config,
            worker: job.class.clone(),
            options: registry.lookup(&job.class),
            jid: job.jid.clone(),
            key,
            wal_locations: job.wal_locations.clone(),
            at: job.at,
            existing_jid: None,
            existing_wal_locations: BTreeMap::new(),
            latest_wal_locations: None,
        }
    }

    /// Claim the dedup window for this instance and learn who holds it.
    ///
    /// In one atomic batch: conditionally set the dedup record to this jid and
    /// every WAL baseline to this job's locations, then read back the winner's
    /// jid and baselines. Returns the winner's jid.
    pub fn check(&mut self, ttl: Duration) -> Result<Jid, DedupError> {
        let configs: Vec<&String> = self.wal_locations.keys().collect();

        let mut ops = Vec::with_capacity(3 + 2 * configs.len());
        ops.push(BatchOp::SetIfAbsent {
            key: self.key.as_str().to_string(),
            value: self.jid.to_string(),
            ttl,
        });
        for (config, location) in &self.wal_locations {
            ops.push(BatchOp::SetIfAbsent {
                key: self.key.existing_wal_location_key(config),
                value: location.clone(),
                ttl,
            });
        }
        if !configs.is_empty() {
            ops.push(BatchOp::SetAdd {
                key: self.key.wal_configs_key(),
                members: configs.iter().map(|c| c.to_string()).collect(),
                ttl,
            });
        }
        let writes = ops.len();
        ops.push(BatchOp::Get {
            key: self.key.as_str().to_string(),
        });
        for config in &configs {
            ops.push(BatchOp::Get {
                key: self.key.existing_wal_location_key(config),
            });
        }

        let replies = self.store.batch(&ops)?;
        let mut reads = replies.into_iter().skip(writes);
        let missing = || KeyStoreError::UnexpectedReply("batch reply truncated".to_string());

        let existing_jid = reads
            .next()
            .ok_or_else(missing)?
            .into_value()?
            .map(Jid::from)
            .ok_or_else(|| {
                KeyStoreError::UnexpectedReply(format!("{} vanished inside its batch", self.key))
            })?;

        let mut existing_wal_locations = BTreeMap::new();
        for config in configs {
            if let Some(location) = reads.next().ok_or_else(missing)?.into_value()? {
                existing_wal_locations.insert(config.clone(), location);
            }
        }

        debug!(
            jid = %self.jid,
            existing_jid = %existing_jid,
            idempotency_key = %self.key,
            "duplicate check"
        );

        self.existing_jid = Some(existing_jid.clone());
        self.existing_wal_locations = existing_wal_locations;
        Ok(existing_jid)
    }

    /// Whether another instance holds the dedup window.
    pub fn is_duplicate(&self) -> Result<bool, DedupError> {
        self.existing_jid
            .as_ref()
            .map(|existing| existing != &self.jid)
            .ok_or(DedupError::NotChecked)
    }

    /// Record this job's WAL positions as candidates for "latest seen".
    ///
    /// The offset of each position is its distance past the window's
    /// baseline; the store keeps a position only if its offset beats the one
    /// already recorded, atomically. Each config is also registered under
    /// the key for release.
    pub fn update_latest_wal_location(&self) -> Result<(), DedupError> {
        if self.wal_locations.is_empty() {
            return Ok(());
        }
        if self.existing_jid.is_none() {
            return Err(DedupError::NotChecked);
        }

        let ttl_ms = self.config.wal_location_ttl.as_millis().to_string();
        for (config, location) in &self.wal_locations {
            let baseline = self.existing_wal_locations.get(config).unwrap_or(location);
            let offset = self
                .distance
                .distance(config, location, baseline)
                .map_err(|e| DedupError::WalDistance {
                    config: config.clone(),
                    reason: e.to_string(),
                })?;

            self.store.eval(
                StoreScript::UpdateLatestWalLocation,
                &[self.key.wal_location_key(config), self.key.wal_configs_key()],
                &[location.clone(), offset.to_string(), ttl_ms.clone(), config.clone()],
            )?;
        }
        Ok(())
    }

    /// Latest tracked WAL position per config. Read once per guard.
    pub fn latest_wal_locations(&mut self) -> Result<BTreeMap<String, String>, DedupError> {
        if let Some(cached) = &self.latest_wal_locations {
            return Ok(cached.clone());
        }

        let mut latest = BTreeMap::new();
        if !self.wal_locations.is_empty() {
            let ops: Vec<BatchOp> = self
                .wal_locations
                .keys()
                .map(|config| BatchOp::ListIndex {
                    key: self.key.wal_location_key(config),
                    index: 0,
                })
                .collect();
            let replies = self.store.batch(&ops)?;
            for (config, reply) in self.wal_locations.keys().zip(replies) {
                if let Some(location) = reply.into_value()? {
                    latest.insert(config.clone(), location);
                }
            }
        }

        self.latest_wal_locations = Some(latest.clone());
        Ok(latest)
    }

    /// Release every record of this logical job in one atomic delete,
    /// including WAL records of configs this instance does not carry.
    pub fn delete(&self) -> Result<(), DedupError> {
        let keys = [
            self.key.as_str().to_string(),
            self.key.deduplicated_flag_key(),
            self.key.wal_configs_key(),
        ];
        let configs: Vec<String> = self.wal_locations.keys().cloned().collect();

        self.store.eval(StoreScript::ReleaseJobKeys, &keys, &configs)?;
        debug!(jid = %self.jid, idempotency_key = %self.key, "released duplicate job keys");
        Ok(())
    }

    /// Note that a duplicate was dropped, for workers that reschedule once.
    pub fn set_deduplicated_flag(&self, ttl: Duration) -> Result<(), DedupError> {
        if !self.reschedulable() {
            return Ok(());
        }
        self.store
            .set_if_absent(&self.key.deduplicated_flag_key(), DEDUPLICATED_FLAG_VALUE, ttl)?;
        Ok(())
    }

    /// Whether a duplicate was dropped while this window was held.
    pub fn should_reschedule(&self) -> Result<bool, DedupError> {
        if !self.reschedulable() {
            return Ok(false);
        }
        Ok(self.store.get(&self.key.deduplicated_flag_key())?.is_some())
    }

    pub fn reschedulable(&self) -> bool {
        self.deduplication_options().if_deduplicated == IfDeduplicated::RescheduleOnce
    }

    pub fn scheduled(&self) -> bool {
        self.at.is_some()
    }

    pub fn scheduled_at(&self) -> Option<DateTime<Utc>> {
        self.at
    }

    /// Dedup window for this job: the worker's TTL (or the configured
    /// default), extended by the time left until a scheduled run.
    pub fn expiry(&self, now: DateTime<Utc>) -> Duration {
        let ttl = self.duplicate_key_ttl();
        match self.at.and_then(|at| (at - now).to_std().ok()) {
            Some(until_run) => ttl.saturating_add(until_run),
            None => ttl,
        }
    }

    /// A zero worker TTL would expire inside its own batch; it falls back
    /// to the configured window.
    pub fn duplicate_key_ttl(&self) -> Duration {
        self.deduplication_options()
            .ttl
            .filter(|ttl| !ttl.is_zero())
            .unwrap_or(self.config.duplicate_key_ttl)
    }

    /// Registry metadata; unknown workers get the conservative default.
    pub fn worker_options(&self) -> WorkerOptions {
        self.options.clone().unwrap_or_default()
    }

    pub fn deduplication_options(&self) -> DeduplicationOptions {
        self.options
            .as_ref()
            .map(|options| options.deduplication.clone())
            .unwrap_or_default()
    }

    pub fn is_idempotent(&self) -> bool {
        self.options.as_ref().is_some_and(|options| options.idempotent)
    }

    pub fn strategy(&self, flags: &dyn DeduplicationFlags) -> StrategyKind {
        StrategyKind::resolve(self.options.as_ref(), flags.enabled_for(&self.worker))
    }

    pub fn idempotency_key(&self) -> &IdempotencyKey {
        &self.key
    }

    pub fn jid(&self) -> &Jid {
        &self.jid
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    /// Winner jid from the last `check`.
    pub fn existing_jid(&self) -> Option<&Jid> {
        self.existing_jid.as_ref()
    }

    /// Winner's WAL baselines from the last `check`.
    pub fn existing_wal_locations(&self) -> &BTreeMap<String, String> {
        &self.existing_wal_locations
    }
}

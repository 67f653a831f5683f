//! Idempotency key derivation.
//!
//! A logical job is identified by its worker type and serialized arguments.
//! The key is `<namespace>:duplicate:<queue>:<sha256-hex>`, where the digest
//! covers `"<worker>:<json args>"`.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use crate::job::JobPayload;

/// Derives digests from a job's logical identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdempotencyKeyCodec;

impl IdempotencyKeyCodec {
    /// SHA-256 hex digest of `worker` and `args`.
    ///
    /// Argument order is significant. Object keys are emitted in sorted order,
    /// so two structurally equal objects always hash the same.
    pub fn compute(worker: &str, args: &[JsonValue]) -> String {
        let serialized = JsonValue::Array(args.to_vec()).to_string();

        let mut hasher = Sha256::new();
        hasher.update(worker.as_bytes());
        hasher.update(b":");
        hasher.update(serialized.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Fully qualified key of a job's deduplication record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(namespace: &str, queue: &str, digest: &str) -> Self {
        Self(format!("{namespace}:duplicate:{queue}:{digest}"))
    }

    /// Derive the key for a logical job.
    pub fn derive(namespace: &str, queue: &str, worker: &str, args: &[JsonValue]) -> Self {
        Self::new(namespace, queue, &IdempotencyKeyCodec::compute(worker, args))
    }

    /// Key for `job`, reusing the cached value when the payload carries one.
    ///
    /// A freshly derived key is written back onto the payload.
    pub fn for_job(namespace: &str, job: &mut JobPayload) -> Self {
        if let Some(key) = &job.idempotency_key {
            return Self(key.clone());
        }
        let key = Self::derive(namespace, &job.queue, &job.class, &job.args);
        job.idempotency_key = Some(key.0.clone());
        key
    }

    /// Key of the first-writer WAL baseline for a database config.
    pub fn existing_wal_location_key(&self, config: &str) -> String {
        format!("{}:{config}:existing_wal_location", self.0)
    }

    /// Key of the latest `[location, offset]` pair for a database config.
    pub fn wal_location_key(&self, config: &str) -> String {
        format!("{}:{config}:wal_location", self.0)
    }

    /// Key of the "a duplicate was dropped" marker.
    pub fn deduplicated_flag_key(&self) -> String {
        format!("{}:deduplicate_flag", self.0)
    }

    /// Key of the set of configs holding WAL records under this key.
    pub fn wal_configs_key(&self) -> String {
        format!("{}:wal_configs", self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

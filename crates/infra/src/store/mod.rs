//! Shared key-value store used as the only coordination medium.
//!
//! ## Components
//!
//! - `KeyStore`: conditional set, get, delete, atomic batches and scripts
//! - `InMemoryKeyStore`: single-process implementation for tests/dev
//! - `RedisKeyStore`: Redis-backed implementation (feature `redis`)

use std::sync::Arc;
use std::time::Duration;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use in_memory::InMemoryKeyStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisKeyStore;

/// Key-store operation error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyStoreError {
    /// Timeout, refused or dropped connection.
    #[error("key store unavailable: {0}")]
    Unavailable(String),
    /// A server-side script failed to run.
    #[error("script execution failed: {0}")]
    Script(String),
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
    #[error("wrong value type at key {0}")]
    WrongType(String),
}

impl KeyStoreError {
    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KeyStoreError::Unavailable(_))
    }
}

/// One operation inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Set `key` to `value` with expiry `ttl` unless it already exists.
    SetIfAbsent {
        key: String,
        value: String,
        ttl: Duration,
    },
    Get {
        key: String,
    },
    /// Element `index` of the list at `key` (negative counts from the end).
    ListIndex {
        key: String,
        index: i64,
    },
    Delete {
        keys: Vec<String>,
    },
    /// Add `members` to the set at `key`, extending its expiry to at least `ttl`.
    SetAdd {
        key: String,
        members: Vec<String>,
        ttl: Duration,
    },
}

/// Reply to a [`BatchOp`], in the same position as the op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchReply {
    /// Whether a `SetIfAbsent` wrote its value.
    Set(bool),
    Value(Option<String>),
    Deleted(u64),
    /// How many members a `SetAdd` newly added.
    Added(u64),
}

impl BatchReply {
    pub fn into_value(self) -> Result<Option<String>, KeyStoreError> {
        match self {
            BatchReply::Value(v) => Ok(v),
            other => Err(KeyStoreError::UnexpectedReply(format!(
                "expected value, got {other:?}"
            ))),
        }
    }
}

/// Scripts evaluated atomically on the store side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreScript {
    /// `KEYS[1]` holds a `[location, offset]` list, `KEYS[2]` the set of
    /// configs tracked under the job key.
    /// `ARGV` = location, offset, ttl in milliseconds, config.
    ///
    /// Creates the list when absent; otherwise replaces both elements only
    /// when the new offset is strictly greater than the stored one. The
    /// config joins the set, whose expiry is extended to at least the ttl.
    UpdateLatestWalLocation,
    /// `KEYS` = job key, reschedule flag, config set.
    /// `ARGV` = configs the caller carries.
    ///
    /// Deletes the job key, the flag, the set and both WAL records of every
    /// config in the set or in `ARGV`, in one step.
    ReleaseJobKeys,
}

impl StoreScript {
    pub fn name(&self) -> &'static str {
        match self {
            StoreScript::UpdateLatestWalLocation => "update_latest_wal_location",
            StoreScript::ReleaseJobKeys => "release_job_keys",
        }
    }

    /// Lua source for stores that evaluate scripts server-side.
    pub fn source(&self) -> &'static str {
        match self {
            StoreScript::UpdateLatestWalLocation => {
                r#"
                local key = KEYS[1]
                local configs = KEYS[2]
                local location = ARGV[1]
                local offset = ARGV[2]
                local ttl = ARGV[3]
                local config = ARGV[4]

                local current = redis.call('LINDEX', key, -1)
                if current == false then
                    redis.call('RPUSH', key, location, offset)
                    redis.call('PEXPIRE', key, ttl)
                elseif tonumber(offset) > tonumber(current) then
                    redis.call('LSET', key, 0, location)
                    redis.call('LSET', key, 1, offset)
                end

                redis.call('SADD', configs, config)
                redis.call('PEXPIRE', configs, ttl, 'NX')
                redis.call('PEXPIRE', configs, ttl, 'GT')
                return 0
                "#
            }
            // Record names must match `IdempotencyKey`.
            StoreScript::ReleaseJobKeys => {
                r#"
                local key = KEYS[1]
                local doomed = { KEYS[1], KEYS[2], KEYS[3] }

                local function release(config)
                    table.insert(doomed, key .. ':' .. config .. ':existing_wal_location')
                    table.insert(doomed, key .. ':' .. config .. ':wal_location')
                end

                for _, config in ipairs(redis.call('SMEMBERS', KEYS[3])) do
                    release(config)
                end
                for _, config in ipairs(ARGV) do
                    release(config)
                end
                return redis.call('DEL', unpack(doomed))
                "#
            }
        }
    }
}

/// Shared atomic key-value store.
pub trait KeyStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, KeyStoreError>;

    /// Set `key` unless it exists. Returns whether the value was written.
    /// A zero `ttl` is raised to the smallest expiry the store supports.
    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KeyStoreError>;

    /// Delete keys, returning how many existed. Missing keys are not an error.
    fn delete(&self, keys: &[String]) -> Result<u64, KeyStoreError>;

    /// Execute `ops` atomically; no other client's write interleaves.
    fn batch(&self, ops: &[BatchOp]) -> Result<Vec<BatchReply>, KeyStoreError>;

    /// Evaluate a script atomically on the store side.
    fn eval(
        &self,
        script: StoreScript,
        keys: &[String],
        args: &[String],
    ) -> Result<(), KeyStoreError>;
}

impl<S> KeyStore for Arc<S>
where
    S: KeyStore + ?Sized,
{
    fn get(&self, key: &str) -> Result<Option<String>, KeyStoreError> {
        (**self).get(key)
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KeyStoreError> {
        (**self).set_if_absent(key, value, ttl)
    }

    fn delete(&self, keys: &[String]) -> Result<u64, KeyStoreError> {
        (**self).delete(keys)
    }

    fn batch(&self, ops: &[BatchOp]) -> Result<Vec<BatchReply>, KeyStoreError> {
        (**self).batch(ops)
    }

    fn eval(
        &self,
        script: StoreScript,
        keys: &[String],
        args: &[String],
    ) -> Result<(), KeyStoreError> {
        (**self).eval(script, keys, args)
    }
}

//! Redis-backed key store.
//!
//! Uses the blocking client with a fresh connection per call. Every connection
//! gets connect/read/write timeouts, so no call blocks longer than the
//! configured request timeout; a timeout surfaces as
//! [`KeyStoreError::Unavailable`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use redis::{Connection, RedisError, Value};
use tracing::instrument;

use super::{BatchOp, BatchReply, KeyStore, KeyStoreError, StoreScript};

/// Default per-request timeout
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct RedisKeyStore {
    client: Arc<redis::Client>,
    request_timeout: Duration,
    scripts: Arc<HashMap<StoreScript, redis::Script>>,
}

impl std::fmt::Debug for RedisKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKeyStore")
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl RedisKeyStore {
    /// Create a store for `redis_url` (e.g. "redis://localhost:6379").
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, KeyStoreError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| KeyStoreError::Unavailable(e.to_string()))?;

        let scripts = [StoreScript::UpdateLatestWalLocation, StoreScript::ReleaseJobKeys]
            .into_iter()
            .map(|s| (s, redis::Script::new(s.source())))
            .collect();

        Ok(Self {
            client: Arc::new(client),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            scripts: Arc::new(scripts),
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn connection(&self) -> Result<Connection, KeyStoreError> {
        let conn = self
            .client
            .get_connection_with_timeout(self.request_timeout)
            .map_err(map_error)?;
        conn.set_read_timeout(Some(self.request_timeout))
            .map_err(map_error)?;
        conn.set_write_timeout(Some(self.request_timeout))
            .map_err(map_error)?;
        Ok(conn)
    }
}

fn map_error(e: RedisError) -> KeyStoreError {
    if e.is_timeout() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_io_error() {
        KeyStoreError::Unavailable(e.to_string())
    } else {
        KeyStoreError::UnexpectedReply(e.to_string())
    }
}

fn map_script_error(e: RedisError) -> KeyStoreError {
    match map_error(e) {
        KeyStoreError::UnexpectedReply(msg) => KeyStoreError::Script(msg),
        other => other,
    }
}

/// Longest expiry sent to Redis, far past any dedup window.
const MAX_TTL_MILLIS: u64 = 1 << 46;

fn ttl_millis(ttl: Duration) -> u64 {
    // Redis rejects PX 0 and expiries that overflow its clock.
    u64::try_from(ttl.as_millis())
        .unwrap_or(MAX_TTL_MILLIS)
        .clamp(1, MAX_TTL_MILLIS)
}

fn decode_reply(op: &BatchOp, value: &Value) -> Result<BatchReply, KeyStoreError> {
    match op {
        BatchOp::SetIfAbsent { .. } => match value {
            Value::Okay => Ok(BatchReply::Set(true)),
            Value::Status(s) if s == "OK" => Ok(BatchReply::Set(true)),
            Value::Nil => Ok(BatchReply::Set(false)),
            other => Err(KeyStoreError::UnexpectedReply(format!("SET NX: {other:?}"))),
        },
        BatchOp::Get { key } | BatchOp::ListIndex { key, .. } => redis::from_redis_value(value)
            .map(BatchReply::Value)
            .map_err(|e| KeyStoreError::UnexpectedReply(format!("{key}: {e}"))),
        BatchOp::Delete { .. } => redis::from_redis_value(value)
            .map(BatchReply::Deleted)
            .map_err(|e| KeyStoreError::UnexpectedReply(format!("DEL: {e}"))),
        BatchOp::SetAdd { key, .. } => redis::from_redis_value(value)
            .map(BatchReply::Added)
            .map_err(|e| KeyStoreError::UnexpectedReply(format!("SADD {key}: {e}"))),
    }
}

impl KeyStore for RedisKeyStore {
    fn get(&self, key: &str) -> Result<Option<String>, KeyStoreError> {
        let mut conn = self.connection()?;
        redis::cmd("GET").arg(key).query(&mut conn).map_err(map_error)
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KeyStoreError> {
        let mut conn = self.connection()?;
        let reply: Value = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query(&mut conn)
            .map_err(map_error)?;
        Ok(!matches!(reply, Value::Nil))
    }

    fn delete(&self, keys: &[String]) -> Result<u64, KeyStoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection()?;
        redis::cmd("DEL").arg(keys).query(&mut conn).map_err(map_error)
    }

    #[instrument(skip(self, ops), fields(ops = ops.len()), err)]
    fn batch(&self, ops: &[BatchOp]) -> Result<Vec<BatchReply>, KeyStoreError> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }

        // MULTI/EXEC: the whole batch is applied without interleaving.
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            match op {
                BatchOp::SetIfAbsent { key, value, ttl } => {
                    pipe.cmd("SET")
                        .arg(key)
                        .arg(value)
                        .arg("NX")
                        .arg("PX")
                        .arg(ttl_millis(*ttl));
                }
                BatchOp::Get { key } => {
                    pipe.cmd("GET").arg(key);
                }
                BatchOp::ListIndex { key, index } => {
                    pipe.cmd("LINDEX").arg(key).arg(*index);
                }
                BatchOp::Delete { keys } => {
                    pipe.cmd("DEL").arg(keys);
                }
                BatchOp::SetAdd { key, members, ttl } => {
                    // NX then GT: set a first expiry, otherwise only extend it (Redis 7+).
                    pipe.cmd("SADD").arg(key).arg(members);
                    pipe.cmd("PEXPIRE")
                        .arg(key)
                        .arg(ttl_millis(*ttl))
                        .arg("NX")
                        .ignore();
                    pipe.cmd("PEXPIRE")
                        .arg(key)
                        .arg(ttl_millis(*ttl))
                        .arg("GT")
                        .ignore();
                }
            }
        }

        let mut conn = self.connection()?;
        let values: Vec<Value> = pipe.query(&mut conn).map_err(map_error)?;
        if values.len() != ops.len() {
            return Err(KeyStoreError::UnexpectedReply(format!(
                "expected {} replies, got {}",
                ops.len(),
                values.len()
            )));
        }

        ops.iter()
            .zip(values.iter())
            .map(|(op, value)| decode_reply(op, value))
            .collect()
    }

    #[instrument(skip(self, keys, args), fields(script = script.name()), err)]
    fn eval(
        &self,
        script: StoreScript,
        keys: &[String],
        args: &[String],
    ) -> Result<(), KeyStoreError> {
        let compiled = self
            .scripts
            .get(&script)
            .ok_or_else(|| KeyStoreError::Script(format!("script not loaded: {}", script.name())))?;

        let mut invocation = compiled.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in args {
            invocation.arg(arg);
        }

        let mut conn = self.connection()?;
        // EVALSHA, falling back to EVAL when the script is not cached server-side.
        invocation.invoke::<()>(&mut conn).map_err(map_script_error)
    }
}

#[cfg(test)]
mod tests {
    //! These tests need a running Redis: `REDIS_URL=redis://localhost:6379 cargo test -- --ignored`

    use super::*;

    fn store() -> RedisKeyStore {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        RedisKeyStore::new(url).unwrap()
    }

    fn unique(prefix: &str) -> String {
        format!("jobguard-test:{prefix}:{}", jobguard_core::Jid::generate())
    }

    #[test]
    #[ignore = "requires redis"]
    fn batch_is_first_writer_wins() {
        let store = store();
        let key = unique("batch");
        let ttl = Duration::from_secs(30);

        let first = store
            .batch(&[
                BatchOp::SetIfAbsent {
                    key: key.clone(),
                    value: "1".into(),
                    ttl,
                },
                BatchOp::Get { key: key.clone() },
            ])
            .unwrap();
        let second = store
            .batch(&[
                BatchOp::SetIfAbsent {
                    key: key.clone(),
                    value: "2".into(),
                    ttl,
                },
                BatchOp::Get { key: key.clone() },
            ])
            .unwrap();

        assert_eq!(first, vec![BatchReply::Set(true), BatchReply::Value(Some("1".into()))]);
        assert_eq!(second, vec![BatchReply::Set(false), BatchReply::Value(Some("1".into()))]);
        assert_eq!(store.delete(&[key.clone(), key]).unwrap(), 1);
    }

    #[test]
    #[ignore = "requires redis"]
    fn wal_script_is_monotonic() {
        let store = store();
        let key = unique("wal");
        let configs = format!("{key}:wal_configs");
        let keys = vec![key.clone(), configs.clone()];
        let run = |location: &str, offset: i64| {
            store
                .eval(
                    StoreScript::UpdateLatestWalLocation,
                    &keys,
                    &[
                        location.to_string(),
                        offset.to_string(),
                        "60000".to_string(),
                        "main".to_string(),
                    ],
                )
                .unwrap()
        };

        run("0/A", 50);
        run("0/B", 30);

        let head = store
            .batch(&[BatchOp::ListIndex {
                key: key.clone(),
                index: 0,
            }])
            .unwrap();
        assert_eq!(head, vec![BatchReply::Value(Some("0/A".into()))]);

        let release = [key.clone(), format!("{key}:deduplicate_flag"), configs];
        store.eval(StoreScript::ReleaseJobKeys, &release, &[]).unwrap();
        let head = store
            .batch(&[BatchOp::ListIndex {
                key: key.clone(),
                index: 0,
            }])
            .unwrap();
        assert_eq!(head, vec![BatchReply::Value(None)]);
    }

    #[test]
    fn unreachable_server_is_unavailable() {
        let store = RedisKeyStore::new("redis://127.0.0.1:1")
            .unwrap()
            .with_request_timeout(Duration::from_millis(50));
        let err = store.get("k").unwrap_err();
        assert!(err.is_retryable(), "{err:?}");
    }
}

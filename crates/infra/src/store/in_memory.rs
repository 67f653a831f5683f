use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{BatchOp, BatchReply, KeyStore, KeyStoreError, StoreScript};

#[derive(Debug, Clone, PartialEq, Eq)]
enum StoredValue {
    String(String),
    List(Vec<String>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: StoredValue,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

type Entries = HashMap<String, Entry>;

/// Shortest expiry, matching Redis rejecting `PX 0`.
const MIN_TTL: Duration = Duration::from_millis(1);

/// Deadline for `ttl` from `now`; one beyond `Instant`'s range never expires.
fn deadline(now: Instant, ttl: Duration) -> Option<Instant> {
    now.checked_add(ttl.max(MIN_TTL))
}

/// In-memory key store.
///
/// Intended for tests/dev. Every operation, batch and script runs under one
/// mutex, which gives the same atomicity a single Redis node provides.
#[derive(Debug)]
pub struct InMemoryKeyStore {
    entries: Mutex<Entries>,
    available: AtomicBool,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate an outage: while unavailable every call fails with
    /// [`KeyStoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Whether `key` currently holds a live value.
    pub fn contains(&self, key: &str) -> bool {
        self.lock()
            .map(|mut entries| live(&mut entries, key, Instant::now()).is_some())
            .unwrap_or(false)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .map(|entries| entries.values().filter(|e| e.is_live(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining time to live of `key`, if it exists and has an expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut entries = self.lock().ok()?;
        let entry = live(&mut entries, key, now)?;
        entry.expires_at.map(|at| at.saturating_duration_since(now))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Entries>, KeyStoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(KeyStoreError::Unavailable("store marked unavailable".to_string()));
        }
        self.entries
            .lock()
            .map_err(|_| KeyStoreError::Unavailable("lock poisoned".to_string()))
    }
}

impl Default for InMemoryKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Live entry at `key`, purging it first if it has expired.
fn live<'a>(entries: &'a mut Entries, key: &str, now: Instant) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|e| !e.is_live(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn get_string(
    entries: &mut Entries,
    key: &str,
    now: Instant,
) -> Result<Option<String>, KeyStoreError> {
    match live(entries, key, now) {
        None => Ok(None),
        Some(Entry {
            value: StoredValue::String(s),
            ..
        }) => Ok(Some(s.clone())),
        Some(_) => Err(KeyStoreError::WrongType(key.to_string())),
    }
}

fn set_if_absent(
    entries: &mut Entries,
    key: &str,
    value: &str,
    ttl: Duration,
    now: Instant,
) -> bool {
    if live(entries, key, now).is_some() {
        return false;
    }
    entries.insert(
        key.to_string(),
        Entry {
            value: StoredValue::String(value.to_string()),
            expires_at: deadline(now, ttl),
        },
    );
    true
}

fn set_add(
    entries: &mut Entries,
    key: &str,
    members: &[String],
    ttl: Duration,
    now: Instant,
) -> Result<u64, KeyStoreError> {
    let expires_at = deadline(now, ttl);
    match live(entries, key, now) {
        None => {
            let set: BTreeSet<String> = members.iter().cloned().collect();
            let added = set.len() as u64;
            entries.insert(
                key.to_string(),
                Entry {
                    value: StoredValue::Set(set),
                    expires_at,
                },
            );
            Ok(added)
        }
        Some(Entry {
            value: StoredValue::Set(set),
            expires_at: current,
        }) => {
            let added = members.iter().filter(|m| set.insert(m.to_string())).count();
            // Only ever extended; `None` means "never expires".
            *current = match (*current, expires_at) {
                (Some(current), Some(extended)) => Some(current.max(extended)),
                _ => None,
            };
            Ok(added as u64)
        }
        Some(_) => Err(KeyStoreError::WrongType(key.to_string())),
    }
}

fn list_index(
    entries: &mut Entries,
    key: &str,
    index: i64,
    now: Instant,
) -> Result<Option<String>, KeyStoreError> {
    match live(entries, key, now) {
        None => Ok(None),
        Some(Entry {
            value: StoredValue::List(items),
            ..
        }) => {
            let len = items.len() as i64;
            let idx = if index < 0 { len + index } else { index };
            if idx < 0 || idx >= len {
                return Ok(None);
            }
            Ok(items.get(idx as usize).cloned())
        }
        Some(_) => Err(KeyStoreError::WrongType(key.to_string())),
    }
}

fn delete(entries: &mut Entries, keys: &[String], now: Instant) -> u64 {
    let mut deleted = 0;
    for key in keys {
        if live(entries, key, now).is_some() {
            entries.remove(key);
            deleted += 1;
        }
    }
    deleted
}

fn update_latest_wal_location(
    entries: &mut Entries,
    keys: &[String],
    args: &[String],
    now: Instant,
) -> Result<(), KeyStoreError> {
    let [key, configs] = keys else {
        return Err(KeyStoreError::Script(format!(
            "expected 2 keys, got {}",
            keys.len()
        )));
    };
    let [location, offset, ttl_ms, config] = args else {
        return Err(KeyStoreError::Script(format!(
            "expected 4 arguments, got {}",
            args.len()
        )));
    };
    let offset: i64 = offset
        .parse()
        .map_err(|e| KeyStoreError::Script(format!("offset {offset:?}: {e}")))?;
    let ttl = ttl_ms
        .parse()
        .map(Duration::from_millis)
        .map_err(|e| KeyStoreError::Script(format!("ttl {ttl_ms:?}: {e}")))?;

    match live(entries, key, now) {
        None => {
            entries.insert(
                key.clone(),
                Entry {
                    value: StoredValue::List(vec![location.clone(), offset.to_string()]),
                    expires_at: deadline(now, ttl),
                },
            );
        }
        Some(Entry {
            value: StoredValue::List(items),
            ..
        }) => {
            let current = items
                .last()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| KeyStoreError::Script(format!("malformed offset at {key}")))?;
            if offset > current {
                *items = vec![location.clone(), offset.to_string()];
            }
        }
        Some(_) => return Err(KeyStoreError::WrongType(key.clone())),
    }

    set_add(entries, configs, std::slice::from_ref(config), ttl, now)?;
    Ok(())
}

fn release_job_keys(
    entries: &mut Entries,
    keys: &[String],
    configs: &[String],
    now: Instant,
) -> Result<(), KeyStoreError> {
    let [key, flag, tracked] = keys else {
        return Err(KeyStoreError::Script(format!(
            "expected 3 keys, got {}",
            keys.len()
        )));
    };

    let mut released: BTreeSet<String> = configs.iter().cloned().collect();
    match live(entries, tracked, now) {
        None => {}
        Some(Entry {
            value: StoredValue::Set(set),
            ..
        }) => released.extend(set.iter().cloned()),
        Some(_) => return Err(KeyStoreError::WrongType(tracked.clone())),
    }

    let mut doomed = vec![key.clone(), flag.clone(), tracked.clone()];
    for config in &released {
        doomed.push(format!("{key}:{config}:existing_wal_location"));
        doomed.push(format!("{key}:{config}:wal_location"));
    }
    delete(entries, &doomed, now);
    Ok(())
}

impl KeyStore for InMemoryKeyStore {
    fn get(&self, key: &str) -> Result<Option<String>, KeyStoreError> {
        let mut entries = self.lock()?;
        get_string(&mut entries, key, Instant::now())
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KeyStoreError> {
        let mut entries = self.lock()?;
        Ok(set_if_absent(&mut entries, key, value, ttl, Instant::now()))
    }

    fn delete(&self, keys: &[String]) -> Result<u64, KeyStoreError> {
        let mut entries = self.lock()?;
        Ok(delete(&mut entries, keys, Instant::now()))
    }

    fn batch(&self, ops: &[BatchOp]) -> Result<Vec<BatchReply>, KeyStoreError> {
        let mut entries = self.lock()?;
        let now = Instant::now();

        ops.iter()
            .map(|op| match op {
                BatchOp::SetIfAbsent { key, value, ttl } => Ok(BatchReply::Set(set_if_absent(
                    &mut entries,
                    key,
                    value,
                    *ttl,
                    now,
                ))),
                BatchOp::Get { key } => get_string(&mut entries, key, now).map(BatchReply::Value),
                BatchOp::ListIndex { key, index } => {
                    list_index(&mut entries, key, *index, now).map(BatchReply::Value)
                }
                BatchOp::Delete { keys } => {
                    Ok(BatchReply::Deleted(delete(&mut entries, keys, now)))
                }
                BatchOp::SetAdd { key, members, ttl } => {
                    set_add(&mut entries, key, members, *ttl, now).map(BatchReply::Added)
                }
            })
            .collect()
    }

    fn eval(
        &self,
        script: StoreScript,
        keys: &[String],
        args: &[String],
    ) -> Result<(), KeyStoreError> {
        let mut entries = self.lock()?;
        let now = Instant::now();
        match script {
            StoreScript::UpdateLatestWalLocation => {
                update_latest_wal_location(&mut entries, keys, args, now)
            }
            StoreScript::ReleaseJobKeys => release_job_keys(&mut entries, keys, args, now),
        }
    }
}

//! Deduplication configuration.
//!
//! Values come from `JOBGUARD_*` environment variables, falling back to the
//! defaults below.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default dedup window
pub const DEFAULT_DUPLICATE_KEY_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Default lifetime of the latest-WAL-location record
pub const DEFAULT_WAL_LOCATION_TTL: Duration = Duration::from_secs(60);

/// Longest TTL accepted from the environment
pub const MAX_TTL: Duration = Duration::from_secs(366 * 24 * 60 * 60);

/// Default key namespace
pub const DEFAULT_NAMESPACE: &str = "jobguard";

const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(500);

/// What a strategy does when the key store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Proceed as if the job were not a duplicate.
    #[default]
    Open,
    /// Surface the failure to the caller.
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Prefix of every key written by the guard
    pub namespace: String,
    /// Dedup window when the worker does not set its own
    pub duplicate_key_ttl: Duration,
    /// Lifetime of the latest-WAL-location record
    pub wal_location_ttl: Duration,
    pub redis_url: String,
    /// Upper bound on a single key-store call
    pub request_timeout: Duration,
    pub failure_policy: FailurePolicy,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            duplicate_key_ttl: DEFAULT_DUPLICATE_KEY_TTL,
            wal_location_ttl: DEFAULT_WAL_LOCATION_TTL,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            failure_policy: FailurePolicy::Open,
        }
    }
}

impl DedupConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load using `lookup` to resolve variable names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(namespace) = lookup("JOBGUARD_NAMESPACE") {
            config.namespace = namespace;
        }
        if let Some(url) = lookup("JOBGUARD_REDIS_URL").or_else(|| lookup("REDIS_URL")) {
            config.redis_url = url;
        }
        if let Some(ttl) = parse_ttl_secs(&lookup, "JOBGUARD_DUPLICATE_KEY_TTL_SECS")? {
            config.duplicate_key_ttl = ttl;
        }
        if let Some(ttl) = parse_ttl_secs(&lookup, "JOBGUARD_WAL_LOCATION_TTL_SECS")? {
            config.wal_location_ttl = ttl;
        }
        if let Some(ms) = parse_u64(&lookup, "JOBGUARD_REQUEST_TIMEOUT_MS")? {
            if ms == 0 {
                return Err(ConfigError::Invalid {
                    var: "JOBGUARD_REQUEST_TIMEOUT_MS",
                    value: ms.to_string(),
                    reason: "must be positive".to_string(),
                });
            }
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(policy) = lookup("JOBGUARD_FAILURE_POLICY") {
            config.failure_policy = match policy.to_ascii_lowercase().as_str() {
                "open" => FailurePolicy::Open,
                "closed" => FailurePolicy::Closed,
                _ => {
                    return Err(ConfigError::Invalid {
                        var: "JOBGUARD_FAILURE_POLICY",
                        value: policy,
                        reason: "expected `open` or `closed`".to_string(),
                    });
                }
            };
        }

        Ok(config)
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_duplicate_key_ttl(mut self, ttl: Duration) -> Self {
        self.duplicate_key_ttl = ttl;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }
}

/// A TTL in whole seconds, between one second and [`MAX_TTL`].
fn parse_ttl_secs<F>(lookup: &F, var: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(secs) = parse_u64(lookup, var)? else {
        return Ok(None);
    };
    let ttl = Duration::from_secs(secs);
    if ttl.is_zero() || ttl > MAX_TTL {
        return Err(ConfigError::Invalid {
            var,
            value: secs.to_string(),
            reason: format!("must be between 1 and {} seconds", MAX_TTL.as_secs()),
        });
    }
    Ok(Some(ttl))
}

fn parse_u64<F>(lookup: &F, var: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(var)
        .map(|value| {
            value.trim().parse::<u64>().map_err(|e| ConfigError::Invalid {
                var,
                value: value.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| vars.get(k).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = DedupConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, DedupConfig::default());
        assert_eq!(config.duplicate_key_ttl, Duration::from_secs(21_600));
        assert_eq!(config.wal_location_ttl, Duration::from_secs(60));
        assert_eq!(config.failure_policy, FailurePolicy::Open);
    }

    #[test]
    fn overrides_from_environment() {
        let config = DedupConfig::from_lookup(lookup(&[
            ("JOBGUARD_NAMESPACE", "sidekiq:prod"),
            ("REDIS_URL", "redis://cache:6379"),
            ("JOBGUARD_DUPLICATE_KEY_TTL_SECS", "600"),
            ("JOBGUARD_REQUEST_TIMEOUT_MS", "250"),
            ("JOBGUARD_FAILURE_POLICY", "Closed"),
        ]))
        .unwrap();

        assert_eq!(config.namespace, "sidekiq:prod");
        assert_eq!(config.redis_url, "redis://cache:6379");
        assert_eq!(config.duplicate_key_ttl, Duration::from_secs(600));
        assert_eq!(config.request_timeout, Duration::from_millis(250));
        assert_eq!(config.failure_policy, FailurePolicy::Closed);
    }

    #[test]
    fn specific_redis_url_wins() {
        let config = DedupConfig::from_lookup(lookup(&[
            ("REDIS_URL", "redis://generic"),
            ("JOBGUARD_REDIS_URL", "redis://specific"),
        ]))
        .unwrap();
        assert_eq!(config.redis_url, "redis://specific");
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = DedupConfig::from_lookup(lookup(&[("JOBGUARD_DUPLICATE_KEY_TTL_SECS", "6h")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                var: "JOBGUARD_DUPLICATE_KEY_TTL_SECS",
                ..
            }
        ));

        assert!(DedupConfig::from_lookup(lookup(&[("JOBGUARD_FAILURE_POLICY", "maybe")])).is_err());
    }

    #[test]
    fn ttls_must_be_positive_and_bounded() {
        for (var, value) in [
            ("JOBGUARD_DUPLICATE_KEY_TTL_SECS", "0"),
            ("JOBGUARD_WAL_LOCATION_TTL_SECS", "0"),
            ("JOBGUARD_DUPLICATE_KEY_TTL_SECS", "18446744073709551615"),
            ("JOBGUARD_REQUEST_TIMEOUT_MS", "0"),
        ] {
            let err = DedupConfig::from_lookup(lookup(&[(var, value)])).unwrap_err();
            assert!(
                matches!(&err, ConfigError::Invalid { var: v, .. } if *v == var),
                "{var}={value}: {err:?}"
            );
        }

        let max = MAX_TTL.as_secs().to_string();
        let config =
            DedupConfig::from_lookup(lookup(&[("JOBGUARD_DUPLICATE_KEY_TTL_SECS", max.as_str())]))
                .unwrap();
        assert_eq!(config.duplicate_key_ttl, MAX_TTL);
    }
}

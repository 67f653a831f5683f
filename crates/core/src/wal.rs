//! Write-ahead-log distance capability.
//!
//! The deduplication layer never interprets WAL positions itself; it asks a
//! [`WalDistance`] supplied by the database layer how far one position is
//! ahead of another.

use crate::error::{CoreError, CoreResult};

/// Distance between two WAL positions of the same database config.
pub trait WalDistance: Send + Sync {
    /// Bytes by which `location` is ahead of `baseline` (negative if behind).
    fn distance(&self, config: &str, location: &str, baseline: &str) -> CoreResult<i64>;
}

impl<T: WalDistance + ?Sized> WalDistance for std::sync::Arc<T> {
    fn distance(&self, config: &str, location: &str, baseline: &str) -> CoreResult<i64> {
        (**self).distance(config, location, baseline)
    }
}

/// Postgres LSN arithmetic, equivalent to `pg_wal_lsn_diff`.
///
/// An LSN is written `X/Y` with both halves in hex; its value is `(X << 32) + Y`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LsnDistance;

impl LsnDistance {
    pub fn parse(location: &str) -> CoreResult<u64> {
        let (hi, lo) = location
            .split_once('/')
            .ok_or_else(|| CoreError::invalid_wal_location(location, "missing '/'"))?;

        let hi = u32::from_str_radix(hi, 16)
            .map_err(|e| CoreError::invalid_wal_location(location, e.to_string()))?;
        let lo = u32::from_str_radix(lo, 16)
            .map_err(|e| CoreError::invalid_wal_location(location, e.to_string()))?;

        Ok((u64::from(hi) << 32) | u64::from(lo))
    }
}

impl WalDistance for LsnDistance {
    fn distance(&self, _config: &str, location: &str, baseline: &str) -> CoreResult<i64> {
        let distance = i128::from(Self::parse(location)?) - i128::from(Self::parse(baseline)?);
        i64::try_from(distance).map_err(|_| {
            CoreError::invalid_wal_location(location, format!("too far from {baseline}"))
        })
    }
}

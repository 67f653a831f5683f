//! Deduplication errors.

use crate::store::KeyStoreError;

/// Errors raised by [`DuplicateJobGuard`](super::DuplicateJobGuard).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DedupError {
    /// `is_duplicate` (or a WAL update) ran before `check`. A programming
    /// error; never retryable.
    #[error("`check` must be called before inspecting duplicate state")]
    NotChecked,

    /// The key store failed; propagated unchanged.
    #[error(transparent)]
    Store(#[from] KeyStoreError),

    /// The database layer could not measure a WAL distance.
    #[error("WAL distance unavailable for {config}: {reason}")]
    WalDistance { config: String, reason: String },
}

impl DedupError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DedupError::Store(e) if e.is_retryable())
    }
}

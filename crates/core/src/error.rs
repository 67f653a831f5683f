//! Core error model.

use thiserror::Error;

/// Result type used across the core crate.
pub type CoreResult<T> = Result<T, CoreError>;

/// Parse and validation failures of core primitives.
///
/// Key-store failures are not represented here; they belong to the infra layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A deduplication strategy name did not match any known strategy.
    #[error("unknown deduplication strategy: {0}")]
    UnknownStrategy(String),

    /// A WAL location could not be parsed.
    #[error("invalid WAL location {location:?}: {reason}")]
    InvalidWalLocation { location: String, reason: String },

    /// An identifier was empty or otherwise malformed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl CoreError {
    pub fn unknown_strategy(name: impl Into<String>) -> Self {
        Self::UnknownStrategy(name.into())
    }

    pub fn invalid_wal_location(location: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidWalLocation {
            location: location.into(),
            reason: reason.into(),
        }
    }
}

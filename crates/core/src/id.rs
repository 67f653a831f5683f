//! Job instance identifiers.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Identifier of one enqueued job instance (`jid`).
///
/// Two instances of the same logical job carry different jids; the
/// deduplication record stores the jid of whichever instance won.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Jid(String);

impl Jid {
    /// Generate a fresh jid (UUIDv7, hex without dashes).
    pub fn generate() -> Self {
        Self(Uuid::now_v7().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl core::fmt::Display for Jid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Jid {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Jid {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl FromStr for Jid {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(CoreError::InvalidId("jid must not be empty".to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_jids_are_unique() {
        let a = Jid::generate();
        let b = Jid::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn empty_jid_is_rejected() {
        assert!(Jid::from_str("").is_err());
        assert_eq!(Jid::from_str("abc").unwrap(), Jid::from("abc"));
    }
}

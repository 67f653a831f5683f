//! Infrastructure layer: key stores, configuration, and the deduplication
//! guard and strategies built on them.

pub mod config;
pub mod dedup;
pub mod store;


pub use config::{ConfigError, DedupConfig, FailurePolicy};
pub use dedup::{
    DedupError, Deduplicator, DuplicateJobGuard, Performed, Rescheduler, Scheduled,
};
pub use store::{BatchOp, BatchReply, InMemoryKeyStore, KeyStore, KeyStoreError, StoreScript};

#[cfg(feature = "redis")]
pub use store::RedisKeyStore;

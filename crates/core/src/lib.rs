//! `jobguard-core` - job deduplication building blocks.
//!
//! This crate contains **pure** primitives (no key-store or network concerns):
//! job payloads, idempotency key derivation, worker metadata and the WAL
//! distance capability consumed by the guard.

pub mod error;
pub mod id;
pub mod idempotency;
pub mod job;
pub mod wal;
pub mod worker;

pub use error::{CoreError, CoreResult};
pub use id::Jid;
pub use idempotency::{IdempotencyKey, IdempotencyKeyCodec};
pub use job::{JobPayload, DEFAULT_QUEUE};
pub use wal::{LsnDistance, WalDistance};
pub use worker::{
    AllEnabled, DeduplicationFlags, DeduplicationOptions, DisabledWorkers, IfDeduplicated,
    StaticWorkerRegistry, StrategyKind, WorkerOptions, WorkerRegistry,
};

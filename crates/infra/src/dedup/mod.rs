//! Job deduplication: the per-job guard, the strategies built on it, and the
//! [`Deduplicator`] entry point that wires them to a key store.

pub mod deduplicator;
pub mod error;
pub mod guard;
pub mod strategies;

pub use deduplicator::Deduplicator;
pub use error::DedupError;
pub use guard::DuplicateJobGuard;
pub use strategies::{Performed, Rescheduler, Scheduled, StrategyContext};

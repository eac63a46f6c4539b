//! # Agora Core
//!
//! Coordination layer for many independent, concurrently-running actors
//! reading and mutating shared state in a remote transactional document
//! store, under real write contention.
//!
//! The layer is small and deliberate:
//!
//! - [`coordination::retry`] classifies store errors into
//!   retryable/terminal and re-executes transient failures under bounded
//!   exponential backoff with jitter.
//! - [`coordination::writer`] exposes the only mutation primitives domain
//!   code uses: `safe_update`, `safe_set`, and `safe_transaction`.
//! - [`coordination::locks`] builds named mutual exclusion from one
//!   conditional transaction per acquire/release, with time-based expiry
//!   standing in for crash detection.
//! - [`coordination::stagger`] spaces out batched writes to cut the
//!   collision probability of contention-prone bursts.
//! - [`domain`] holds the state these primitives exist to protect:
//!   actor balances with denormalized profile mirrors, and market price
//!   aggregates recomputed transactionally with every increment.
//!
//! The store itself is external, reached through [`store::DocumentStore`];
//! [`store::memory::MemoryStore`] and [`store::sqlite::SqliteStore`] are
//! the bundled backends.
//!
//! All components are explicitly constructed values — no ambient
//! singletons. Wire them once and pass handles:
//!
//! ```
//! use agora_core::store::memory::MemoryStore;
//! use agora_core::{ConflictSafeWriter, DistributedLockManager, MarketBoard};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> agora_core::Result<()> {
//! let store = MemoryStore::shared();
//! let writer = ConflictSafeWriter::new(store);
//! let locks = DistributedLockManager::new(writer.clone());
//! let market = MarketBoard::new(writer);
//!
//! if locks.acquire("market:widget", "agent-a").await? {
//!     market.update_market_aggregate("widget", 1, 0).await?;
//!     locks.release("market:widget", "agent-a").await;
//! }
//! # Ok(())
//! # }
//! ```

pub mod coordination;
pub mod domain;
mod error;
pub mod store;

pub use coordination::locks::{DistributedLockManager, LockRecord, DEFAULT_LOCK_TTL};
pub use coordination::retry::{
    RetryCoordinator, RetryPolicy, BACKOFF_TABLE_MS, DEFAULT_MAX_ATTEMPTS,
};
pub use coordination::stagger::{run_staggered_batch, StaggeredScheduler, DEFAULT_STAGGER_DELAY};
pub use coordination::writer::ConflictSafeWriter;
pub use domain::balance::{ActorState, BalanceLedger, BalanceRecord, ProfileRecord};
pub use domain::market::{
    normalize_market_key, recompute_price, MarketAggregate, MarketBoard, DEFAULT_BASE_PRICE,
    MIN_PRICE,
};
pub use error::{classify_backend_message, Error, ErrorClass, Result, StoreError};
pub use store::{
    DocRef, DocumentStore, Precondition, SetOptions, StoreResult, Transaction, VersionedDocument,
    WriteOp,
};

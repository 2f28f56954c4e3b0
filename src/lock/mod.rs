//! Lock Service Module
//!
//! Interface to the external coordinator that serializes entity-group writes
//! and decides which versions are committed.
//!
//! ## Responsibilities
//! - Issue monotonic transaction ids per application
//! - Exclusive locks per entity group root
//! - Failed-transaction blacklist and version resolution
//! - Atomic counters (used for id allocation)
//!
//! ## Version Resolution
//! ```text
//! row written by txn T ──► get_valid_transaction_id(T, row)
//!                              │
//!           ┌──────────────────┼──────────────────────┐
//!           ▼                  ▼                      ▼
//!      T committed        T in flight            T failed
//!      return T           return version T       return last valid
//!                         replaced for row       version for row (or 0)
//! ```

mod memory;

use thiserror::Error;

pub use memory::InMemoryLockService;

/// Most entity groups one multi-group transaction may lock
pub const MAX_GROUPS_FOR_XG: usize = 5;

/// Errors reported by a lock service
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("entity group is locked by another transaction: {0}")]
    Conflict(String),

    #[error("transaction {0} is not active")]
    InvalidTransaction(u64),

    #[error("{0}")]
    TooManyGroups(String),

    /// Worth retrying after a short pause
    #[error("transient lock service failure: {0}")]
    Transient(String),

    #[error("lock service unavailable: {0}")]
    Unavailable(String),
}

pub type LockResult<T> = std::result::Result<T, LockError>;

/// External lock/version service
pub trait LockService: Send + Sync {
    /// Issue a new transaction id
    fn get_transaction_id(&self, app: &str, is_xg: bool) -> LockResult<u64>;

    /// Lock the entity group rooted at `root_key` for `txn`.
    ///
    /// Re-acquiring a lock the transaction already holds succeeds.
    fn acquire_lock(&self, app: &str, txn: u64, root_key: &[u8]) -> LockResult<()>;

    /// Commit `txn` and release its locks
    fn release_lock(&self, app: &str, txn: u64) -> LockResult<()>;

    /// Mark `txn` failed, restore registered versions and release its locks
    fn notify_failed_transaction(&self, app: &str, txn: u64) -> LockResult<()>;

    /// Map a version stamp found on `row_key` to the version readers may see.
    /// Returns 0 when no committed version exists.
    fn get_valid_transaction_id(&self, app: &str, candidate: u64, row_key: &[u8]) -> LockResult<u64>;

    /// Record that `txn` overwrites `row_key`, whose committed version was
    /// `prev_version` (0 when the row did not exist)
    fn register_updated_key(&self, app: &str, txn: u64, prev_version: u64, row_key: &[u8]) -> LockResult<()>;

    /// Keys registered by an in-flight transaction with their previous versions
    fn updated_keys(&self, app: &str, txn: u64) -> LockResult<Vec<(Vec<u8>, u64)>>;

    /// Whether `txn` was started as a multi-group transaction
    fn is_xg(&self, app: &str, txn: u64) -> LockResult<bool>;

    /// Atomically add `amount` to the counter at `path`; returns (previous, new)
    fn increment_and_get_counter(&self, path: &str, amount: i64) -> LockResult<(i64, i64)>;
}

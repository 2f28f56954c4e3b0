//! Transaction & Version Manager Module
//!
//! Entity-group locking and the version protocol that keeps readers on
//! committed data.
//!
//! ## Responsibilities
//! - Acquire group locks for non-transactional writes (with retries)
//! - Acquire group locks for explicit transactions
//! - Register previous versions before overwriting rows
//! - Resolve every raw entity read to a committed version
//! - Commit and rollback
//!
//! ## Write States
//! ```text
//! non-transactional:  Idle → LockAcquired → Writing → Committed
//! explicit:           Idle → LockAcquired(txn) → Writing → Commit | Rollback
//! ```

mod manager;

pub use manager::TransactionManager;

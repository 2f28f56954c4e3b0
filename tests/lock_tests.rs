//! Tests for InMemoryLockService
//!
//! These tests verify:
//! - Transaction id issue and per-group exclusive locks
//! - Multi-group limits
//! - Version resolution for committed, in-flight and failed transactions
//! - Counters and fault injection

use kindkv::lock::{InMemoryLockService, LockError, LockService, MAX_GROUPS_FOR_XG};

// =============================================================================
// Helper Functions
// =============================================================================

const APP: &str = "app";

fn group(n: u32) -> Vec<u8> {
    format!("group-{}", n).into_bytes()
}

// =============================================================================
// Lock Tests
// =============================================================================

#[test]
fn test_transaction_ids_increase_per_app() {
    let lock = InMemoryLockService::new();
    let first = lock.get_transaction_id(APP, false).unwrap();
    let second = lock.get_transaction_id(APP, false).unwrap();
    assert!(second > first);

    // Separate counter per application
    assert_eq!(lock.get_transaction_id("other", false).unwrap(), 1);
}

#[test]
fn test_lock_conflict_between_transactions() {
    let lock = InMemoryLockService::new();
    let t1 = lock.get_transaction_id(APP, false).unwrap();
    let t2 = lock.get_transaction_id(APP, false).unwrap();

    lock.acquire_lock(APP, t1, &group(1)).unwrap();
    assert!(matches!(
        lock.acquire_lock(APP, t2, &group(1)),
        Err(LockError::Conflict(_))
    ));
    assert_eq!(lock.lock_holder(APP, &group(1)), Some(t1));
}

#[test]
fn test_resume_after_stored_transactions() {
    let lock = InMemoryLockService::new();
    lock.resume_after(APP, 41);
    assert_eq!(lock.get_transaction_id(APP, false).unwrap(), 42);

    // Never moves backwards
    lock.resume_after(APP, 10);
    assert_eq!(lock.get_transaction_id(APP, false).unwrap(), 43);
    assert_eq!(lock.get_transaction_id("other", false).unwrap(), 1);
}

#[test]
fn test_reacquire_own_lock() {
    let lock = InMemoryLockService::new();
    let txn = lock.get_transaction_id(APP, false).unwrap();
    lock.acquire_lock(APP, txn, &group(1)).unwrap();
    lock.acquire_lock(APP, txn, &group(1)).unwrap();
}

#[test]
fn test_release_frees_group() {
    let lock = InMemoryLockService::new();
    let t1 = lock.get_transaction_id(APP, false).unwrap();
    lock.acquire_lock(APP, t1, &group(1)).unwrap();
    lock.release_lock(APP, t1).unwrap();

    assert_eq!(lock.lock_holder(APP, &group(1)), None);
    let t2 = lock.get_transaction_id(APP, false).unwrap();
    lock.acquire_lock(APP, t2, &group(1)).unwrap();
}

#[test]
fn test_release_twice_is_invalid() {
    let lock = InMemoryLockService::new();
    let txn = lock.get_transaction_id(APP, false).unwrap();
    lock.release_lock(APP, txn).unwrap();
    assert_eq!(lock.release_lock(APP, txn), Err(LockError::InvalidTransaction(txn)));
}

#[test]
fn test_single_group_transaction_limit() {
    let lock = InMemoryLockService::new();
    let txn = lock.get_transaction_id(APP, false).unwrap();
    lock.acquire_lock(APP, txn, &group(1)).unwrap();
    assert!(matches!(
        lock.acquire_lock(APP, txn, &group(2)),
        Err(LockError::TooManyGroups(_))
    ));
}

#[test]
fn test_cross_group_transaction_limit() {
    let lock = InMemoryLockService::new();
    let txn = lock.get_transaction_id(APP, true).unwrap();
    assert!(lock.is_xg(APP, txn).unwrap());

    for n in 0..MAX_GROUPS_FOR_XG as u32 {
        lock.acquire_lock(APP, txn, &group(n)).unwrap();
    }
    assert!(matches!(
        lock.acquire_lock(APP, txn, &group(99)),
        Err(LockError::TooManyGroups(_))
    ));
}

// =============================================================================
// Version Resolution Tests
// =============================================================================

#[test]
fn test_committed_version_resolves_to_itself() {
    let lock = InMemoryLockService::new();
    let txn = lock.get_transaction_id(APP, false).unwrap();
    lock.release_lock(APP, txn).unwrap();
    assert_eq!(lock.get_valid_transaction_id(APP, txn, b"row").unwrap(), txn);
}

#[test]
fn test_in_flight_version_resolves_to_previous() {
    let lock = InMemoryLockService::new();
    let txn = lock.get_transaction_id(APP, false).unwrap();
    lock.register_updated_key(APP, txn, 3, b"row").unwrap();

    assert_eq!(lock.get_valid_transaction_id(APP, txn, b"row").unwrap(), 3);
    // Rows the transaction did not register keep their stamp
    assert_eq!(lock.get_valid_transaction_id(APP, txn, b"other").unwrap(), txn);
}

#[test]
fn test_failed_version_resolves_to_registered_previous() {
    let lock = InMemoryLockService::new();
    let txn = lock.get_transaction_id(APP, false).unwrap();
    lock.register_updated_key(APP, txn, 3, b"row").unwrap();
    lock.notify_failed_transaction(APP, txn).unwrap();

    assert!(lock.is_failed(APP, txn));
    assert_eq!(lock.get_valid_transaction_id(APP, txn, b"row").unwrap(), 3);
    assert_eq!(lock.get_valid_transaction_id(APP, txn, b"unknown").unwrap(), 0);
}

#[test]
fn test_first_registration_wins() {
    let lock = InMemoryLockService::new();
    let txn = lock.get_transaction_id(APP, false).unwrap();
    lock.register_updated_key(APP, txn, 3, b"row").unwrap();
    lock.register_updated_key(APP, txn, 8, b"row").unwrap();

    assert_eq!(lock.updated_keys(APP, txn).unwrap(), vec![(b"row".to_vec(), 3)]);
}

#[test]
fn test_notify_failed_after_commit_is_noop() {
    let lock = InMemoryLockService::new();
    let txn = lock.get_transaction_id(APP, false).unwrap();
    lock.release_lock(APP, txn).unwrap();
    lock.notify_failed_transaction(APP, txn).unwrap();

    assert!(!lock.is_failed(APP, txn));
    assert_eq!(lock.get_valid_transaction_id(APP, txn, b"row").unwrap(), txn);
}

#[test]
fn test_failed_transaction_releases_locks() {
    let lock = InMemoryLockService::new();
    let txn = lock.get_transaction_id(APP, false).unwrap();
    lock.acquire_lock(APP, txn, &group(1)).unwrap();
    lock.notify_failed_transaction(APP, txn).unwrap();
    assert_eq!(lock.lock_holder(APP, &group(1)), None);
}

// =============================================================================
// Counter and Fault Tests
// =============================================================================

#[test]
fn test_counter_increments() {
    let lock = InMemoryLockService::new();
    assert_eq!(lock.increment_and_get_counter("/app/ids", 10).unwrap(), (0, 10));
    assert_eq!(lock.increment_and_get_counter("/app/ids", 0).unwrap(), (10, 10));
    assert_eq!(lock.increment_and_get_counter("/app/ids", 5).unwrap(), (10, 15));
    assert_eq!(lock.increment_and_get_counter("/other/ids", 1).unwrap(), (0, 1));
}

#[test]
fn test_injected_fault_hits_next_call_only() {
    let lock = InMemoryLockService::new();
    lock.inject_fault(LockError::Transient("blip".to_string()));

    assert!(matches!(
        lock.get_transaction_id(APP, false),
        Err(LockError::Transient(_))
    ));
    assert!(lock.get_transaction_id(APP, false).is_ok());
}

#[test]
fn test_unavailable_service() {
    let lock = InMemoryLockService::new();
    lock.set_unavailable(true);
    assert!(matches!(
        lock.get_transaction_id(APP, false),
        Err(LockError::Unavailable(_))
    ));
    lock.set_unavailable(false);
    assert!(lock.get_transaction_id(APP, false).is_ok());
}

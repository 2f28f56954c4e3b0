//! Tests for entity group transactions
//!
//! These tests verify:
//! - Transactional writes hold the group lock until commit or rollback
//! - Readers outside a transaction see the last committed version
//! - Rollback reinstates previous versions (or absence)
//! - Multi-group limits and transaction invalidation

use std::time::Duration;

use kindkv::{Config, Datastore, DatastoreError, Entity, Key, Operator, Query, RetryPolicy};

// =============================================================================
// Helper Functions
// =============================================================================

const APP: &str = "app";

fn datastore() -> Datastore {
    let config = Config::builder()
        .lock_retry(RetryPolicy::fixed(2, Duration::from_millis(1)))
        .id_retry(RetryPolicy::none())
        .build();
    Datastore::in_memory(config).unwrap()
}

fn account(id: i64, balance: i64) -> Entity {
    Entity::new(Key::with_id(APP, "Account", id)).with("balance", balance)
}

fn balance(ds: &Datastore, key: &Key, txn: Option<u64>) -> Option<i64> {
    let entity = ds.get(std::slice::from_ref(key), txn).unwrap().remove(0)?;
    match entity.get("balance") {
        Some(kindkv::PropertyValue::Integer(value)) => Some(*value),
        _ => None,
    }
}

// =============================================================================
// Isolation Tests
// =============================================================================

#[test]
fn test_outside_reader_sees_committed_version() {
    let ds = datastore();
    let key = Key::with_id(APP, "Account", 1);
    ds.put(vec![account(1, 100)], None).unwrap();

    let txn = ds.begin_transaction(APP, false).unwrap();
    ds.put(vec![account(1, 50)], Some(txn)).unwrap();

    assert_eq!(balance(&ds, &key, None), Some(100));
    assert_eq!(balance(&ds, &key, Some(txn)), Some(50));

    ds.commit(APP, txn).unwrap();
    assert_eq!(balance(&ds, &key, None), Some(50));
}

#[test]
fn test_uncommitted_new_entity_is_invisible() {
    let ds = datastore();
    let key = Key::with_id(APP, "Account", 1);

    let txn = ds.begin_transaction(APP, false).unwrap();
    ds.put(vec![account(1, 10)], Some(txn)).unwrap();

    assert_eq!(balance(&ds, &key, None), None);
    let result = ds.run_query(&Query::new(APP, "Account")).unwrap();
    assert!(result.entities.is_empty());

    ds.commit(APP, txn).unwrap();
    let result = ds.run_query(&Query::new(APP, "Account")).unwrap();
    assert_eq!(result.keys(), vec![key]);
}

#[test]
fn test_uncommitted_delete_is_invisible() {
    let ds = datastore();
    let key = Key::with_id(APP, "Account", 1);
    ds.put(vec![account(1, 100)], None).unwrap();

    let txn = ds.begin_transaction(APP, false).unwrap();
    ds.delete(std::slice::from_ref(&key), Some(txn)).unwrap();

    assert_eq!(balance(&ds, &key, None), Some(100));
    assert_eq!(balance(&ds, &key, Some(txn)), None);

    ds.commit(APP, txn).unwrap();
    assert_eq!(balance(&ds, &key, None), None);
}

#[test]
fn test_transaction_blocks_outside_writer() {
    let ds = datastore();
    ds.put(vec![account(1, 100)], None).unwrap();

    let txn = ds.begin_transaction(APP, false).unwrap();
    ds.put(vec![account(1, 50)], Some(txn)).unwrap();

    let blocked = ds.put(vec![account(1, 0)], None);
    assert!(matches!(blocked, Err(DatastoreError::ConcurrentModification(_))));

    ds.commit(APP, txn).unwrap();
    ds.put(vec![account(1, 0)], None).unwrap();
    assert_eq!(balance(&ds, &Key::with_id(APP, "Account", 1), None), Some(0));
}

#[test]
fn test_other_groups_are_not_blocked() {
    let ds = datastore();
    let txn = ds.begin_transaction(APP, false).unwrap();
    ds.put(vec![account(1, 50)], Some(txn)).unwrap();

    ds.put(vec![account(2, 75)], None).unwrap();
    ds.commit(APP, txn).unwrap();
}

#[test]
fn test_second_transaction_conflicts() {
    let ds = datastore();
    let key = Key::with_id(APP, "Account", 1);
    let first = ds.begin_transaction(APP, false).unwrap();
    let second = ds.begin_transaction(APP, false).unwrap();

    ds.get(std::slice::from_ref(&key), Some(first)).unwrap();
    let result = ds.get(std::slice::from_ref(&key), Some(second));
    assert!(matches!(result, Err(DatastoreError::ConcurrentModification(_))));

    // The losing transaction is finished
    assert!(matches!(
        ds.commit(APP, second),
        Err(DatastoreError::ConcurrentModification(_))
    ));
    ds.commit(APP, first).unwrap();
}

// =============================================================================
// Rollback Tests
// =============================================================================

#[test]
fn test_rollback_restores_previous_version() {
    let ds = datastore();
    let key = Key::with_id(APP, "Account", 1);
    ds.put(vec![account(1, 100)], None).unwrap();

    let txn = ds.begin_transaction(APP, false).unwrap();
    ds.put(vec![account(1, 50)], Some(txn)).unwrap();
    ds.put(vec![account(1, 25)], Some(txn)).unwrap();
    ds.rollback(APP, txn).unwrap();

    assert_eq!(balance(&ds, &key, None), Some(100));

    // Index rows follow the restored version
    let query = Query::new(APP, "Account").filter("balance", Operator::Equal, 100);
    assert_eq!(ds.run_query(&query).unwrap().keys(), vec![key.clone()]);
    let query = Query::new(APP, "Account").filter("balance", Operator::Equal, 25);
    assert!(ds.run_query(&query).unwrap().entities.is_empty());

    // The group is free again
    ds.put(vec![account(1, 1)], None).unwrap();
}

#[test]
fn test_rollback_removes_new_entity() {
    let ds = datastore();
    let key = Key::with_id(APP, "Account", 1);

    let txn = ds.begin_transaction(APP, false).unwrap();
    ds.put(vec![account(1, 10)], Some(txn)).unwrap();
    ds.rollback(APP, txn).unwrap();

    assert_eq!(balance(&ds, &key, None), None);
    assert!(ds.run_query(&Query::new(APP, "Account")).unwrap().entities.is_empty());
    let query = Query::new(APP, "Account").filter("balance", Operator::Equal, 10);
    assert!(ds.run_query(&query).unwrap().entities.is_empty());
}

#[test]
fn test_rollback_restores_deleted_entity() {
    let ds = datastore();
    let key = Key::with_id(APP, "Account", 1);
    ds.put(vec![account(1, 100)], None).unwrap();

    let txn = ds.begin_transaction(APP, false).unwrap();
    ds.delete(std::slice::from_ref(&key), Some(txn)).unwrap();
    ds.rollback(APP, txn).unwrap();

    assert_eq!(balance(&ds, &key, None), Some(100));
    assert_eq!(ds.run_query(&Query::new(APP, "Account")).unwrap().keys(), vec![key]);
}

#[test]
fn test_commit_after_rollback_fails() {
    let ds = datastore();
    let txn = ds.begin_transaction(APP, false).unwrap();
    ds.put(vec![account(1, 10)], Some(txn)).unwrap();
    ds.rollback(APP, txn).unwrap();

    let result = ds.commit(APP, txn);
    assert!(matches!(result, Err(DatastoreError::ConcurrentModification(_))));
    assert!(result.unwrap_err().is_retryable());
}

#[test]
fn test_commit_twice_fails() {
    let ds = datastore();
    let txn = ds.begin_transaction(APP, false).unwrap();
    ds.commit(APP, txn).unwrap();
    assert!(ds.commit(APP, txn).is_err());
}

// =============================================================================
// Group Limit Tests
// =============================================================================

#[test]
fn test_single_group_transaction_rejects_second_group() {
    let ds = datastore();
    let txn = ds.begin_transaction(APP, false).unwrap();
    ds.put(vec![account(1, 10)], Some(txn)).unwrap();

    let result = ds.put(vec![account(2, 10)], Some(txn));
    assert!(matches!(result, Err(DatastoreError::BadRequest(_))));

    // The transaction was invalidated by the failure
    assert!(ds.commit(APP, txn).is_err());
    assert_eq!(balance(&ds, &Key::with_id(APP, "Account", 1), None), None);
}

#[test]
fn test_cross_group_transaction() {
    let ds = datastore();
    let txn = ds.begin_transaction(APP, true).unwrap();
    ds.put(vec![account(1, 10), account(2, 20), account(3, 30)], Some(txn))
        .unwrap();
    ds.commit(APP, txn).unwrap();

    let result = ds.run_query(&Query::new(APP, "Account")).unwrap();
    assert_eq!(result.entities.len(), 3);
}

#[test]
fn test_children_share_group_lock() {
    let ds = datastore();
    let parent = Key::with_id(APP, "Account", 1);
    let child = parent.child_with_id("Entry", 1);

    let txn = ds.begin_transaction(APP, false).unwrap();
    ds.put(
        vec![account(1, 10), Entity::new(child.clone()).with("amount", 10)],
        Some(txn),
    )
    .unwrap();

    let blocked = ds.put(vec![Entity::new(child).with("amount", 99)], None);
    assert!(matches!(blocked, Err(DatastoreError::ConcurrentModification(_))));
    ds.commit(APP, txn).unwrap();
}

// =============================================================================
// Transactional Query Tests
// =============================================================================

#[test]
fn test_transactional_query_requires_ancestor() {
    let ds = datastore();
    let txn = ds.begin_transaction(APP, false).unwrap();
    let result = ds.run_query(&Query::new(APP, "Account").transaction(txn));
    assert!(matches!(result, Err(DatastoreError::BadRequest(_))));
}

#[test]
fn test_transactional_ancestor_query_sees_own_writes() {
    let ds = datastore();
    let parent = Key::with_id(APP, "Account", 1);
    ds.put(vec![account(1, 100)], None).unwrap();

    let txn = ds.begin_transaction(APP, false).unwrap();
    let entry = Entity::new(parent.child_with_id("Entry", 1)).with("amount", 5);
    ds.put(vec![entry], Some(txn)).unwrap();

    let inside = ds
        .run_query(&Query::kindless(APP).ancestor(parent.clone()).transaction(txn))
        .unwrap();
    assert_eq!(inside.entities.len(), 2);

    let outside = ds.run_query(&Query::kindless(APP).ancestor(parent)).unwrap();
    assert_eq!(outside.entities.len(), 1);
    ds.commit(APP, txn).unwrap();
}

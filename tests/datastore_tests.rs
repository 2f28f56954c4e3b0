//! Tests for the Datastore entry points
//!
//! These tests verify:
//! - Put/get/delete round trips and absent results
//! - Id assignment for incomplete keys
//! - Request validation (keys, properties, mixed applications)
//! - Error codes and client-facing details
//! - Cleanup after backend and lock service failures

use std::sync::Arc;
use std::time::Duration;

use kindkv::lock::{InMemoryLockService, LockError};
use kindkv::store::MemoryStore;
use kindkv::writer::group_key;
use kindkv::{
    Config, Datastore, DatastoreError, Entity, ErrorCode, Key, Operator, PathElement, PropertyValue,
    Query, RetryPolicy,
};

// =============================================================================
// Helper Functions
// =============================================================================

const APP: &str = "app";

struct Harness {
    store: Arc<MemoryStore>,
    lock: Arc<InMemoryLockService>,
    ds: Datastore,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let lock = Arc::new(InMemoryLockService::new());
    let config = Config::builder()
        .lock_retry(RetryPolicy::fixed(2, Duration::from_millis(1)))
        .id_retry(RetryPolicy::none())
        .build();
    let ds = Datastore::open(config, store.clone(), lock.clone()).unwrap();
    Harness { store, lock, ds }
}

fn alice() -> Entity {
    Entity::new(Key::with_id(APP, "Person", 1))
        .with("name", "Alice")
        .with("age", 30)
}

// =============================================================================
// Entity Round Trip Tests
// =============================================================================

#[test]
fn test_put_then_get() {
    let h = harness();
    let keys = h.ds.put(vec![alice()], None).unwrap();
    assert_eq!(keys, vec![alice().key]);

    let fetched = h.ds.get(&keys, None).unwrap();
    assert_eq!(fetched, vec![Some(alice())]);
}

#[test]
fn test_every_value_type_survives() {
    let h = harness();
    let entity = Entity::new(Key::with_name(APP, "Sample", "all"))
        .with("null", PropertyValue::Null)
        .with("int", -7)
        .with("when", PropertyValue::Timestamp(1_700_000_000_000_000))
        .with("flag", true)
        .with("blob", PropertyValue::Bytes(vec![0, 1, 2, 255]))
        .with("text", "with \u{0} inside")
        .with("ratio", 0.25)
        .with("where", PropertyValue::GeoPoint { lat: 52.5, lng: 13.4 })
        .with("owner", PropertyValue::user("a@example.com"))
        .with("ref", Key::with_id(APP, "Person", 1));
    h.ds.put(vec![entity.clone()], None).unwrap();

    assert_eq!(h.ds.get(&[entity.key.clone()], None).unwrap(), vec![Some(entity)]);
}

#[test]
fn test_delete_then_get_is_absent() {
    let h = harness();
    h.ds.put(vec![alice()], None).unwrap();
    h.ds.delete(&[alice().key], None).unwrap();

    assert_eq!(h.ds.get(&[alice().key], None).unwrap(), vec![None]);
    assert!(h.ds.run_query(&Query::new(APP, "Person")).unwrap().entities.is_empty());
}

#[test]
fn test_delete_missing_entity_is_ok() {
    let h = harness();
    h.ds.delete(&[Key::with_id(APP, "Person", 404)], None).unwrap();
}

#[test]
fn test_put_after_delete_revives() {
    let h = harness();
    h.ds.put(vec![alice()], None).unwrap();
    h.ds.delete(&[alice().key], None).unwrap();
    h.ds.put(vec![alice()], None).unwrap();
    assert_eq!(h.ds.get(&[alice().key], None).unwrap(), vec![Some(alice())]);
}

#[test]
fn test_get_preserves_order_and_gaps() {
    let h = harness();
    let bob = Entity::new(Key::with_id(APP, "Person", 2)).with("name", "Bob");
    h.ds.put(vec![alice(), bob.clone()], None).unwrap();

    let keys = vec![bob.key.clone(), Key::with_id(APP, "Person", 3), alice().key];
    let fetched = h.ds.get(&keys, None).unwrap();
    assert_eq!(fetched, vec![Some(bob), None, Some(alice())]);
}

#[test]
fn test_empty_requests() {
    let h = harness();
    assert!(h.ds.put(Vec::new(), None).unwrap().is_empty());
    assert!(h.ds.get(&[], None).unwrap().is_empty());
    h.ds.delete(&[], None).unwrap();
}

#[test]
fn test_duplicate_keys_last_wins() {
    let h = harness();
    let first = alice();
    let second = alice().with("nickname", "Al");
    let keys = h.ds.put(vec![first, second.clone()], None).unwrap();
    assert_eq!(keys.len(), 2);

    assert_eq!(h.ds.get(&[second.key.clone()], None).unwrap(), vec![Some(second)]);
    let by_nickname = Query::new(APP, "Person").filter("nickname", Operator::Equal, "Al");
    assert_eq!(h.ds.run_query(&by_nickname).unwrap().entities.len(), 1);
}

#[test]
fn test_repeated_property_accessors() {
    let h = harness();
    let post = Entity::new(Key::with_id(APP, "Post", 1))
        .with("tag", "rust")
        .with("tag", "db");
    h.ds.put(vec![post.clone()], None).unwrap();
    let fetched = h.ds.get(&[post.key], None).unwrap().remove(0).unwrap();

    // The first value outlives the name it was looked up with
    let first = {
        let name = String::from("tag");
        fetched.get(&name)
    };
    assert_eq!(first, Some(&PropertyValue::from("rust")));
    let all: Vec<&PropertyValue> = fetched.values("tag").collect();
    assert_eq!(all, vec![&PropertyValue::from("rust"), &PropertyValue::from("db")]);
    assert_eq!(fetched.get("missing"), None);
}

// =============================================================================
// Id Assignment Tests
// =============================================================================

#[test]
fn test_incomplete_keys_get_distinct_ids() {
    let h = harness();
    let parent = Key::with_name(APP, "Family", "smith");
    let keys = h
        .ds
        .put(
            vec![
                Entity::new(Key::incomplete(APP, "Note")).with("n", 1),
                Entity::new(parent.child(PathElement::incomplete("Person"))).with("n", 2),
            ],
            None,
        )
        .unwrap();

    assert!(keys.iter().all(Key::is_complete));
    assert_ne!(keys[0].last().unwrap().id, keys[1].last().unwrap().id);
    assert_eq!(keys[1].parent(), Some(parent));

    let fetched = h.ds.get(&keys, None).unwrap();
    assert!(fetched.iter().all(Option::is_some));
}

#[test]
fn test_reserved_ids_are_not_reused() {
    let h = harness();
    h.ds.reserve_ids(APP, &[500]).unwrap();
    let keys = h
        .ds
        .put(vec![Entity::new(Key::incomplete(APP, "Note"))], None)
        .unwrap();
    assert_eq!(keys[0].last().unwrap().id, Some(501));
}

// =============================================================================
// Validation Tests
// =============================================================================

#[test]
fn test_invalid_entities_are_rejected() {
    let h = harness();
    let invalid = vec![
        Entity::new(Key::with_id("", "Person", 1)),
        Entity::new(Key::with_id(APP, "Per:son", 1)),
        Entity::new(Key::with_id(APP, "Person", 0)),
        Entity::new(Key::with_name(APP, "Person", "0000000042")),
        Entity::new(Key::new(APP, "", Vec::new())),
        Entity::new(Key::incomplete(APP, "Family").child_with_id("Person", 1)),
        alice().with("__reserved__", 1),
        alice().with("", 1),
    ];
    for entity in invalid {
        let result = h.ds.put(vec![entity.clone()], None);
        assert!(
            matches!(result, Err(DatastoreError::BadRequest(_))),
            "{:?} should be rejected",
            entity.key
        );
    }
    assert!(h.store.is_empty());
}

#[test]
fn test_incomplete_key_get_is_rejected() {
    let h = harness();
    let result = h.ds.get(&[Key::incomplete(APP, "Person")], None);
    assert!(matches!(result, Err(DatastoreError::BadRequest(_))));
}

#[test]
fn test_mixed_applications_are_rejected() {
    let h = harness();
    let other = Entity::new(Key::with_id("other", "Person", 1));
    let result = h.ds.put(vec![alice(), other], None);
    assert!(matches!(result, Err(DatastoreError::BadRequest(_))));

    let result = h.ds.get(&[alice().key, Key::with_id("other", "Person", 1)], None);
    assert!(matches!(result, Err(DatastoreError::BadRequest(_))));
}

// =============================================================================
// Error Mapping Tests
// =============================================================================

#[test]
fn test_error_codes() {
    assert_eq!(
        DatastoreError::BadRequest("x".to_string()).code(),
        ErrorCode::BadRequest
    );
    assert_eq!(
        DatastoreError::ConcurrentModification("x".to_string()).code(),
        ErrorCode::ConcurrentTransaction
    );
    assert_eq!(DatastoreError::NeedsIndex("x".to_string()).code(), ErrorCode::NeedIndex);
    assert_eq!(
        DatastoreError::Backend("x".to_string()).code(),
        ErrorCode::InternalError
    );
    assert!(DatastoreError::ConcurrentModification("x".to_string()).is_retryable());
    assert!(!DatastoreError::LockService("x".to_string()).is_retryable());
}

#[test]
fn test_public_detail_hides_internals() {
    let backend = DatastoreError::Backend("disk /dev/sda1 on fire".to_string());
    assert!(!backend.public_detail().contains("sda1"));

    let bad = DatastoreError::BadRequest("kind is empty".to_string());
    assert_eq!(bad.public_detail(), "kind is empty");
}

#[test]
fn test_unavailable_store_is_internal_error() {
    let h = harness();
    h.ds.put(vec![alice()], None).unwrap();
    h.store.set_unavailable(true);

    let err = h.ds.get(&[alice().key], None).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InternalError);
    assert!(matches!(err, DatastoreError::Backend(_)));
}

#[test]
fn test_unavailable_lock_service_is_internal_error() {
    let h = harness();
    h.lock.set_unavailable(true);

    let err = h.ds.put(vec![alice()], None).unwrap_err();
    assert!(matches!(err, DatastoreError::LockService(_)));
    assert_eq!(err.code(), ErrorCode::InternalError);

    h.lock.set_unavailable(false);
    h.ds.put(vec![alice()], None).unwrap();
}

// =============================================================================
// Failure Cleanup Tests
// =============================================================================

#[test]
fn test_failed_write_releases_lock_and_hides_partial_rows() {
    let h = harness();
    let key = alice().key;

    // The entity row goes through, the kind row does not
    h.store.fail_writes_after(1);
    assert!(h.ds.put(vec![alice()], None).is_err());
    h.store.clear_failures();

    assert_eq!(h.lock.lock_holder(APP, &group_key(&key)), None);
    assert!(h.lock.is_failed(APP, 1));
    assert_eq!(h.ds.get(&[key.clone()], None).unwrap(), vec![None]);

    // The group is usable again
    h.ds.put(vec![alice()], None).unwrap();
    assert_eq!(h.ds.get(&[key], None).unwrap(), vec![Some(alice())]);
}

#[test]
fn test_failed_update_keeps_previous_version_visible() {
    let h = harness();
    h.ds.put(vec![alice()], None).unwrap();

    h.store.fail_writes_after(3);
    let older = alice().with("age", 31);
    assert!(h.ds.put(vec![older], None).is_err());
    h.store.clear_failures();

    assert_eq!(h.ds.get(&[alice().key], None).unwrap(), vec![Some(alice())]);
}

#[test]
fn test_failed_transactional_write_invalidates_transaction() {
    let h = harness();
    let txn = h.ds.begin_transaction(APP, false).unwrap();

    h.store.fail_writes_after(0);
    assert!(h.ds.put(vec![alice()], Some(txn)).is_err());
    h.store.clear_failures();

    assert!(matches!(
        h.ds.commit(APP, txn),
        Err(DatastoreError::ConcurrentModification(_))
    ));
    assert_eq!(h.lock.lock_holder(APP, &group_key(&alice().key)), None);
}

#[test]
fn test_lock_conflict_after_retries() {
    let h = harness();
    let txn = h.ds.begin_transaction(APP, false).unwrap();
    h.ds.get(&[alice().key], Some(txn)).unwrap();

    let err = h.ds.put(vec![alice()], None).unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConcurrentTransaction);

    // The group frees up once the transaction commits
    h.ds.commit(APP, txn).unwrap();
    h.ds.put(vec![alice()], None).unwrap();
}

#[test]
fn test_transient_lock_failure_surfaces() {
    let h = harness();
    h.lock.inject_fault(LockError::Transient("blip".to_string()));
    let err = h.ds.put(vec![alice()], None).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InternalError);
}

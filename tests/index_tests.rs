//! Tests for composite index management
//!
//! These tests verify:
//! - Index creation, backfill and the move to ReadWrite
//! - Definition validation and per-app limits
//! - Updates, state changes and re-backfills
//! - Deletion and row cleanup

use std::sync::Arc;

use kindkv::lock::InMemoryLockService;
use kindkv::store::{MemoryStore, Table};
use kindkv::{
    Config, Datastore, DatastoreError, Entity, IndexDefinition, IndexProperty, IndexState, Key,
};

// =============================================================================
// Helper Functions
// =============================================================================

const APP: &str = "app";

fn open(config: Config) -> (Arc<MemoryStore>, Datastore) {
    let store = Arc::new(MemoryStore::new());
    let ds = Datastore::open(config, store.clone(), Arc::new(InMemoryLockService::new())).unwrap();
    (store, ds)
}

fn setup() -> (Arc<MemoryStore>, Datastore) {
    open(Config::builder().backfill_batch_size(2).build())
}

fn person(id: i64, name: &str, age: i64) -> Entity {
    Entity::new(Key::with_id(APP, "Person", id))
        .with("name", name)
        .with("age", age)
}

fn seed(ds: &Datastore, count: i64) {
    let people = (1..=count)
        .map(|id| person(id, &format!("person-{}", id), 20 + id))
        .collect();
    ds.put(people, None).unwrap();
}

fn by_age_and_name() -> IndexDefinition {
    IndexDefinition::new(
        "Person",
        false,
        vec![IndexProperty::asc("age"), IndexProperty::asc("name")],
    )
}

fn state_of(ds: &Datastore, id: u64) -> Option<IndexState> {
    ds.list_composite_indexes(APP)
        .unwrap()
        .into_iter()
        .find(|index| index.id == id)
        .map(|index| index.state)
}

// =============================================================================
// Creation Tests
// =============================================================================

#[test]
fn test_create_backfills_existing_entities() {
    let (store, ds) = setup();
    seed(&ds, 5);
    ds.put(vec![Entity::new(Key::with_id(APP, "Robot", 1)).with("age", 3)], None)
        .unwrap();

    let id = ds.create_composite_index(APP, by_age_and_name()).unwrap();
    ds.wait_for_index(APP, id).unwrap();

    assert_eq!(state_of(&ds, id), Some(IndexState::ReadWrite));
    assert_eq!(store.len(Table::Composite), 5);
}

#[test]
fn test_backfill_skips_entities_missing_properties() {
    let (store, ds) = setup();
    seed(&ds, 2);
    ds.put(vec![Entity::new(Key::with_id(APP, "Person", 9)).with("age", 50)], None)
        .unwrap();

    let id = ds.create_composite_index(APP, by_age_and_name()).unwrap();
    ds.wait_for_index(APP, id).unwrap();
    assert_eq!(store.len(Table::Composite), 2);
}

#[test]
fn test_backfill_covers_every_namespace() {
    let (store, ds) = setup();
    seed(&ds, 1);
    let scoped = Entity::new(Key::with_id(APP, "Person", 1).in_namespace("tenant"))
        .with("name", "x")
        .with("age", 1);
    ds.put(vec![scoped], None).unwrap();

    let id = ds.create_composite_index(APP, by_age_and_name()).unwrap();
    ds.wait_for_index(APP, id).unwrap();
    assert_eq!(store.len(Table::Composite), 2);
}

#[test]
fn test_writes_maintain_new_index() {
    let (store, ds) = setup();
    let id = ds.create_composite_index(APP, by_age_and_name()).unwrap();
    ds.wait_for_index(APP, id).unwrap();
    assert_eq!(store.len(Table::Composite), 0);

    ds.put(vec![person(1, "alice", 30)], None).unwrap();
    assert_eq!(store.len(Table::Composite), 1);

    // Updating replaces the row
    ds.put(vec![person(1, "alice", 31)], None).unwrap();
    assert_eq!(store.len(Table::Composite), 1);

    ds.delete(&[Key::with_id(APP, "Person", 1)], None).unwrap();
    assert_eq!(store.len(Table::Composite), 0);
}

#[test]
fn test_identical_definition_returns_existing_id() {
    let (_store, ds) = setup();
    let first = ds.create_composite_index(APP, by_age_and_name()).unwrap();
    let second = ds.create_composite_index(APP, by_age_and_name()).unwrap();
    assert_eq!(first, second);
    assert_eq!(ds.list_composite_indexes(APP).unwrap().len(), 1);
}

#[test]
fn test_index_limit_per_app() {
    let (_store, ds) = open(Config::builder().max_composite_indexes(1).build());
    ds.create_composite_index(APP, by_age_and_name()).unwrap();

    let other = IndexDefinition::new("Person", false, vec![IndexProperty::desc("age")]);
    assert!(matches!(
        ds.create_composite_index(APP, other.clone()),
        Err(DatastoreError::BadRequest(_))
    ));

    // The limit is per application
    ds.create_composite_index("other", other).unwrap();
}

#[test]
fn test_invalid_definitions() {
    let (_store, ds) = setup();
    let invalid = vec![
        IndexDefinition::new("Person", false, vec![]),
        IndexDefinition::new("", false, vec![IndexProperty::asc("age")]),
        IndexDefinition::new("Per:son", false, vec![IndexProperty::asc("age")]),
        IndexDefinition::new(
            "Person",
            false,
            vec![IndexProperty::asc("age"), IndexProperty::desc("age")],
        ),
        IndexDefinition::new("Person", false, vec![IndexProperty::asc("__scatter__")]),
    ];
    for definition in invalid {
        assert!(
            matches!(
                ds.create_composite_index(APP, definition.clone()),
                Err(DatastoreError::BadRequest(_))
            ),
            "{:?} should be rejected",
            definition
        );
    }
    assert!(ds.list_composite_indexes(APP).unwrap().is_empty());
}

#[test]
fn test_key_property_is_allowed() {
    let (_store, ds) = setup();
    let definition = IndexDefinition::new(
        "Person",
        false,
        vec![IndexProperty::asc("age"), IndexProperty::desc("__key__")],
    );
    let id = ds.create_composite_index(APP, definition).unwrap();
    ds.wait_for_index(APP, id).unwrap();
}

#[test]
fn test_list_is_scoped_to_app() {
    let (_store, ds) = setup();
    ds.create_composite_index(APP, by_age_and_name()).unwrap();
    assert!(ds.list_composite_indexes("other").unwrap().is_empty());
}

// =============================================================================
// Update Tests
// =============================================================================

#[test]
fn test_update_to_write_only_rebuilds() {
    let (store, ds) = setup();
    seed(&ds, 3);
    let id = ds.create_composite_index(APP, by_age_and_name()).unwrap();
    ds.wait_for_index(APP, id).unwrap();

    let mut index = ds.list_composite_indexes(APP).unwrap().remove(0);
    index.state = IndexState::WriteOnly;
    ds.update_composite_index(APP, index).unwrap();
    ds.wait_for_index(APP, id).unwrap();

    assert_eq!(state_of(&ds, id), Some(IndexState::ReadWrite));
    assert_eq!(store.len(Table::Composite), 3);
}

#[test]
fn test_error_state_index_is_not_maintained() {
    let (store, ds) = setup();
    let id = ds.create_composite_index(APP, by_age_and_name()).unwrap();
    ds.wait_for_index(APP, id).unwrap();

    let mut index = ds.list_composite_indexes(APP).unwrap().remove(0);
    index.state = IndexState::Error;
    ds.update_composite_index(APP, index).unwrap();

    ds.put(vec![person(1, "alice", 30)], None).unwrap();
    assert_eq!(store.len(Table::Composite), 0);
    assert_eq!(state_of(&ds, id), Some(IndexState::Error));
}

#[test]
fn test_update_rejects_unknown_or_foreign_index() {
    let (_store, ds) = setup();
    let id = ds.create_composite_index(APP, by_age_and_name()).unwrap();
    ds.wait_for_index(APP, id).unwrap();
    let index = ds.list_composite_indexes(APP).unwrap().remove(0);

    let mut unknown = index.clone();
    unknown.id = id.wrapping_add(1);
    assert!(matches!(
        ds.update_composite_index(APP, unknown),
        Err(DatastoreError::BadRequest(_))
    ));

    assert!(matches!(
        ds.update_composite_index("other", index),
        Err(DatastoreError::BadRequest(_))
    ));
}

// =============================================================================
// Deletion Tests
// =============================================================================

#[test]
fn test_delete_removes_rows_and_definition() {
    let (store, ds) = setup();
    seed(&ds, 5);
    let id = ds.create_composite_index(APP, by_age_and_name()).unwrap();
    ds.wait_for_index(APP, id).unwrap();
    assert_eq!(store.len(Table::Composite), 5);

    ds.delete_composite_index(APP, id).unwrap();
    ds.wait_for_index(APP, id).unwrap();

    assert_eq!(store.len(Table::Composite), 0);
    assert!(ds.list_composite_indexes(APP).unwrap().is_empty());

    // Further writes no longer produce rows
    ds.put(vec![person(9, "zed", 60)], None).unwrap();
    assert_eq!(store.len(Table::Composite), 0);
}

#[test]
fn test_delete_keeps_other_index_rows() {
    let (store, ds) = setup();
    seed(&ds, 2);
    let doomed = ds.create_composite_index(APP, by_age_and_name()).unwrap();
    let kept = ds
        .create_composite_index(
            APP,
            IndexDefinition::new("Person", false, vec![IndexProperty::desc("name")]),
        )
        .unwrap();
    ds.wait_for_index(APP, doomed).unwrap();
    ds.wait_for_index(APP, kept).unwrap();
    assert_eq!(store.len(Table::Composite), 4);

    ds.delete_composite_index(APP, doomed).unwrap();
    ds.wait_for_index(APP, doomed).unwrap();
    assert_eq!(store.len(Table::Composite), 2);
}

#[test]
fn test_delete_unknown_index() {
    let (_store, ds) = setup();
    assert!(matches!(
        ds.delete_composite_index(APP, 12345),
        Err(DatastoreError::BadRequest(_))
    ));
}

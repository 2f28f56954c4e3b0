//! Tests for MemoryStore
//!
//! These tests verify:
//! - Batch get/put/delete per table
//! - Range scans with inclusivity, limit and offset
//! - Snapshot save/open and corruption detection
//! - Failure injection

use std::fs;

use kindkv::store::{BatchStore, EntityRow, MemoryStore, Payload, Row, ScanRange, Table};
use kindkv::DatastoreError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn rows(keys: &[&str]) -> Vec<(Vec<u8>, Vec<u8>)> {
    keys.iter()
        .map(|k| (k.as_bytes().to_vec(), format!("value-{}", k).into_bytes()))
        .collect()
}

fn seeded_store() -> MemoryStore {
    let store = MemoryStore::new();
    store
        .batch_put(Table::Kind, rows(&["a", "b", "c", "d", "e"]))
        .unwrap();
    store
}

fn scan_keys(store: &MemoryStore, range: &ScanRange, limit: usize, offset: usize) -> Vec<String> {
    store
        .range_query(Table::Kind, range, limit, offset)
        .unwrap()
        .into_iter()
        .map(|(k, _)| String::from_utf8(k).unwrap())
        .collect()
}

// =============================================================================
// Batch Operation Tests
// =============================================================================

#[test]
fn test_batch_get_is_parallel_to_keys() {
    let store = seeded_store();
    let result = store
        .batch_get(Table::Kind, &[b"b".to_vec(), b"zz".to_vec(), b"a".to_vec()])
        .unwrap();

    assert_eq!(result[0], Some(b"value-b".to_vec()));
    assert_eq!(result[1], None);
    assert_eq!(result[2], Some(b"value-a".to_vec()));
}

#[test]
fn test_tables_are_independent() {
    let store = seeded_store();
    assert_eq!(store.len(Table::Kind), 5);
    assert_eq!(store.len(Table::Entity), 0);
    assert_eq!(store.batch_get(Table::Entity, &[b"a".to_vec()]).unwrap(), vec![None]);
}

#[test]
fn test_batch_put_overwrites() {
    let store = seeded_store();
    store
        .batch_put(Table::Kind, vec![(b"a".to_vec(), b"new".to_vec())])
        .unwrap();
    assert_eq!(
        store.batch_get(Table::Kind, &[b"a".to_vec()]).unwrap(),
        vec![Some(b"new".to_vec())]
    );
    assert_eq!(store.len(Table::Kind), 5);
}

#[test]
fn test_batch_delete_ignores_missing_keys() {
    let store = seeded_store();
    store
        .batch_delete(Table::Kind, &[b"a".to_vec(), b"missing".to_vec()])
        .unwrap();
    assert_eq!(store.keys(Table::Kind).len(), 4);
}

#[test]
fn test_typed_row_roundtrip_through_store() {
    let store = MemoryStore::new();
    let row = EntityRow {
        payload: Payload::Tombstone,
        txn_id: 12,
    };
    store
        .batch_put(Table::Entity, vec![(b"k".to_vec(), row.to_bytes().unwrap())])
        .unwrap();

    let bytes = store.batch_get(Table::Entity, &[b"k".to_vec()]).unwrap()[0]
        .clone()
        .unwrap();
    assert_eq!(EntityRow::from_bytes(&bytes).unwrap(), row);
}

// =============================================================================
// Range Query Tests
// =============================================================================

#[test]
fn test_range_inclusive_bounds() {
    let store = seeded_store();
    let range = ScanRange::new(b"b".to_vec(), b"d".to_vec());
    assert_eq!(scan_keys(&store, &range, 10, 0), vec!["b", "c", "d"]);
}

#[test]
fn test_range_exclusive_bounds() {
    let store = seeded_store();
    let range = ScanRange {
        start_inclusive: false,
        end_inclusive: false,
        ..ScanRange::new(b"b".to_vec(), b"d".to_vec())
    };
    assert_eq!(scan_keys(&store, &range, 10, 0), vec!["c"]);
}

#[test]
fn test_range_limit_and_offset() {
    let store = seeded_store();
    let range = ScanRange::new(b"a".to_vec(), b"e".to_vec());
    assert_eq!(scan_keys(&store, &range, 2, 1), vec!["b", "c"]);
}

#[test]
fn test_range_resume_at() {
    let store = seeded_store();
    let range = ScanRange::new(b"a".to_vec(), b"e".to_vec()).resume_at(b"c".to_vec(), false);
    assert_eq!(scan_keys(&store, &range, 10, 0), vec!["d", "e"]);
}

#[test]
fn test_inverted_range_is_empty() {
    let store = seeded_store();
    let range = ScanRange::new(b"d".to_vec(), b"b".to_vec());
    assert!(scan_keys(&store, &range, 10, 0).is_empty());

    let point = ScanRange {
        end_inclusive: false,
        ..ScanRange::new(b"c".to_vec(), b"c".to_vec())
    };
    assert!(scan_keys(&store, &point, 10, 0).is_empty());
}

#[test]
fn test_prefix_range() {
    let store = MemoryStore::new();
    store
        .batch_put(Table::Kind, rows(&["ab", "abc", "abd", "ac", "b"]))
        .unwrap();
    let range = ScanRange::prefix(b"ab");
    assert_eq!(scan_keys(&store, &range, 10, 0), vec!["ab", "abc", "abd"]);
    assert!(range.contains(b"abzz"));
    assert!(!range.contains(b"ac"));
}

// =============================================================================
// Snapshot Tests
// =============================================================================

#[test]
fn test_snapshot_roundtrip() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("store.snapshot");

    let store = seeded_store();
    store
        .batch_put(Table::Journal, vec![(b"j".to_vec(), b"v".to_vec())])
        .unwrap();
    store.save(&path).unwrap();

    let reopened = MemoryStore::open(&path).unwrap();
    assert_eq!(reopened.keys(Table::Kind), store.keys(Table::Kind));
    assert_eq!(
        reopened.batch_get(Table::Journal, &[b"j".to_vec()]).unwrap(),
        vec![Some(b"v".to_vec())]
    );
}

#[test]
fn test_snapshot_detects_corruption() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("store.snapshot");
    seeded_store().save(&path).unwrap();

    let mut bytes = fs::read(&path).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    assert!(matches!(MemoryStore::open(&path), Err(DatastoreError::Backend(_))));
}

#[test]
fn test_snapshot_rejects_bad_magic() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("store.snapshot");
    fs::write(&path, b"NOPE\x01\x00\x00\x00\x00\x00").unwrap();

    assert!(matches!(MemoryStore::open(&path), Err(DatastoreError::Backend(_))));
}

#[test]
fn test_snapshot_missing_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("absent.snapshot");
    assert!(matches!(MemoryStore::open(&path), Err(DatastoreError::Io(_))));
}

// =============================================================================
// Failure Injection Tests
// =============================================================================

#[test]
fn test_unavailable_store_fails_every_call() {
    let store = seeded_store();
    store.set_unavailable(true);

    assert!(matches!(
        store.batch_get(Table::Kind, &[b"a".to_vec()]),
        Err(DatastoreError::Backend(_))
    ));
    assert!(store
        .range_query(Table::Kind, &ScanRange::prefix(b""), 10, 0)
        .is_err());

    store.clear_failures();
    assert!(store.batch_get(Table::Kind, &[b"a".to_vec()]).is_ok());
}

#[test]
fn test_fail_writes_after() {
    let store = MemoryStore::new();
    store.fail_writes_after(1);

    assert!(store.batch_put(Table::Kind, rows(&["a"])).is_ok());
    assert!(store.batch_put(Table::Kind, rows(&["b"])).is_err());
    assert!(store.batch_delete(Table::Kind, &[b"a".to_vec()]).is_err());
    // Reads keep working
    assert_eq!(store.len(Table::Kind), 1);

    store.clear_failures();
    assert!(store.batch_put(Table::Kind, rows(&["b"])).is_ok());
}

//! In-memory batch store
//!
//! BTreeMap-per-table backend with RwLock for concurrency.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use parking_lot::RwLock;

use crate::error::{DatastoreError, Result};

use super::snapshot;
use super::{BatchStore, ScanRange, Table};

type TableData = BTreeMap<Vec<u8>, Vec<u8>>;

/// Sorted in-memory store implementing [`BatchStore`]
///
/// ## Concurrency:
/// - One `RwLock` per table (many concurrent readers, exclusive writer)
/// - Each batch call is atomic per table, not across tables
///
/// ## Failure injection:
/// - `set_unavailable(true)` fails every call with a backend error
/// - `fail_writes_after(n)` lets `n` more write batches through, then fails
///   writes until `clear_failures()`
pub struct MemoryStore {
    tables: Vec<RwLock<TableData>>,
    unavailable: AtomicBool,
    /// Remaining write batches before failing; negative disables
    writes_before_failure: AtomicI64,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            tables: Table::ALL.iter().map(|_| RwLock::new(BTreeMap::new())).collect(),
            unavailable: AtomicBool::new(false),
            writes_before_failure: AtomicI64::new(-1),
        }
    }

    /// Load a store from a snapshot file written by [`MemoryStore::save`]
    pub fn open(path: &Path) -> Result<Self> {
        let store = Self::new();
        for (table, rows) in snapshot::read(path)? {
            store.tables[table.slot()].write().extend(rows);
        }
        Ok(store)
    }

    /// Write every table to a snapshot file
    pub fn save(&self, path: &Path) -> Result<()> {
        let tables: Vec<(Table, Vec<(Vec<u8>, Vec<u8>)>)> = Table::ALL
            .iter()
            .map(|table| {
                let data = self.tables[table.slot()].read();
                let rows = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                (*table, rows)
            })
            .collect();
        snapshot::write(path, &tables)
    }

    /// Number of rows in a table
    pub fn len(&self, table: Table) -> usize {
        self.tables[table.slot()].read().len()
    }

    /// Whether every table is empty
    pub fn is_empty(&self) -> bool {
        self.tables.iter().all(|t| t.read().is_empty())
    }

    /// All keys of a table in order
    pub fn keys(&self, table: Table) -> Vec<Vec<u8>> {
        self.tables[table.slot()].read().keys().cloned().collect()
    }

    // =========================================================================
    // Failure Injection
    // =========================================================================

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn fail_writes_after(&self, batches: u32) {
        self.writes_before_failure
            .store(i64::from(batches), Ordering::SeqCst);
    }

    pub fn clear_failures(&self) {
        self.unavailable.store(false, Ordering::SeqCst);
        self.writes_before_failure.store(-1, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DatastoreError::Backend("store is unavailable".to_string()));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        self.check_available()?;
        let outcome = self.writes_before_failure.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |remaining| if remaining > 0 { Some(remaining - 1) } else { None },
        );
        match outcome {
            Ok(_) => Ok(()),
            Err(0) => Err(DatastoreError::Backend("write batch rejected".to_string())),
            Err(_) => Ok(()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchStore for MemoryStore {
    fn batch_get(&self, table: Table, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>> {
        self.check_available()?;
        let data = self.tables[table.slot()].read();
        Ok(keys.iter().map(|key| data.get(key).cloned()).collect())
    }

    fn batch_put(&self, table: Table, rows: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.check_writable()?;
        self.tables[table.slot()].write().extend(rows);
        Ok(())
    }

    fn batch_delete(&self, table: Table, keys: &[Vec<u8>]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.check_writable()?;
        let mut data = self.tables[table.slot()].write();
        for key in keys {
            data.remove(key);
        }
        Ok(())
    }

    fn range_query(
        &self,
        table: Table,
        range: &ScanRange,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.check_available()?;

        // BTreeMap::range panics on inverted bounds
        if range.start > range.end
            || (range.start == range.end && !(range.start_inclusive && range.end_inclusive))
        {
            return Ok(Vec::new());
        }

        let lower = if range.start_inclusive {
            Bound::Included(range.start.clone())
        } else {
            Bound::Excluded(range.start.clone())
        };
        let upper = if range.end_inclusive {
            Bound::Included(range.end.clone())
        } else {
            Bound::Excluded(range.end.clone())
        };

        let data = self.tables[table.slot()].read();
        Ok(data
            .range((lower, upper))
            .skip(offset)
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

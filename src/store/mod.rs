//! Store Module
//!
//! The narrow batch interface to the sorted key-value backend, and the typed
//! rows stored in each table.
//!
//! ## Responsibilities
//! - `BatchStore`: get/put/delete/range-scan over independent tables
//! - Typed row structs constructed right after every store call
//! - `MemoryStore`: an in-process backend with snapshot files
//!
//! ## Tables
//! ```text
//! ┌────────────┬──────────────────────────────┬──────────────────────┐
//! │ Table      │ Row key                      │ Row value            │
//! ├────────────┼──────────────────────────────┼──────────────────────┤
//! │ Entity     │ entity key                   │ EntityRow            │
//! │ Kind       │ kind key                     │ KindRow (reference)  │
//! │ AscProperty│ property key (ascending)     │ IndexRow (reference) │
//! │ DscProperty│ property key (reverse-lex)   │ IndexRow (reference) │
//! │ Composite  │ composite key                │ CompositeRow         │
//! │ Journal    │ entity key + version         │ JournalRow           │
//! │ Metadata   │ index definition key         │ CompositeIndex       │
//! └────────────┴──────────────────────────────┴──────────────────────┘
//! ```

mod memory;
mod rows;
mod snapshot;

use serde::{Deserialize, Serialize};

use crate::codec::{Direction, TERMINATOR};
use crate::error::Result;

pub use memory::MemoryStore;
pub use rows::{
    decode_rows, CompositeRow, EntityRow, IndexRow, JournalRow, KindRow, Payload, ReferenceRow,
    Row,
};

/// Logical tables of the sorted store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Table {
    Entity,
    Kind,
    AscProperty,
    DscProperty,
    Composite,
    Journal,
    Metadata,
}

impl Table {
    pub const ALL: [Table; 7] = [
        Table::Entity,
        Table::Kind,
        Table::AscProperty,
        Table::DscProperty,
        Table::Composite,
        Table::Journal,
        Table::Metadata,
    ];

    /// Property table scanned for the given direction
    pub fn property(direction: Direction) -> Table {
        match direction {
            Direction::Ascending => Table::AscProperty,
            Direction::Descending => Table::DscProperty,
        }
    }

    pub(crate) fn slot(self) -> usize {
        match self {
            Table::Entity => 0,
            Table::Kind => 1,
            Table::AscProperty => 2,
            Table::DscProperty => 3,
            Table::Composite => 4,
            Table::Journal => 5,
            Table::Metadata => 6,
        }
    }
}

/// Key range of a scan with explicit inclusivity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRange {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
    pub start_inclusive: bool,
    pub end_inclusive: bool,
}

impl ScanRange {
    /// Inclusive range `[start, end]`
    pub fn new(start: Vec<u8>, end: Vec<u8>) -> Self {
        Self {
            start,
            end,
            start_inclusive: true,
            end_inclusive: true,
        }
    }

    /// Every key beginning with `prefix`
    pub fn prefix(prefix: &[u8]) -> Self {
        let mut end = prefix.to_vec();
        end.extend_from_slice(TERMINATOR);
        Self::new(prefix.to_vec(), end)
    }

    /// Same range resumed at `start`
    pub fn resume_at(&self, start: Vec<u8>, inclusive: bool) -> Self {
        Self {
            start,
            end: self.end.clone(),
            start_inclusive: inclusive,
            end_inclusive: self.end_inclusive,
        }
    }

    /// Whether a key lies inside the range
    pub fn contains(&self, key: &[u8]) -> bool {
        let after_start = if self.start_inclusive {
            key >= self.start.as_slice()
        } else {
            key > self.start.as_slice()
        };
        let before_end = if self.end_inclusive {
            key <= self.end.as_slice()
        } else {
            key < self.end.as_slice()
        };
        after_start && before_end
    }
}

/// Batch interface to the sorted key-value backend.
///
/// Implementations must keep byte-lexicographic key order for scans and
/// treat every table as an independent namespace.
pub trait BatchStore: Send + Sync {
    /// Fetch rows by key; the result is parallel to `keys`
    fn batch_get(&self, table: Table, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>>;

    /// Insert or overwrite rows
    fn batch_put(&self, table: Table, rows: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()>;

    /// Remove rows; missing keys are ignored
    fn batch_delete(&self, table: Table, keys: &[Vec<u8>]) -> Result<()>;

    /// Ordered scan of at most `limit` rows after skipping `offset`
    fn range_query(
        &self,
        table: Table,
        range: &ScanRange,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

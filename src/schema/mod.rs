//! Schema / Index Metadata Module
//!
//! Composite index definitions and their lifecycle.
//!
//! ## Responsibilities
//! - Store definitions in the metadata table, keyed by app and index id
//! - Create/update/delete/list definitions
//! - Backfill index rows for existing entities on a background worker
//!
//! ## Index States
//! ```text
//!   create ──► WriteOnly ──(backfill done)──► ReadWrite
//!                  │                             │
//!                  └──(backfill failed)──► Error │
//!   delete ◄─────────────────────────────────────┘
//! ```
//! Writes maintain rows for `WriteOnly` and `ReadWrite` indexes; queries
//! only read `ReadWrite` ones.

mod builder;
mod manager;

use serde::{Deserialize, Serialize};

use crate::codec::Direction;
use crate::store::Row;

pub use manager::IndexManager;

/// One property of a composite index, in index order
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexProperty {
    pub name: String,
    pub direction: Direction,
}

impl IndexProperty {
    pub fn asc(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: Direction::Ascending,
        }
    }

    pub fn desc(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: Direction::Descending,
        }
    }
}

/// What a composite index covers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub kind: String,
    /// Ancestor-scoped indexes get one row per ancestor prefix
    pub ancestor: bool,
    pub properties: Vec<IndexProperty>,
}

impl IndexDefinition {
    pub fn new(kind: impl Into<String>, ancestor: bool, properties: Vec<IndexProperty>) -> Self {
        Self {
            kind: kind.into(),
            ancestor,
            properties,
        }
    }
}

/// Build state of a composite index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexState {
    WriteOnly,
    ReadWrite,
    Error,
}

/// A registered composite index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeIndex {
    pub id: u64,
    pub app: String,
    pub definition: IndexDefinition,
    pub state: IndexState,
}

impl Row for CompositeIndex {}

impl CompositeIndex {
    /// Directions of the index properties, in index order
    pub fn directions(&self) -> Vec<Direction> {
        self.definition.properties.iter().map(|p| p.direction).collect()
    }

    /// Whether writes must maintain rows for this index
    pub fn is_writable(&self) -> bool {
        matches!(self.state, IndexState::WriteOnly | IndexState::ReadWrite)
    }

    /// Whether queries may read this index
    pub fn is_queryable(&self) -> bool {
        self.state == IndexState::ReadWrite
    }
}

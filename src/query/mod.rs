//! Query Planner & Executor Module
//!
//! Turns a declarative query into scans over the index tables, then fetches
//! and validates the referenced entities.
//!
//! ## Responsibilities
//! - Validate and normalize queries
//! - Pick a strategy (composite, kind/ancestor, single property, zigzag)
//! - Compute key ranges from filters, orders and cursors
//! - Fetch referenced entities and drop stale index entries
//! - Apply projections, distinct, offset and limit, and build cursors
//!
//! ## Strategy Selection
//! ```text
//!           ┌───────────────┐
//! query ───►│ validate and  │
//!           │  normalize    │
//!           └──────┬────────┘
//!                  ▼
//!   composite ─► kind/ancestor ─► single property ─► zigzag ─► NeedsIndex
//!   (first strategy that accepts the query wins)
//! ```

mod composite;
mod engine;
mod fetch;
mod kind;
mod plan;
mod single;
mod zigzag;

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::codec::Direction;
use crate::error::Result;
use crate::model::{Entity, Key, PropertyValue};

pub use engine::QueryEngine;

// =============================================================================
// Query Description
// =============================================================================

/// Comparison of a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    Equal,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

impl Operator {
    pub fn is_inequality(self) -> bool {
        self != Operator::Equal
    }

    /// Whether `stored cmp filter_value` satisfies the operator
    pub fn accepts(self, ordering: Ordering) -> bool {
        match self {
            Operator::Equal => ordering == Ordering::Equal,
            Operator::LessThan => ordering == Ordering::Less,
            Operator::LessThanOrEqual => ordering != Ordering::Greater,
            Operator::GreaterThan => ordering == Ordering::Greater,
            Operator::GreaterThanOrEqual => ordering != Ordering::Less,
        }
    }
}

/// `property op value`
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub property: String,
    pub op: Operator,
    pub value: PropertyValue,
}

/// Sort order on one property
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub property: String,
    pub direction: Direction,
}

/// A datastore query
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub app: String,
    pub namespace: String,
    /// `None` for kindless queries
    pub kind: Option<String>,
    pub ancestor: Option<Key>,
    pub filters: Vec<Filter>,
    pub orders: Vec<Order>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub keys_only: bool,
    pub projection: Vec<String>,
    pub distinct: bool,
    pub cursor: Option<Cursor>,
    /// Explicit transaction; requires an ancestor
    pub transaction: Option<u64>,
    /// Composite index to use, bypassing index matching
    pub composite_index: Option<u64>,
}

impl Query {
    /// Query over one kind
    pub fn new(app: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            kind: Some(kind.into()),
            ..Self::default()
        }
    }

    /// Query over every kind
    pub fn kindless(app: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            ..Self::default()
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn ancestor(mut self, ancestor: Key) -> Self {
        self.ancestor = Some(ancestor);
        self
    }

    pub fn filter(mut self, property: impl Into<String>, op: Operator, value: impl Into<PropertyValue>) -> Self {
        self.filters.push(Filter {
            property: property.into(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn order(mut self, property: impl Into<String>, direction: Direction) -> Self {
        self.orders.push(Order {
            property: property.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn keys_only(mut self) -> Self {
        self.keys_only = true;
        self
    }

    pub fn project<I, S>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projection = properties.into_iter().map(Into::into).collect();
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn start_cursor(mut self, cursor: Cursor) -> Self {
        self.cursor = Some(cursor);
        self
    }

    pub fn transaction(mut self, txn: u64) -> Self {
        self.transaction = Some(txn);
        self
    }

    pub fn composite_index(mut self, index_id: u64) -> Self {
        self.composite_index = Some(index_id);
        self
    }
}

// =============================================================================
// Results
// =============================================================================

/// Resume point of a query: the last returned key plus the index values it
/// was found under
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub last_key: Key,
    pub values: Vec<(String, PropertyValue)>,
}

impl Cursor {
    /// Value recorded for a property, if any
    pub fn value(&self, property: &str) -> Option<&PropertyValue> {
        self.values
            .iter()
            .find(|(name, _)| name == property)
            .map(|(_, value)| value)
    }

    /// Opaque form handed to clients
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Which strategy served a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    Kindless,
    Ancestor,
    OrderedAncestor,
    Kind,
    SingleProperty,
    ZigZag,
    Composite,
}

/// Outcome of one query execution
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub entities: Vec<Entity>,
    /// Resume point after the last entity, when any entity was consumed
    pub cursor: Option<Cursor>,
    pub more_results: bool,
    /// Entities skipped because of the offset
    pub skipped: usize,
    pub strategy: StrategyKind,
}

impl QueryResult {
    pub fn keys(&self) -> Vec<Key> {
        self.entities.iter().map(|e| e.key.clone()).collect()
    }
}

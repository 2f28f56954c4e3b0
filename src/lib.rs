//! # kindkv
//!
//! A Datastore-compatible entity layer over a sorted key-value store with:
//! - Entities addressed by hierarchical keys, grouped by their root
//! - Ascending, descending and composite property indexes
//! - Entity group transactions with journaled versions
//! - Kind, ancestor, single-property, zigzag and composite queries
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Datastore                             │
//! │        put / get / delete / query / transactions / ids       │
//! └──────┬──────────────┬──────────────┬──────────────┬─────────┘
//!        │              │              │              │
//!        ▼              ▼              ▼              ▼
//!  ┌──────────┐  ┌─────────────┐ ┌───────────┐ ┌─────────────┐
//!  │  Writer  │  │ Transaction │ │   Query   │ │   Index     │
//!  │          │  │   Manager   │ │   Engine  │ │   Manager   │
//!  └────┬─────┘  └──────┬──────┘ └─────┬─────┘ └──────┬──────┘
//!       │               │              │              │
//!       │         ┌─────▼─────┐        │              │
//!       │         │   Lock    │        │              │
//!       │         │  Service  │        │              │
//!       │         └───────────┘        │              │
//!       ▼                              ▼              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Batch Store (Key Codec)                     │
//! │   entity · kind · asc · desc · composite · journal · meta    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod model;
pub mod codec;
pub mod store;
pub mod lock;
pub mod writer;
pub mod txn;
pub mod ids;
pub mod schema;
pub mod query;
pub mod datastore;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{DatastoreError, ErrorCode, Result};
pub use codec::Direction;
pub use config::{Config, RetryPolicy};
pub use datastore::Datastore;
pub use model::{Entity, Key, PathElement, Property, PropertyValue};
pub use query::{Cursor, Filter, Operator, Order, Query, QueryResult, StrategyKind};
pub use schema::{CompositeIndex, IndexDefinition, IndexProperty, IndexState};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of kindkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

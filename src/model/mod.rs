//! Data Model
//!
//! Entities, keys and property values as seen by callers of the datastore.
//!
//! ## Responsibilities
//! - Hierarchical keys: (app, namespace, path of kind + id-or-name)
//! - Typed, possibly repeated property values
//! - Key validation shared by every write and read entry point
//!
//! ## Entity Groups
//! The root element of a key's path names its entity group. Locks and
//! transactions are scoped to entity groups.

mod entity;
mod key;
mod value;

pub use entity::{Entity, Property};
pub use key::{Key, PathElement};
pub use value::PropertyValue;

/// Pseudo-property naming the entity key in filters and orders
pub const KEY_PROPERTY: &str = "__key__";

/// Whether a property name is reserved (`__name__` form)
pub fn is_reserved_name(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}

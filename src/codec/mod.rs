//! Key Codec
//!
//! Order-preserving mapping between the data model and the byte-string row
//! keys of the sorted store. This is the only place that knows the byte
//! layout of a row key.
//!
//! ## Responsibilities
//! - Escape/unescape of encoded values
//! - Sortable, self-delimiting property value encoding
//! - Path encoding with zero-padded numeric ids
//! - Reverse-lexicographic transform for descending tables
//! - Row key builders and parsers for every table
//!
//! ## Row Key Layout
//! ```text
//! prefix     = app DELIM namespace
//! entity     = prefix DELIM path
//! kind       = prefix DELIM kind KSEP path
//! property   = prefix DELIM kind DELIM name DELIM value DELIM path
//! composite  = prefix DELIM index_id DELIM [ancestor DELIM] (value DELIM)* path
//! journal    = entity DELIM version(20 digits)
//!
//! path       = (kind ':' id-or-name KSEP)+
//! DELIM = 0x00   KSEP = 0x01   TERMINATOR = 0xFF...
//! ```
//!
//! Escaped values never contain `DELIM`, so ascending components split
//! unambiguously. Descending components may contain `DELIM` after the
//! reverse transform; see [`split_composite_key`] for how those are
//! recovered.

mod escape;
mod keys;
mod path;
mod value;

use serde::{Deserialize, Serialize};

pub use escape::{escape, reverse_lex, unescape};
pub use keys::{
    composite_key, composite_prefix, entity_key, entity_prefix, index_definition_key,
    index_definition_prefix, index_key, journal_key, key_from_entity_key, kind_key, kind_prefix,
    namespace_prefix, property_prefix, split_composite_key, split_index_key, CompositeKeyParts,
    IndexKeyParts,
};
pub use path::{decode_path, encode_path, kind_from_encoded_path};
pub use value::{decode_value, decode_value_directed, encode_value, encode_value_directed};

// =============================================================================
// Delimiters
// =============================================================================

/// Separates row key components
pub const KEY_DELIMITER: u8 = 0x00;

/// Terminates each encoded path element
pub const KIND_SEPARATOR: u8 = 0x01;

/// Separates a path element's kind from its id or name
pub const ID_SEPARATOR: u8 = b':';

/// Numeric ids are zero-padded to at least this many digits
pub const ID_KEY_LENGTH: usize = 10;

/// Sorts after every byte that can start or continue a key component
pub const TERMINATOR: &[u8] = &[0xFF; 4];

/// Scan direction of an index component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        }
    }
}

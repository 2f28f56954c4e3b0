//! Row key builders and parsers

use crate::error::{DatastoreError, Result};
use crate::model::{Key, PathElement, PropertyValue};

use super::{
    decode_path, decode_value_directed, encode_path, encode_value_directed, Direction,
    KEY_DELIMITER, KIND_SEPARATOR,
};

const INDEX_METADATA_TAG: &[u8] = b"index";
const VERSION_WIDTH: usize = 20;

// =============================================================================
// Entity and Kind Tables
// =============================================================================

/// `app DELIM namespace`
pub fn namespace_prefix(app: &str, namespace: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(app.len() + namespace.len() + 1);
    out.extend_from_slice(app.as_bytes());
    out.push(KEY_DELIMITER);
    out.extend_from_slice(namespace.as_bytes());
    out
}

/// Prefix shared by every entity row of a namespace
pub fn entity_prefix(app: &str, namespace: &str) -> Vec<u8> {
    let mut out = namespace_prefix(app, namespace);
    out.push(KEY_DELIMITER);
    out
}

/// Entity table row key
pub fn entity_key(key: &Key) -> Vec<u8> {
    let mut out = entity_prefix(&key.app, &key.namespace);
    out.extend_from_slice(&encode_path(&key.path));
    out
}

/// Recover a key from an entity table row key
pub fn key_from_entity_key(row_key: &[u8]) -> Result<Key> {
    let mut parts = row_key.splitn(3, |b| *b == KEY_DELIMITER);
    let app = parts.next().unwrap_or_default();
    let namespace = parts
        .next()
        .ok_or_else(|| DatastoreError::Codec("entity key without namespace".to_string()))?;
    let path = parts
        .next()
        .ok_or_else(|| DatastoreError::Codec("entity key without path".to_string()))?;
    Ok(Key::new(
        utf8(app)?,
        utf8(namespace)?,
        decode_path(path)?,
    ))
}

/// Prefix shared by every kind row of one kind
pub fn kind_prefix(app: &str, namespace: &str, kind: &str) -> Vec<u8> {
    let mut out = entity_prefix(app, namespace);
    out.extend_from_slice(kind.as_bytes());
    out.push(KIND_SEPARATOR);
    out
}

/// Kind table row key: the kind first, then the full path, so a scan over
/// one kind sees entities at every ancestor depth
pub fn kind_key(key: &Key) -> Vec<u8> {
    let mut out = kind_prefix(&key.app, &key.namespace, key.kind());
    out.extend_from_slice(&encode_path(&key.path));
    out
}

// =============================================================================
// Single-Property Index Tables
// =============================================================================

/// `prefix DELIM kind DELIM name DELIM`
pub fn property_prefix(app: &str, namespace: &str, kind: &str, name: &str) -> Vec<u8> {
    let mut out = entity_prefix(app, namespace);
    out.extend_from_slice(kind.as_bytes());
    out.push(KEY_DELIMITER);
    out.extend_from_slice(name.as_bytes());
    out.push(KEY_DELIMITER);
    out
}

/// Row key in the ascending or descending property table
pub fn index_key(key: &Key, name: &str, value: &PropertyValue, direction: Direction) -> Vec<u8> {
    let mut out = property_prefix(&key.app, &key.namespace, key.kind(), name);
    out.extend_from_slice(&encode_value_directed(value, direction));
    out.push(KEY_DELIMITER);
    out.extend_from_slice(&encode_path(&key.path));
    out
}

/// Value and path components of a property index row key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexKeyParts {
    /// Encoded value as stored (reverse-lex applied for descending rows)
    pub value: Vec<u8>,
    pub path: Vec<u8>,
}

/// Split a property index row key.
///
/// The four leading components and the trailing path never contain the
/// delimiter; everything in between is the value, rejoined.
pub fn split_index_key(row_key: &[u8]) -> Result<IndexKeyParts> {
    let tokens: Vec<&[u8]> = row_key.split(|b| *b == KEY_DELIMITER).collect();
    if tokens.len() < 6 {
        return Err(DatastoreError::Codec(format!(
            "property index key has {} components, expected at least 6",
            tokens.len()
        )));
    }
    let last = tokens.len() - 1;
    Ok(IndexKeyParts {
        value: tokens[4..last].join(&KEY_DELIMITER),
        path: tokens[last].to_vec(),
    })
}

// =============================================================================
// Composite Index Table
// =============================================================================

/// `prefix DELIM index_id DELIM`
pub fn composite_prefix(app: &str, namespace: &str, index_id: u64) -> Vec<u8> {
    let mut out = entity_prefix(app, namespace);
    out.extend_from_slice(index_id.to_string().as_bytes());
    out.push(KEY_DELIMITER);
    out
}

/// Composite row key from already-directed value encodings
pub fn composite_key(
    prefix: &[u8],
    ancestor: Option<&[PathElement]>,
    values: &[Vec<u8>],
    path: &[PathElement],
) -> Vec<u8> {
    let mut out = prefix.to_vec();
    if let Some(ancestor) = ancestor {
        out.extend_from_slice(&encode_path(ancestor));
        out.push(KEY_DELIMITER);
    }
    for value in values {
        out.extend_from_slice(value);
        out.push(KEY_DELIMITER);
    }
    out.extend_from_slice(&encode_path(path));
    out
}

/// Components of a composite index row key
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeKeyParts {
    pub index_id: u64,
    pub ancestor: Option<Vec<u8>>,
    /// Decoded values in index property order
    pub values: Vec<PropertyValue>,
    /// Value components exactly as stored
    pub encoded_values: Vec<Vec<u8>>,
    pub path: Vec<u8>,
}

/// Split a composite row key given the directions of the index properties.
///
/// Descending components can contain the delimiter once reverse-lexed, so
/// when the token count does not match, each value is re-decoded from a
/// growing window of tokens until one decodes. Raw encodings are
/// prefix-free, so the first window that decodes is the only one that can.
pub fn split_composite_key(
    row_key: &[u8],
    directions: &[Direction],
    ancestor: bool,
) -> Result<CompositeKeyParts> {
    let tokens: Vec<&[u8]> = row_key.split(|b| *b == KEY_DELIMITER).collect();
    let head = if ancestor { 4 } else { 3 };
    if tokens.len() < head + directions.len() + 1 {
        return Err(DatastoreError::Codec(format!(
            "composite key has {} components, expected at least {}",
            tokens.len(),
            head + directions.len() + 1
        )));
    }

    let index_id = utf8(tokens[2])?
        .parse::<u64>()
        .map_err(|e| DatastoreError::Codec(format!("invalid composite index id: {}", e)))?;
    let last = tokens.len() - 1;
    let middle = &tokens[head..last];

    let mut values = Vec::with_capacity(directions.len());
    let mut encoded_values = Vec::with_capacity(directions.len());
    if middle.len() == directions.len() {
        for (token, direction) in middle.iter().zip(directions) {
            values.push(decode_value_directed(token, *direction)?);
            encoded_values.push(token.to_vec());
        }
    } else {
        tracing::debug!(
            extra_tokens = middle.len() - directions.len(),
            "re-decoding composite key with delimiter bytes inside values"
        );
        let mut pos = 0;
        for (position, direction) in directions.iter().enumerate() {
            let reserved = directions.len() - position - 1;
            let mut decoded = None;
            for end in pos + 1..=middle.len() - reserved {
                let candidate = middle[pos..end].join(&KEY_DELIMITER);
                if let Ok(value) = decode_value_directed(&candidate, *direction) {
                    decoded = Some((value, candidate, end));
                    break;
                }
            }
            let (value, candidate, end) = decoded.ok_or_else(|| {
                DatastoreError::Codec(format!(
                    "unable to decode composite value at position {}",
                    position
                ))
            })?;
            values.push(value);
            encoded_values.push(candidate);
            pos = end;
        }
        if pos != middle.len() {
            return Err(DatastoreError::Codec(
                "composite key has undecodable trailing components".to_string(),
            ));
        }
    }

    Ok(CompositeKeyParts {
        index_id,
        ancestor: ancestor.then(|| tokens[3].to_vec()),
        values,
        encoded_values,
        path: tokens[last].to_vec(),
    })
}

// =============================================================================
// Journal and Metadata Tables
// =============================================================================

/// `entity_key DELIM version` with the version zero-padded
pub fn journal_key(entity_key: &[u8], version: u64) -> Vec<u8> {
    let mut out = entity_key.to_vec();
    out.push(KEY_DELIMITER);
    out.extend_from_slice(format!("{:0width$}", version, width = VERSION_WIDTH).as_bytes());
    out
}

/// Prefix of every composite index definition of an application
pub fn index_definition_prefix(app: &str) -> Vec<u8> {
    let mut out = INDEX_METADATA_TAG.to_vec();
    out.push(KEY_DELIMITER);
    out.extend_from_slice(app.as_bytes());
    out.push(KEY_DELIMITER);
    out
}

/// Metadata row key of one composite index definition
pub fn index_definition_key(app: &str, index_id: u64) -> Vec<u8> {
    let mut out = index_definition_prefix(app);
    out.extend_from_slice(format!("{:0width$}", index_id, width = VERSION_WIDTH).as_bytes());
    out
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| DatastoreError::Codec(format!("invalid utf-8 in row key: {}", e)))
}

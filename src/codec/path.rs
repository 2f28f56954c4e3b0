//! Key path encoding
//!
//! `kind:0000000042\x01kind:name\x01` with numeric ids zero-padded to
//! [`ID_KEY_LENGTH`] digits so lexicographic order matches numeric order.

use crate::error::{DatastoreError, Result};
use crate::model::PathElement;

use super::{ID_KEY_LENGTH, ID_SEPARATOR, KIND_SEPARATOR};

/// Encode a key path
pub fn encode_path(path: &[PathElement]) -> Vec<u8> {
    let mut out = Vec::with_capacity(path.len() * 24);
    for element in path {
        out.extend_from_slice(element.kind.as_bytes());
        out.push(ID_SEPARATOR);
        match (&element.id, &element.name) {
            (Some(id), _) => {
                out.extend_from_slice(format!("{:0width$}", id, width = ID_KEY_LENGTH).as_bytes())
            }
            (None, Some(name)) => out.extend_from_slice(name.as_bytes()),
            (None, None) => {}
        }
        out.push(KIND_SEPARATOR);
    }
    out
}

/// Decode a path produced by [`encode_path`].
///
/// An identifier that is all digits and at least `ID_KEY_LENGTH` long is
/// read back as a numeric id; anything else is a name.
pub fn decode_path(bytes: &[u8]) -> Result<Vec<PathElement>> {
    if bytes.last() != Some(&KIND_SEPARATOR) {
        return Err(DatastoreError::Codec(
            "encoded path is missing its trailing separator".to_string(),
        ));
    }

    let mut path = Vec::new();
    for element in bytes[..bytes.len() - 1].split(|b| *b == KIND_SEPARATOR) {
        let split = element
            .iter()
            .position(|b| *b == ID_SEPARATOR)
            .ok_or_else(|| DatastoreError::Codec("path element without id separator".to_string()))?;
        let kind = utf8(&element[..split])?;
        let identifier = utf8(&element[split + 1..])?;

        let decoded = if identifier.is_empty() {
            PathElement::incomplete(kind)
        } else if identifier.len() >= ID_KEY_LENGTH && identifier.bytes().all(|b| b.is_ascii_digit()) {
            let id = identifier
                .parse::<i64>()
                .map_err(|e| DatastoreError::Codec(format!("invalid numeric id {}: {}", identifier, e)))?;
            PathElement::with_id(kind, id)
        } else {
            PathElement::with_name(kind, identifier)
        };
        path.push(decoded);
    }
    Ok(path)
}

/// Kind of the last element of an encoded path, without a full decode
pub fn kind_from_encoded_path(bytes: &[u8]) -> Option<&[u8]> {
    let trimmed = bytes.strip_suffix(&[KIND_SEPARATOR])?;
    let last = trimmed.rsplit(|b| *b == KIND_SEPARATOR).next()?;
    let split = last.iter().position(|b| *b == ID_SEPARATOR)?;
    Some(&last[..split])
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| DatastoreError::Codec(format!("invalid utf-8 in path: {}", e)))
}

//! Delimiter escaping and the reverse-lexicographic transform

use crate::error::{DatastoreError, Result};

const ESCAPE: u8 = 0x01;
const ESCAPED_NULL: u8 = 0x01;
const ESCAPED_ESCAPE: u8 = 0x02;

/// Escape `0x00` and `0x01` so the result never contains a key delimiter.
///
/// `0x00 -> 0x01 0x01`, `0x01 -> 0x01 0x02`. The mapping is a prefix code
/// whose codewords keep byte order, so escaped strings compare like the
/// originals.
pub fn escape(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len() + 4);
    for &byte in raw {
        match byte {
            0x00 => out.extend_from_slice(&[ESCAPE, ESCAPED_NULL]),
            0x01 => out.extend_from_slice(&[ESCAPE, ESCAPED_ESCAPE]),
            other => out.push(other),
        }
    }
    out
}

/// Invert [`escape`]
pub fn unescape(encoded: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(encoded.len());
    let mut bytes = encoded.iter();
    while let Some(&byte) = bytes.next() {
        match byte {
            ESCAPE => match bytes.next() {
                Some(&ESCAPED_NULL) => out.push(0x00),
                Some(&ESCAPED_ESCAPE) => out.push(0x01),
                Some(other) => {
                    return Err(DatastoreError::Codec(format!(
                        "invalid escape sequence 0x01 0x{:02x}",
                        other
                    )))
                }
                None => {
                    return Err(DatastoreError::Codec(
                        "dangling escape byte at end of value".to_string(),
                    ))
                }
            },
            0x00 => {
                return Err(DatastoreError::Codec(
                    "unescaped delimiter inside value".to_string(),
                ))
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

/// Map every byte `b` to `0xFF - b`.
///
/// For prefix-free inputs `a < b` implies `reverse_lex(a) > reverse_lex(b)`.
/// The transform is its own inverse.
pub fn reverse_lex(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().map(|b| 0xFF - b).collect()
}

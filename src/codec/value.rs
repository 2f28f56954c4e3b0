//! Sortable property value encoding
//!
//! `encode_value(v) = escape(raw(v))`. The raw form is a type tag followed by
//! a prefix-free, order-preserving body:
//!
//! | Type      | Tag  | Body                                         |
//! |-----------|------|----------------------------------------------|
//! | Null      | 0x10 | (none)                                       |
//! | Integer   | 0x20 | i64 with sign bit flipped, big-endian        |
//! | Timestamp | 0x21 | same as Integer                              |
//! | Boolean   | 0x30 | 0x00 / 0x01                                  |
//! | Bytes     | 0x40 | text form                                    |
//! | String    | 0x41 | text form                                    |
//! | Double    | 0x50 | IEEE-754 bits mapped to a total order        |
//! | GeoPoint  | 0x60 | two doubles                                  |
//! | User      | 0x70 | email in text form                           |
//! | Key       | 0x80 | app, namespace, then elements, then 0x01     |
//!
//! Text form: bytes with `0x00 -> 0x00 0xFF`, terminated by `0x00 0x01`.

use crate::error::{DatastoreError, Result};
use crate::model::{Key, PathElement, PropertyValue};

use super::{escape, reverse_lex, unescape, Direction};

const TAG_NULL: u8 = 0x10;
const TAG_INTEGER: u8 = 0x20;
const TAG_TIMESTAMP: u8 = 0x21;
const TAG_BOOLEAN: u8 = 0x30;
const TAG_BYTES: u8 = 0x40;
const TAG_STRING: u8 = 0x41;
const TAG_DOUBLE: u8 = 0x50;
const TAG_GEOPOINT: u8 = 0x60;
const TAG_USER: u8 = 0x70;
const TAG_KEY: u8 = 0x80;

const SIGN_FLIP_MASK: u64 = 0x8000_0000_0000_0000;

const ELEMENT_END: u8 = 0x01;
const ELEMENT_NEXT: u8 = 0x02;
const ELEMENT_ID: u8 = 0x01;
const ELEMENT_NAME: u8 = 0x02;
const ELEMENT_INCOMPLETE: u8 = 0x03;

// =============================================================================
// Public API
// =============================================================================

/// Encode a value into its escaped, sortable form
pub fn encode_value(value: &PropertyValue) -> Vec<u8> {
    let mut raw = Vec::with_capacity(16);
    write_value(value, &mut raw);
    escape(&raw)
}

/// Decode an escaped value. The whole input must be consumed.
pub fn decode_value(encoded: &[u8]) -> Result<PropertyValue> {
    let raw = unescape(encoded)?;
    let mut reader = Reader::new(&raw);
    let value = reader.value()?;
    if !reader.is_empty() {
        return Err(DatastoreError::Codec(format!(
            "{} trailing bytes after {} value",
            reader.remaining(),
            value.type_name()
        )));
    }
    Ok(value)
}

/// Encode for an index component with the given direction
pub fn encode_value_directed(value: &PropertyValue, direction: Direction) -> Vec<u8> {
    let encoded = encode_value(value);
    match direction {
        Direction::Ascending => encoded,
        Direction::Descending => reverse_lex(&encoded),
    }
}

/// Inverse of [`encode_value_directed`]
pub fn decode_value_directed(bytes: &[u8], direction: Direction) -> Result<PropertyValue> {
    match direction {
        Direction::Ascending => decode_value(bytes),
        Direction::Descending => decode_value(&reverse_lex(bytes)),
    }
}

// =============================================================================
// Raw Encoding
// =============================================================================

fn write_value(value: &PropertyValue, out: &mut Vec<u8>) {
    match value {
        PropertyValue::Null => out.push(TAG_NULL),
        PropertyValue::Integer(i) => {
            out.push(TAG_INTEGER);
            write_i64(*i, out);
        }
        PropertyValue::Timestamp(ts) => {
            out.push(TAG_TIMESTAMP);
            write_i64(*ts, out);
        }
        PropertyValue::Boolean(b) => {
            out.push(TAG_BOOLEAN);
            out.push(u8::from(*b));
        }
        PropertyValue::Bytes(bytes) => {
            out.push(TAG_BYTES);
            write_text(bytes, out);
        }
        PropertyValue::String(s) => {
            out.push(TAG_STRING);
            write_text(s.as_bytes(), out);
        }
        PropertyValue::Double(f) => {
            out.push(TAG_DOUBLE);
            write_f64(*f, out);
        }
        PropertyValue::GeoPoint { lat, lng } => {
            out.push(TAG_GEOPOINT);
            write_f64(*lat, out);
            write_f64(*lng, out);
        }
        // Auth domain and user id are volatile; only the email is indexed.
        PropertyValue::User { email, .. } => {
            out.push(TAG_USER);
            write_text(email.as_bytes(), out);
        }
        PropertyValue::Key(key) => {
            out.push(TAG_KEY);
            write_key(key, out);
        }
    }
}

fn write_i64(value: i64, out: &mut Vec<u8>) {
    out.extend_from_slice(&((value as u64) ^ SIGN_FLIP_MASK).to_be_bytes());
}

fn write_f64(value: f64, out: &mut Vec<u8>) {
    let bits = value.to_bits();
    let mapped = if bits & SIGN_FLIP_MASK != 0 {
        !bits
    } else {
        bits ^ SIGN_FLIP_MASK
    };
    out.extend_from_slice(&mapped.to_be_bytes());
}

fn write_text(bytes: &[u8], out: &mut Vec<u8>) {
    for &byte in bytes {
        if byte == 0x00 {
            out.extend_from_slice(&[0x00, 0xFF]);
        } else {
            out.push(byte);
        }
    }
    out.extend_from_slice(&[0x00, 0x01]);
}

fn write_key(key: &Key, out: &mut Vec<u8>) {
    write_text(key.app.as_bytes(), out);
    write_text(key.namespace.as_bytes(), out);
    for element in &key.path {
        out.push(ELEMENT_NEXT);
        write_text(element.kind.as_bytes(), out);
        match (&element.id, &element.name) {
            (Some(id), _) => {
                out.push(ELEMENT_ID);
                write_i64(*id, out);
            }
            (None, Some(name)) => {
                out.push(ELEMENT_NAME);
                write_text(name.as_bytes(), out);
            }
            (None, None) => out.push(ELEMENT_INCOMPLETE),
        }
    }
    out.push(ELEMENT_END);
}

// =============================================================================
// Raw Decoding
// =============================================================================

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    fn byte(&mut self) -> Result<u8> {
        let byte = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| DatastoreError::Codec("truncated value".to_string()))?;
        self.pos += 1;
        Ok(byte)
    }

    fn fixed8(&mut self) -> Result<u64> {
        let end = self.pos + 8;
        let chunk = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| DatastoreError::Codec("truncated fixed-width value".to_string()))?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(chunk);
        self.pos = end;
        Ok(u64::from_be_bytes(buf))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok((self.fixed8()? ^ SIGN_FLIP_MASK) as i64)
    }

    fn f64(&mut self) -> Result<f64> {
        let mapped = self.fixed8()?;
        let bits = if mapped & SIGN_FLIP_MASK != 0 {
            mapped ^ SIGN_FLIP_MASK
        } else {
            !mapped
        };
        Ok(f64::from_bits(bits))
    }

    fn text(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            match self.byte()? {
                0x00 => match self.byte()? {
                    0x01 => return Ok(out),
                    0xFF => out.push(0x00),
                    other => {
                        return Err(DatastoreError::Codec(format!(
                            "invalid text escape 0x00 0x{:02x}",
                            other
                        )))
                    }
                },
                other => out.push(other),
            }
        }
    }

    fn string(&mut self) -> Result<String> {
        String::from_utf8(self.text()?)
            .map_err(|e| DatastoreError::Codec(format!("invalid utf-8 in text value: {}", e)))
    }

    fn key(&mut self) -> Result<Key> {
        let app = self.string()?;
        let namespace = self.string()?;
        let mut path = Vec::new();
        loop {
            match self.byte()? {
                ELEMENT_END => break,
                ELEMENT_NEXT => {
                    let kind = self.string()?;
                    let element = match self.byte()? {
                        ELEMENT_ID => PathElement::with_id(kind, self.i64()?),
                        ELEMENT_NAME => PathElement::with_name(kind, self.string()?),
                        ELEMENT_INCOMPLETE => PathElement::incomplete(kind),
                        other => {
                            return Err(DatastoreError::Codec(format!(
                                "invalid key element marker 0x{:02x}",
                                other
                            )))
                        }
                    };
                    path.push(element);
                }
                other => {
                    return Err(DatastoreError::Codec(format!(
                        "invalid key path marker 0x{:02x}",
                        other
                    )))
                }
            }
        }
        Ok(Key::new(app, namespace, path))
    }

    fn value(&mut self) -> Result<PropertyValue> {
        let value = match self.byte()? {
            TAG_NULL => PropertyValue::Null,
            TAG_INTEGER => PropertyValue::Integer(self.i64()?),
            TAG_TIMESTAMP => PropertyValue::Timestamp(self.i64()?),
            TAG_BOOLEAN => match self.byte()? {
                0 => PropertyValue::Boolean(false),
                1 => PropertyValue::Boolean(true),
                other => {
                    return Err(DatastoreError::Codec(format!(
                        "invalid boolean byte 0x{:02x}",
                        other
                    )))
                }
            },
            TAG_BYTES => PropertyValue::Bytes(self.text()?),
            TAG_STRING => PropertyValue::String(self.string()?),
            TAG_DOUBLE => PropertyValue::Double(self.f64()?),
            TAG_GEOPOINT => {
                let lat = self.f64()?;
                let lng = self.f64()?;
                PropertyValue::GeoPoint { lat, lng }
            }
            TAG_USER => PropertyValue::user(self.string()?),
            TAG_KEY => PropertyValue::Key(self.key()?),
            other => {
                return Err(DatastoreError::Codec(format!(
                    "unknown value tag 0x{:02x}",
                    other
                )))
            }
        };
        Ok(value)
    }
}

//! Property values

use serde::{Deserialize, Serialize};

use super::Key;

/// A typed property value.
///
/// Values of different types order by type first, in declaration order
/// below, then by value within the type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Null,
    Integer(i64),
    /// Microseconds since the Unix epoch
    Timestamp(i64),
    Boolean(bool),
    Bytes(Vec<u8>),
    String(String),
    Double(f64),
    GeoPoint { lat: f64, lng: f64 },
    /// Only the email takes part in ordering and equality inside indexes
    User {
        email: String,
        auth_domain: String,
        user_id: Option<String>,
    },
    Key(Key),
}

impl PropertyValue {
    /// User value carrying only an email
    pub fn user(email: impl Into<String>) -> Self {
        PropertyValue::User {
            email: email.into(),
            auth_domain: String::new(),
            user_id: None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::Null => "null",
            PropertyValue::Integer(_) => "integer",
            PropertyValue::Timestamp(_) => "timestamp",
            PropertyValue::Boolean(_) => "boolean",
            PropertyValue::Bytes(_) => "bytes",
            PropertyValue::String(_) => "string",
            PropertyValue::Double(_) => "double",
            PropertyValue::GeoPoint { .. } => "geopoint",
            PropertyValue::User { .. } => "user",
            PropertyValue::Key(_) => "key",
        }
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Integer(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Boolean(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Double(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<Key> for PropertyValue {
    fn from(value: Key) -> Self {
        PropertyValue::Key(value)
    }
}

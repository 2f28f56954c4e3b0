//! Entities

use serde::{Deserialize, Serialize};

use crate::error::{DatastoreError, Result};

use super::{is_reserved_name, Key, PropertyValue};

/// A named property occurrence. Repeated properties are stored as several
/// occurrences with the same name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub value: PropertyValue,
}

/// An entity: a key plus a flat list of property occurrences
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub key: Key,
    pub properties: Vec<Property>,
}

impl Entity {
    pub fn new(key: Key) -> Self {
        Self {
            key,
            properties: Vec::new(),
        }
    }

    /// Builder-style property append
    pub fn with(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.add(name, value);
        self
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<PropertyValue>) {
        self.properties.push(Property {
            name: name.into(),
            value: value.into(),
        });
    }

    /// All values of a property, in insertion order
    pub fn values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a PropertyValue> + 'a {
        self.properties
            .iter()
            .filter(move |p| p.name == name)
            .map(|p| &p.value)
    }

    /// First value of a property
    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.iter().find(|p| p.name == name).map(|p| &p.value)
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.properties.iter().any(|p| p.name == name)
    }

    /// Distinct property names, in first-seen order
    pub fn property_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for property in &self.properties {
            if !names.contains(&property.name.as_str()) {
                names.push(&property.name);
            }
        }
        names
    }

    /// Entity group root key
    pub fn group(&self) -> Key {
        self.key.root()
    }

    /// Validate key shape and property names before a write
    pub fn validate(&self, allow_incomplete: bool) -> Result<()> {
        self.key.validate(allow_incomplete)?;
        for property in &self.properties {
            if property.name.is_empty() || property.name.contains('\u{0}') {
                return Err(DatastoreError::BadRequest(format!(
                    "invalid property name {:?}",
                    property.name
                )));
            }
            if is_reserved_name(&property.name) {
                return Err(DatastoreError::BadRequest(format!(
                    "property name {} is reserved",
                    property.name
                )));
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

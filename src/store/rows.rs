//! Typed rows
//!
//! Every table value is one of these structs, serialized with bincode.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::Entity;

/// A row value that can be stored in a table
pub trait Row: Serialize + DeserializeOwned + Sized {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Decode every value of a scan result into typed rows
pub fn decode_rows<R: Row>(rows: Vec<(Vec<u8>, Vec<u8>)>) -> Result<Vec<(Vec<u8>, R)>> {
    rows.into_iter()
        .map(|(key, value)| Ok((key, R::from_bytes(&value)?)))
        .collect()
}

/// Entity bytes, or the soft-delete sentinel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Entity(Vec<u8>),
    Tombstone,
}

impl Payload {
    pub fn from_entity(entity: &Entity) -> Result<Self> {
        Ok(Payload::Entity(entity.to_bytes()?))
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Payload::Tombstone)
    }

    /// Decode the entity; `None` for a tombstone
    pub fn entity(&self) -> Result<Option<Entity>> {
        match self {
            Payload::Entity(bytes) => Ok(Some(Entity::from_bytes(bytes)?)),
            Payload::Tombstone => Ok(None),
        }
    }
}

/// Entity table value: payload plus the transaction id that wrote it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRow {
    pub payload: Payload,
    pub txn_id: u64,
}

impl Row for EntityRow {}

/// Journal table value: the payload as of one version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalRow {
    pub payload: Payload,
}

impl Row for JournalRow {}

/// Index value pointing back at an entity table row key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceRow {
    pub reference: Vec<u8>,
}

impl Row for ReferenceRow {}

pub type KindRow = ReferenceRow;
pub type IndexRow = ReferenceRow;
pub type CompositeRow = ReferenceRow;

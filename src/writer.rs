//! Entity/Index Writer
//!
//! Computes and applies every row needed to keep the entity, kind, property,
//! composite and journal tables consistent for a batch of entities.
//!
//! ## Responsibilities
//! - Entity, kind and journal rows for new versions
//! - One ascending and one descending row per property occurrence
//! - Composite rows: Cartesian product of values × ancestor prefixes
//! - Symmetric removal computed from the previous entity state
//!
//! Updates are full re-indexes: every index row of the old version is
//! deleted and every row of the new version inserted. A failure mid-way is
//! not undone here; the transaction manager invalidates the transaction so
//! readers never treat the partial write as committed.

use std::collections::HashMap;
use std::sync::Arc;

use crate::codec::{
    composite_key, composite_prefix, encode_value_directed, entity_key, index_key, journal_key,
    kind_key, Direction,
};
use crate::error::{DatastoreError, Result};
use crate::model::{Entity, Key, PropertyValue, KEY_PROPERTY};
use crate::schema::CompositeIndex;
use crate::store::{
    BatchStore, CompositeRow, EntityRow, IndexRow, JournalRow, KindRow, Payload, Row, Table,
};

/// Entity group root row key → transaction id writing to that group
pub type TxnMap = HashMap<Vec<u8>, u64>;

/// Entity group row key of a key (the entity key of its root)
pub fn group_key(key: &Key) -> Vec<u8> {
    entity_key(&key.root())
}

/// A version to reinstate during rollback
#[derive(Debug, Clone)]
pub struct Restore {
    pub key: Key,
    /// Entity currently on disk whose index rows must go
    pub current: Option<Entity>,
    /// Version to reinstate; 0 means the entity did not exist
    pub version: u64,
    /// Payload of that version; `None` when `version` is 0
    pub payload: Option<Payload>,
}

/// Writes entities and their index rows through a [`BatchStore`]
pub struct EntityWriter {
    store: Arc<dyn BatchStore>,
}

impl EntityWriter {
    pub fn new(store: Arc<dyn BatchStore>) -> Self {
        Self { store }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Raw entity rows as currently stored, parallel to `keys`
    pub fn fetch_rows(&self, keys: &[Key]) -> Result<Vec<Option<EntityRow>>> {
        let row_keys: Vec<Vec<u8>> = keys.iter().map(entity_key).collect();
        self.store
            .batch_get(Table::Entity, &row_keys)?
            .into_iter()
            .map(|value| value.map(|bytes| EntityRow::from_bytes(&bytes)).transpose())
            .collect()
    }

    // =========================================================================
    // Inserts
    // =========================================================================

    /// Write entity, kind and journal rows, stamped with each group's txn id
    pub fn insert_entities(&self, entities: &[Entity], txn_map: &TxnMap) -> Result<()> {
        let mut entity_rows = Vec::with_capacity(entities.len());
        let mut kind_rows = Vec::with_capacity(entities.len());
        let mut journal_rows = Vec::with_capacity(entities.len());

        for entity in entities {
            let txn_id = txn_for(txn_map, &entity.key)?;
            let row_key = entity_key(&entity.key);
            let payload = Payload::from_entity(entity)?;

            journal_rows.push((
                journal_key(&row_key, txn_id),
                JournalRow {
                    payload: payload.clone(),
                }
                .to_bytes()?,
            ));
            kind_rows.push((
                kind_key(&entity.key),
                KindRow {
                    reference: row_key.clone(),
                }
                .to_bytes()?,
            ));
            entity_rows.push((row_key, EntityRow { payload, txn_id }.to_bytes()?));
        }

        self.store.batch_put(Table::Entity, entity_rows)?;
        self.store.batch_put(Table::Kind, kind_rows)?;
        self.store.batch_put(Table::Journal, journal_rows)
    }

    /// One ascending and one descending row per property occurrence
    pub fn insert_index_entries(&self, entities: &[Entity]) -> Result<()> {
        let (asc, dsc) = index_rows(entities)?;
        self.store.batch_put(Table::AscProperty, asc)?;
        self.store.batch_put(Table::DscProperty, dsc)
    }

    /// Rows for every writable composite index covering each entity
    pub fn insert_composite_indexes(&self, entities: &[Entity], indexes: &[CompositeIndex]) -> Result<()> {
        let mut rows = Vec::new();
        for entity in entities {
            let reference = entity_key(&entity.key);
            let value = CompositeRow { reference }.to_bytes()?;
            for index in indexes.iter().filter(|i| i.is_writable()) {
                for key in composite_keys(index, entity) {
                    rows.push((key, value.clone()));
                }
            }
        }
        self.store.batch_put(Table::Composite, rows)
    }

    // =========================================================================
    // Deletes
    // =========================================================================

    /// Remove the property rows of previous entity versions
    pub fn delete_index_entries(&self, entities: &[Entity]) -> Result<()> {
        let (asc, dsc) = index_rows(entities)?;
        let asc_keys: Vec<Vec<u8>> = asc.into_iter().map(|(k, _)| k).collect();
        let dsc_keys: Vec<Vec<u8>> = dsc.into_iter().map(|(k, _)| k).collect();
        self.store.batch_delete(Table::AscProperty, &asc_keys)?;
        self.store.batch_delete(Table::DscProperty, &dsc_keys)
    }

    /// Remove the composite rows of previous entity versions
    pub fn delete_composite_indexes(&self, entities: &[Entity], indexes: &[CompositeIndex]) -> Result<()> {
        let keys: Vec<Vec<u8>> = entities
            .iter()
            .flat_map(|entity| indexes.iter().flat_map(move |index| composite_keys(index, entity)))
            .collect();
        self.store.batch_delete(Table::Composite, &keys)
    }

    // =========================================================================
    // Top-Level Write Paths
    // =========================================================================

    /// Replace entities: drop every index row of the old versions, then
    /// write the new entity, kind, journal, property and composite rows.
    ///
    /// `current` holds the rows on disk before the write, parallel to
    /// `entities`.
    pub fn put_entities(
        &self,
        entities: &[Entity],
        current: &[Option<EntityRow>],
        txn_map: &TxnMap,
        indexes: &[CompositeIndex],
    ) -> Result<()> {
        let old = decode_current(current)?;

        // Step 1: Remove rows of the old versions
        self.delete_index_entries(&old)?;
        self.delete_composite_indexes(&old, indexes)?;

        // Step 2: Write the new versions
        self.insert_entities(entities, txn_map)?;
        self.insert_index_entries(entities)?;
        self.insert_composite_indexes(entities, indexes)
    }

    /// Tombstone entities and remove their kind, property and composite rows
    pub fn delete_entities(
        &self,
        keys: &[Key],
        current: &[Option<EntityRow>],
        txn_map: &TxnMap,
        indexes: &[CompositeIndex],
    ) -> Result<()> {
        let old = decode_current(current)?;

        // Step 1: Remove rows of the old versions
        self.delete_index_entries(&old)?;
        self.delete_composite_indexes(&old, indexes)?;
        let kind_keys: Vec<Vec<u8>> = keys.iter().map(kind_key).collect();
        self.store.batch_delete(Table::Kind, &kind_keys)?;

        // Step 2: Soft-delete the entity rows and journal the tombstones
        let mut entity_rows = Vec::with_capacity(keys.len());
        let mut journal_rows = Vec::with_capacity(keys.len());
        for key in keys {
            let txn_id = txn_for(txn_map, key)?;
            let row_key = entity_key(key);
            journal_rows.push((
                journal_key(&row_key, txn_id),
                JournalRow {
                    payload: Payload::Tombstone,
                }
                .to_bytes()?,
            ));
            entity_rows.push((
                row_key,
                EntityRow {
                    payload: Payload::Tombstone,
                    txn_id,
                }
                .to_bytes()?,
            ));
        }
        self.store.batch_put(Table::Entity, entity_rows)?;
        self.store.batch_put(Table::Journal, journal_rows)
    }

    /// Reinstate previous versions after a failed transaction
    pub fn restore_entities(&self, restores: &[Restore], indexes: &[CompositeIndex]) -> Result<()> {
        let current: Vec<Entity> = restores.iter().filter_map(|r| r.current.clone()).collect();
        self.delete_index_entries(&current)?;
        self.delete_composite_indexes(&current, indexes)?;

        let mut live = Vec::new();
        let mut entity_rows = Vec::new();
        let mut kind_rows = Vec::new();
        let mut removed_entities = Vec::new();
        let mut removed_kinds = Vec::new();

        for restore in restores {
            let row_key = entity_key(&restore.key);
            match &restore.payload {
                Some(Payload::Entity(bytes)) => {
                    live.push(Entity::from_bytes(bytes)?);
                    kind_rows.push((
                        kind_key(&restore.key),
                        KindRow {
                            reference: row_key.clone(),
                        }
                        .to_bytes()?,
                    ));
                    entity_rows.push((
                        row_key,
                        EntityRow {
                            payload: Payload::Entity(bytes.clone()),
                            txn_id: restore.version,
                        }
                        .to_bytes()?,
                    ));
                }
                Some(Payload::Tombstone) => {
                    removed_kinds.push(kind_key(&restore.key));
                    entity_rows.push((
                        row_key,
                        EntityRow {
                            payload: Payload::Tombstone,
                            txn_id: restore.version,
                        }
                        .to_bytes()?,
                    ));
                }
                None => {
                    removed_kinds.push(kind_key(&restore.key));
                    removed_entities.push(row_key);
                }
            }
        }

        self.store.batch_put(Table::Entity, entity_rows)?;
        self.store.batch_delete(Table::Entity, &removed_entities)?;
        self.store.batch_put(Table::Kind, kind_rows)?;
        self.store.batch_delete(Table::Kind, &removed_kinds)?;
        self.insert_index_entries(&live)?;
        self.insert_composite_indexes(&live, indexes)
    }
}

// =============================================================================
// Row Computation
// =============================================================================

fn txn_for(txn_map: &TxnMap, key: &Key) -> Result<u64> {
    txn_map.get(&group_key(key)).copied().ok_or_else(|| {
        DatastoreError::Internal(format!("no transaction assigned to entity group of {}", key))
    })
}

fn decode_current(current: &[Option<EntityRow>]) -> Result<Vec<Entity>> {
    let mut old = Vec::new();
    for row in current.iter().flatten() {
        if let Some(entity) = row.payload.entity()? {
            old.push(entity);
        }
    }
    Ok(old)
}

type Rows = Vec<(Vec<u8>, Vec<u8>)>;

fn index_rows(entities: &[Entity]) -> Result<(Rows, Rows)> {
    let mut asc = Vec::new();
    let mut dsc = Vec::new();
    for entity in entities {
        let value = IndexRow {
            reference: entity_key(&entity.key),
        }
        .to_bytes()?;
        for property in &entity.properties {
            asc.push((
                index_key(&entity.key, &property.name, &property.value, Direction::Ascending),
                value.clone(),
            ));
            dsc.push((
                index_key(&entity.key, &property.name, &property.value, Direction::Descending),
                value.clone(),
            ));
        }
    }
    Ok((asc, dsc))
}

/// Every composite row key of `entity` under `index`.
///
/// Empty when the kind differs or a required property is missing.
pub fn composite_keys(index: &CompositeIndex, entity: &Entity) -> Vec<Vec<u8>> {
    let definition = &index.definition;
    if entity.key.kind() != definition.kind {
        return Vec::new();
    }

    // Encoded values per index property
    let mut columns: Vec<Vec<Vec<u8>>> = Vec::with_capacity(definition.properties.len());
    for property in &definition.properties {
        let values: Vec<Vec<u8>> = if property.name == KEY_PROPERTY {
            vec![encode_value_directed(
                &PropertyValue::Key(entity.key.clone()),
                property.direction,
            )]
        } else {
            entity
                .values(&property.name)
                .map(|v| encode_value_directed(v, property.direction))
                .collect()
        };
        if values.is_empty() {
            return Vec::new();
        }
        columns.push(values);
    }

    // Cartesian product of the value columns
    let mut combinations: Vec<Vec<Vec<u8>>> = vec![Vec::new()];
    for column in &columns {
        let mut next = Vec::with_capacity(combinations.len() * column.len());
        for combination in &combinations {
            for value in column {
                let mut extended = combination.clone();
                extended.push(value.clone());
                next.push(extended);
            }
        }
        combinations = next;
    }

    let prefix = composite_prefix(&entity.key.app, &entity.key.namespace, index.id);
    let path = &entity.key.path;
    let mut keys = Vec::new();
    for combination in &combinations {
        if definition.ancestor {
            for depth in 1..=path.len() {
                keys.push(composite_key(&prefix, Some(&path[..depth]), combination, path));
            }
        } else {
            keys.push(composite_key(&prefix, None, combination, path));
        }
    }
    keys
}

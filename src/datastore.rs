//! Datastore Module
//!
//! The entry points a request front end calls. Wires the writer, the
//! transaction manager, the ID allocator, the index manager and the query
//! engine around one batch store and one lock service.
//!
//! ## Responsibilities
//! - Validate keys and entities before touching storage
//! - Assign ids to incomplete keys
//! - Take entity group locks for every write and release them afterwards
//! - Mark transaction ids failed when a request dies half way
//!
//! ## Write Path
//!
//! ```text
//!   put(entities, txn?)
//!        │
//!        ├─ validate, assign ids
//!        ├─ lock groups ───────────── lock service
//!        ├─ read current rows ─────── entity table
//!        ├─ register old versions ─── lock service
//!        ├─ write rows ────────────── entity, kind, journal,
//!        │                            property, composite tables
//!        └─ release (non-transactional) or keep (transactional)
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::codec::{entity_key, key_from_entity_key};
use crate::config::Config;
use crate::error::{DatastoreError, Result};
use crate::ids::IdAllocator;
use crate::lock::{InMemoryLockService, LockService};
use crate::model::{Entity, Key};
use crate::query::{Query, QueryEngine, QueryResult};
use crate::schema::{CompositeIndex, IndexDefinition, IndexManager};
use crate::store::{BatchStore, EntityRow, MemoryStore, Row, Table};
use crate::txn::TransactionManager;
use crate::writer::{EntityWriter, TxnMap};

/// A datastore bound to one batch store and one lock service
pub struct Datastore {
    store: Arc<dyn BatchStore>,
    writer: Arc<EntityWriter>,
    txn: Arc<TransactionManager>,
    ids: IdAllocator,
    indexes: Arc<IndexManager>,
    queries: QueryEngine,
}

impl Datastore {
    /// Build a datastore over the given collaborators.
    ///
    /// Starts the index build worker.
    pub fn open(config: Config, store: Arc<dyn BatchStore>, lock: Arc<dyn LockService>) -> Result<Self> {
        let writer = Arc::new(EntityWriter::new(Arc::clone(&store)));
        let txn = Arc::new(TransactionManager::new(
            Arc::clone(&store),
            Arc::clone(&lock),
            config.lock_retry,
        ));
        let ids = IdAllocator::new(Arc::clone(&lock), config.id_retry, config.max_id_block);
        let indexes = Arc::new(IndexManager::new(
            Arc::clone(&store),
            Arc::clone(&txn),
            Arc::clone(&writer),
            &config,
        )?);
        let queries = QueryEngine::new(
            Arc::clone(&store),
            Arc::clone(&txn),
            Arc::clone(&indexes),
            config,
        );

        Ok(Self {
            store,
            writer,
            txn,
            ids,
            indexes,
            queries,
        })
    }

    /// A datastore over a fresh [`MemoryStore`] and [`InMemoryLockService`]
    pub fn in_memory(config: Config) -> Result<Self> {
        Self::open(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(InMemoryLockService::new()),
        )
    }

    /// A datastore over rows loaded from a snapshot.
    ///
    /// Counters and transaction numbering live in the lock service, so a
    /// fresh [`InMemoryLockService`] is moved past every id and version
    /// stamp already in the entity table.
    pub fn recover(config: Config, store: Arc<MemoryStore>) -> Result<Self> {
        let lock = Arc::new(InMemoryLockService::new());

        let mut seen: HashMap<String, (Vec<i64>, u64)> = HashMap::new();
        let row_keys = store.keys(Table::Entity);
        let values = store.batch_get(Table::Entity, &row_keys)?;
        for (row_key, value) in row_keys.iter().zip(values) {
            let Some(value) = value else { continue };
            let row = EntityRow::from_bytes(&value)?;
            let key = key_from_entity_key(row_key)?;
            let (used, last_txn) = seen.entry(key.app).or_default();
            used.extend(key.path.iter().filter_map(|element| element.id));
            *last_txn = (*last_txn).max(row.txn_id);
        }

        let datastore = Self::open(config, store, lock.clone())?;
        for (app, (used, last_txn)) in seen {
            datastore.reserve_ids(&app, &used)?;
            lock.resume_after(&app, last_txn);
            info!(app = %app, ids = used.len(), last_txn, "recovered stored state");
        }
        Ok(datastore)
    }

    pub fn store(&self) -> &Arc<dyn BatchStore> {
        &self.store
    }

    // =========================================================================
    // Entities
    // =========================================================================

    /// Write entities, returning their complete keys in input order.
    ///
    /// Incomplete keys get ids from one block allocated for the batch. When
    /// the same key appears twice, the last entity wins.
    pub fn put(&self, entities: Vec<Entity>, txn: Option<u64>) -> Result<Vec<Key>> {
        if entities.is_empty() {
            return Ok(Vec::new());
        }

        // Step 1: Validate
        for entity in &entities {
            entity.validate(true)?;
        }
        let app = single_app(entities.iter().map(|e| &e.key))?;

        // Step 2: Assign ids to incomplete keys
        let entities = self.assign_ids(&app, entities)?;
        let assigned: Vec<Key> = entities.iter().map(|e| e.key.clone()).collect();
        let entities = last_per_key(entities);
        let keys: Vec<Key> = entities.iter().map(|e| e.key.clone()).collect();

        // Step 3: Lock, then write
        let indexes = self.indexes.writable_indexes(&app)?;
        self.locked(&app, &keys, txn, |txn_map| {
            let current = self.writer.fetch_rows(&keys)?;
            self.txn.register_old_entities(&app, &keys, &current, txn_map)?;
            self.writer.put_entities(&entities, &current, txn_map, &indexes)
        })?;

        debug!(app = %app, count = entities.len(), txn = ?txn, "entities put");
        Ok(assigned)
    }

    /// Read entities by key. Missing and deleted entities come back as `None`.
    ///
    /// Reads inside a transaction lock the groups they touch.
    pub fn get(&self, keys: &[Key], txn: Option<u64>) -> Result<Vec<Option<Entity>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        for key in keys {
            key.validate(false)?;
        }
        let app = single_app(keys.iter())?;

        if let Some(txn) = txn {
            self.txn.acquire_locks_for_trans(&app, keys, txn)?;
        }
        let row_keys: Vec<Vec<u8>> = keys.iter().map(entity_key).collect();
        self.txn.validated_entities(&app, &row_keys, txn)
    }

    /// Delete entities. Deleting a missing entity is not an error.
    pub fn delete(&self, keys: &[Key], txn: Option<u64>) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        for key in keys {
            key.validate(false)?;
        }
        let app = single_app(keys.iter())?;

        let mut keys = keys.to_vec();
        keys.sort_by_key(entity_key);
        keys.dedup();

        let indexes = self.indexes.writable_indexes(&app)?;
        self.locked(&app, &keys, txn, |txn_map| {
            let current = self.writer.fetch_rows(&keys)?;
            self.txn.register_old_entities(&app, &keys, &current, txn_map)?;
            self.writer.delete_entities(&keys, &current, txn_map, &indexes)
        })?;

        debug!(app = %app, count = keys.len(), txn = ?txn, "entities deleted");
        Ok(())
    }

    /// Run `write` while holding the groups of `keys`.
    ///
    /// Non-transactional locks are released on success and their ids marked
    /// failed on error. A transactional failure marks the whole transaction
    /// failed, so the caller can only roll it back.
    fn locked<F>(&self, app: &str, keys: &[Key], txn: Option<u64>, write: F) -> Result<()>
    where
        F: FnOnce(&TxnMap) -> Result<()>,
    {
        match txn {
            None => {
                let txn_map = self.txn.acquire_locks_for_nontrans(app, keys)?;
                match write(&txn_map) {
                    Ok(()) => self.txn.release_locks(app, &txn_map),
                    Err(err) => {
                        self.txn.notify_failed(app, &txn_map);
                        Err(err)
                    }
                }
            }
            Some(txn) => {
                let txn_map = self.txn.acquire_locks_for_trans(app, keys, txn)?;
                write(&txn_map).map_err(|err| {
                    self.txn.invalidate(app, txn);
                    err
                })
            }
        }
    }

    fn assign_ids(&self, app: &str, mut entities: Vec<Entity>) -> Result<Vec<Entity>> {
        let missing = entities.iter().filter(|e| !e.key.is_complete()).count();
        if missing == 0 {
            return Ok(entities);
        }

        let (start, _) = self.ids.allocate_size(app, missing as u64)?;
        let mut next = start;
        for entity in entities.iter_mut().filter(|e| !e.key.is_complete()) {
            if let Some(element) = entity.key.path.last_mut() {
                element.id = Some(next);
                next += 1;
            }
        }
        Ok(entities)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn run_query(&self, query: &Query) -> Result<QueryResult> {
        self.queries.run(query)
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    pub fn begin_transaction(&self, app: &str, xg: bool) -> Result<u64> {
        self.txn.begin(app, xg)
    }

    pub fn commit(&self, app: &str, txn: u64) -> Result<()> {
        self.txn.commit(app, txn)
    }

    /// Undo the transaction's writes and mark it failed
    pub fn rollback(&self, app: &str, txn: u64) -> Result<()> {
        let indexes = self.indexes.writable_indexes(app)?;
        self.txn.rollback(app, txn, &self.writer, &indexes)?;
        info!(app, txn, "transaction rolled back");
        Ok(())
    }

    // =========================================================================
    // IDs
    // =========================================================================

    /// Reserve a block of ids, either `size` ids or every id up to `max`
    pub fn allocate_ids(&self, app: &str, size: Option<u64>, max: Option<i64>) -> Result<(i64, i64)> {
        match (size, max) {
            (Some(size), None) => self.ids.allocate_size(app, size),
            (None, Some(max)) => self.ids.allocate_max(app, max),
            _ => Err(DatastoreError::BadRequest(
                "exactly one of size and max must be given".to_string(),
            )),
        }
    }

    /// Keep the allocator from handing out ids already used by imported keys
    pub fn reserve_ids(&self, app: &str, ids: &[i64]) -> Result<()> {
        self.ids.reserve_ids(app, ids)
    }

    // =========================================================================
    // Composite Indexes
    // =========================================================================

    pub fn create_composite_index(&self, app: &str, definition: IndexDefinition) -> Result<u64> {
        self.indexes.create_composite_index(app, definition)
    }

    pub fn update_composite_index(&self, app: &str, index: CompositeIndex) -> Result<()> {
        self.indexes.update_composite_index(app, index)
    }

    pub fn delete_composite_index(&self, app: &str, index_id: u64) -> Result<()> {
        self.indexes.delete_composite_index(app, index_id)
    }

    pub fn list_composite_indexes(&self, app: &str) -> Result<Vec<CompositeIndex>> {
        self.indexes.list_composite_indexes(app)
    }

    /// Block until the build or cleanup job of an index has finished
    pub fn wait_for_index(&self, app: &str, index_id: u64) -> Result<()> {
        self.indexes.wait_for_index(app, index_id)
    }
}

/// The one application every key of a request belongs to
fn single_app<'a>(mut keys: impl Iterator<Item = &'a Key>) -> Result<String> {
    let first = keys
        .next()
        .ok_or_else(|| DatastoreError::BadRequest("request without keys".to_string()))?;
    if let Some(other) = keys.find(|key| key.app != first.app) {
        return Err(DatastoreError::BadRequest(format!(
            "request mixes applications {} and {}",
            first.app, other.app
        )));
    }
    Ok(first.app.clone())
}

/// Drop earlier entities that share a key with a later one
fn last_per_key(entities: Vec<Entity>) -> Vec<Entity> {
    let mut position: HashMap<Vec<u8>, usize> = HashMap::new();
    let mut kept: Vec<Option<Entity>> = Vec::with_capacity(entities.len());
    for entity in entities {
        let row_key = entity_key(&entity.key);
        if let Some(previous) = position.insert(row_key, kept.len()) {
            kept[previous] = None;
        }
        kept.push(Some(entity));
    }
    kept.into_iter().flatten().collect()
}

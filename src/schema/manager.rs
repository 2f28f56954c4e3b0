//! Composite index metadata manager

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::codec::{index_definition_key, index_definition_prefix};
use crate::config::Config;
use crate::error::{DatastoreError, Result};
use crate::model::{is_reserved_name, KEY_PROPERTY};
use crate::store::{decode_rows, BatchStore, Row, ScanRange, Table};
use crate::txn::TransactionManager;
use crate::writer::EntityWriter;

use super::builder::{BuildContext, IndexBuilder, JobReceiver};
use super::{CompositeIndex, IndexDefinition, IndexState};

/// Owns composite index definitions and schedules their builds
pub struct IndexManager {
    store: Arc<dyn BatchStore>,
    max_indexes: usize,
    builder: IndexBuilder,
    /// Outstanding build or cleanup jobs per (app, index id)
    pending: Mutex<HashMap<(String, u64), JobReceiver>>,
}

impl IndexManager {
    pub fn new(
        store: Arc<dyn BatchStore>,
        txn: Arc<TransactionManager>,
        writer: Arc<EntityWriter>,
        config: &Config,
    ) -> Result<Self> {
        let builder = IndexBuilder::spawn(BuildContext {
            store: Arc::clone(&store),
            txn,
            writer,
            batch_size: config.backfill_batch_size,
        })?;
        Ok(Self {
            store,
            max_indexes: config.max_composite_indexes,
            builder,
            pending: Mutex::new(HashMap::new()),
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Register a new composite index and start building it.
    ///
    /// Registering an identical definition again returns the existing id.
    pub fn create_composite_index(&self, app: &str, definition: IndexDefinition) -> Result<u64> {
        validate_definition(&definition)?;

        let existing = self.list_composite_indexes(app)?;
        if let Some(index) = existing.iter().find(|i| i.definition == definition) {
            debug!(app, index_id = index.id, "composite index already registered");
            return Ok(index.id);
        }
        if existing.len() >= self.max_indexes {
            return Err(DatastoreError::BadRequest(format!(
                "application {} already has {} composite indexes",
                app,
                existing.len()
            )));
        }

        let index = CompositeIndex {
            id: new_index_id(&existing),
            app: app.to_string(),
            definition,
            state: IndexState::WriteOnly,
        };
        self.write_metadata(&index)?;
        info!(app, index_id = index.id, kind = %index.definition.kind, "composite index created");

        let job = self.builder.backfill(index.clone())?;
        self.pending.lock().insert((app.to_string(), index.id), job);
        Ok(index.id)
    }

    /// Overwrite the stored definition or state of an existing index.
    ///
    /// Moving an index back to `WriteOnly` schedules another backfill.
    pub fn update_composite_index(&self, app: &str, index: CompositeIndex) -> Result<()> {
        if index.app != app {
            return Err(DatastoreError::BadRequest(format!(
                "index belongs to {}, not {}",
                index.app, app
            )));
        }
        validate_definition(&index.definition)?;
        if self.get_composite_index(app, index.id)?.is_none() {
            return Err(DatastoreError::BadRequest(format!(
                "no composite index {} for {}",
                index.id, app
            )));
        }

        self.write_metadata(&index)?;
        debug!(app, index_id = index.id, state = ?index.state, "composite index updated");
        if index.state == IndexState::WriteOnly {
            let job = self.builder.backfill(index.clone())?;
            self.pending.lock().insert((app.to_string(), index.id), job);
        }
        Ok(())
    }

    /// Remove an index definition and schedule removal of its rows
    pub fn delete_composite_index(&self, app: &str, index_id: u64) -> Result<()> {
        if self.get_composite_index(app, index_id)?.is_none() {
            return Err(DatastoreError::BadRequest(format!(
                "no composite index {} for {}",
                index_id, app
            )));
        }

        self.store
            .batch_delete(Table::Metadata, &[index_definition_key(app, index_id)])?;
        info!(app, index_id, "composite index deleted");

        let job = self.builder.purge(app, index_id)?;
        self.pending.lock().insert((app.to_string(), index_id), job);
        Ok(())
    }

    /// Block until the last scheduled job for an index has finished
    pub fn wait_for_index(&self, app: &str, index_id: u64) -> Result<()> {
        let job = self.pending.lock().remove(&(app.to_string(), index_id));
        match job {
            Some(rx) => rx
                .recv()
                .map_err(|_| DatastoreError::Internal("index builder dropped its job".to_string()))?
                .map(|_| ()),
            None => Ok(()),
        }
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Every registered index of an application, in id order
    pub fn list_composite_indexes(&self, app: &str) -> Result<Vec<CompositeIndex>> {
        let range = ScanRange::prefix(&index_definition_prefix(app));
        let rows = self.store.range_query(Table::Metadata, &range, usize::MAX, 0)?;
        Ok(decode_rows::<CompositeIndex>(rows)?
            .into_iter()
            .map(|(_, index)| index)
            .collect())
    }

    pub fn get_composite_index(&self, app: &str, index_id: u64) -> Result<Option<CompositeIndex>> {
        let key = index_definition_key(app, index_id);
        match self.store.batch_get(Table::Metadata, &[key])?.into_iter().next() {
            Some(Some(bytes)) => Ok(Some(CompositeIndex::from_bytes(&bytes)?)),
            _ => Ok(None),
        }
    }

    /// Indexes writes must maintain
    pub fn writable_indexes(&self, app: &str) -> Result<Vec<CompositeIndex>> {
        Ok(self
            .list_composite_indexes(app)?
            .into_iter()
            .filter(CompositeIndex::is_writable)
            .collect())
    }

    fn write_metadata(&self, index: &CompositeIndex) -> Result<()> {
        self.store.batch_put(
            Table::Metadata,
            vec![(index_definition_key(&index.app, index.id), index.to_bytes()?)],
        )
    }
}

/// Random positive 63-bit id not used by any existing index
fn new_index_id(existing: &[CompositeIndex]) -> u64 {
    loop {
        let id = (Uuid::new_v4().as_u128() >> 65) as u64;
        if id != 0 && !existing.iter().any(|i| i.id == id) {
            return id;
        }
    }
}

fn validate_definition(definition: &IndexDefinition) -> Result<()> {
    if definition.kind.is_empty() || definition.kind.contains(&['\u{0}', '\u{1}', ':'][..]) {
        return Err(DatastoreError::BadRequest(format!(
            "invalid index kind {:?}",
            definition.kind
        )));
    }
    if definition.properties.is_empty() {
        return Err(DatastoreError::BadRequest(
            "composite index needs at least one property".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for property in &definition.properties {
        let name = property.name.as_str();
        if name.is_empty() || name.contains('\u{0}') || (is_reserved_name(name) && name != KEY_PROPERTY) {
            return Err(DatastoreError::BadRequest(format!(
                "invalid index property {:?}",
                name
            )));
        }
        if !seen.insert(name) {
            return Err(DatastoreError::BadRequest(format!(
                "property {} appears twice in the index",
                name
            )));
        }
    }
    Ok(())
}

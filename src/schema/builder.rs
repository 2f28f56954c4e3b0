//! Background index builder
//!
//! A single worker thread receives jobs over a channel: backfilling a new
//! composite index from the kind table, or purging the rows of a deleted
//! one. Each job reports through its own response channel.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::codec::{index_definition_key, KEY_DELIMITER, KIND_SEPARATOR};
use crate::error::{DatastoreError, Result};
use crate::store::{decode_rows, BatchStore, KindRow, Row, ScanRange, Table};
use crate::txn::TransactionManager;
use crate::writer::EntityWriter;

use super::{CompositeIndex, IndexState};

/// Receives the number of rows a job touched
pub(crate) type JobReceiver = Receiver<Result<usize>>;

/// Work item for the builder thread
enum BuildCommand {
    Backfill {
        index: CompositeIndex,
        tx: Sender<Result<usize>>,
    },
    Purge {
        app: String,
        index_id: u64,
        tx: Sender<Result<usize>>,
    },
    Shutdown,
}

/// Shared handles the builder thread works through
pub(crate) struct BuildContext {
    pub store: Arc<dyn BatchStore>,
    pub txn: Arc<TransactionManager>,
    pub writer: Arc<EntityWriter>,
    pub batch_size: usize,
}

/// Owner of the builder thread
pub(crate) struct IndexBuilder {
    tx: Sender<BuildCommand>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl IndexBuilder {
    /// Spawn the worker thread
    pub fn spawn(context: BuildContext) -> Result<Self> {
        let (tx, rx) = channel::unbounded();
        let handle = thread::Builder::new()
            .name("kindkv-index-builder".to_string())
            .spawn(move || build_loop(context, rx))?;
        Ok(Self {
            tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue a backfill of `index`
    pub fn backfill(&self, index: CompositeIndex) -> Result<JobReceiver> {
        let (tx, rx) = channel::bounded(1);
        self.send(BuildCommand::Backfill { index, tx })?;
        Ok(rx)
    }

    /// Queue removal of every row of a deleted index
    pub fn purge(&self, app: &str, index_id: u64) -> Result<JobReceiver> {
        let (tx, rx) = channel::bounded(1);
        self.send(BuildCommand::Purge {
            app: app.to_string(),
            index_id,
            tx,
        })?;
        Ok(rx)
    }

    fn send(&self, command: BuildCommand) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| DatastoreError::Internal("index builder thread stopped".to_string()))
    }
}

impl Drop for IndexBuilder {
    fn drop(&mut self) {
        let _ = self.tx.send(BuildCommand::Shutdown);
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                error!("index builder thread panicked");
            }
        }
    }
}

// =============================================================================
// Worker
// =============================================================================

fn build_loop(context: BuildContext, rx: Receiver<BuildCommand>) {
    debug!("index builder started");
    while let Ok(command) = rx.recv() {
        match command {
            BuildCommand::Backfill { index, tx } => {
                let result = backfill(&context, &index);
                finish_backfill(&context, &index, &result);
                let _ = tx.send(result);
            }
            BuildCommand::Purge { app, index_id, tx } => {
                let result = purge(&context, &app, index_id);
                match &result {
                    Ok(removed) => info!(app = %app, index_id, removed, "composite index rows removed"),
                    Err(err) => error!(app = %app, index_id, error = %err, "composite index cleanup failed"),
                }
                let _ = tx.send(result);
            }
            BuildCommand::Shutdown => break,
        }
    }
    debug!("index builder stopped");
}

/// Write composite rows for every existing entity of the index's kind.
///
/// Walks the whole kind table of the application so entities of every
/// namespace are covered.
fn backfill(context: &BuildContext, index: &CompositeIndex) -> Result<usize> {
    let kind = index.definition.kind.as_bytes();
    let mut range = ScanRange::prefix(&app_prefix(&index.app));
    let mut written = 0;

    loop {
        let rows = context
            .store
            .range_query(Table::Kind, &range, context.batch_size, 0)?;
        let Some((last_key, _)) = rows.last() else {
            break;
        };
        let next = range.resume_at(last_key.clone(), false);
        let exhausted = rows.len() < context.batch_size;

        // Step 1: Keep references of the indexed kind
        let references: Vec<Vec<u8>> = decode_rows::<KindRow>(rows)?
            .into_iter()
            .filter(|(row_key, _)| kind_of_row(row_key) == Some(kind))
            .map(|(_, row)| row.reference)
            .collect();

        // Step 2: Resolve committed versions and write their rows
        if !references.is_empty() {
            let entities: Vec<_> = context
                .txn
                .validated_entities(&index.app, &references, None)?
                .into_iter()
                .flatten()
                .collect();
            context
                .writer
                .insert_composite_indexes(&entities, std::slice::from_ref(index))?;
            written += entities.len();
        }

        if exhausted {
            break;
        }
        range = next;
    }
    Ok(written)
}

/// Move the index to its final state unless it was deleted meanwhile
fn finish_backfill(context: &BuildContext, index: &CompositeIndex, result: &Result<usize>) {
    let state = match result {
        Ok(entities) => {
            info!(app = %index.app, index_id = index.id, entities, "composite index built");
            IndexState::ReadWrite
        }
        Err(err) => {
            error!(app = %index.app, index_id = index.id, error = %err, "composite index build failed");
            IndexState::Error
        }
    };

    let key = index_definition_key(&index.app, index.id);
    let update = || -> Result<()> {
        let stored = context.store.batch_get(Table::Metadata, std::slice::from_ref(&key))?;
        let Some(Some(bytes)) = stored.into_iter().next() else {
            debug!(index_id = index.id, "index deleted while building");
            return Ok(());
        };
        let mut current = CompositeIndex::from_bytes(&bytes)?;
        current.state = state;
        context
            .store
            .batch_put(Table::Metadata, vec![(key.clone(), current.to_bytes()?)])
    };
    if let Err(err) = update() {
        error!(index_id = index.id, error = %err, "unable to record composite index state");
    }
}

/// Delete every composite row whose index id component matches
fn purge(context: &BuildContext, app: &str, index_id: u64) -> Result<usize> {
    let id_token = index_id.to_string().into_bytes();
    let mut range = ScanRange::prefix(&app_prefix(app));
    let mut removed = 0;

    loop {
        let rows = context
            .store
            .range_query(Table::Composite, &range, context.batch_size, 0)?;
        let Some((last_key, _)) = rows.last() else {
            break;
        };
        let next = range.resume_at(last_key.clone(), false);
        let exhausted = rows.len() < context.batch_size;

        let doomed: Vec<Vec<u8>> = rows
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| key.split(|b| *b == KEY_DELIMITER).nth(2) == Some(id_token.as_slice()))
            .collect();
        removed += doomed.len();
        context.store.batch_delete(Table::Composite, &doomed)?;

        if exhausted {
            break;
        }
        range = next;
    }
    Ok(removed)
}

fn app_prefix(app: &str) -> Vec<u8> {
    let mut prefix = app.as_bytes().to_vec();
    prefix.push(KEY_DELIMITER);
    prefix
}

/// Kind component of a kind table row key
fn kind_of_row(row_key: &[u8]) -> Option<&[u8]> {
    let rest = row_key.splitn(3, |b| *b == KEY_DELIMITER).nth(2)?;
    let end = rest.iter().position(|b| *b == KIND_SEPARATOR)?;
    Some(&rest[..end])
}

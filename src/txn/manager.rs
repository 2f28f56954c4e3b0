//! Transaction manager

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::codec::{journal_key, key_from_entity_key};
use crate::config::RetryPolicy;
use crate::error::{DatastoreError, Result};
use crate::lock::{LockError, LockService};
use crate::model::{Entity, Key};
use crate::schema::CompositeIndex;
use crate::store::{BatchStore, EntityRow, JournalRow, Payload, Row, Table};
use crate::writer::{group_key, EntityWriter, Restore, TxnMap};

/// Talks to the lock service on behalf of every read and write
///
/// ## Version resolution
/// Every entity row carries the id of the transaction that wrote it. Before
/// a row is handed to a caller, that id is resolved through the lock service;
/// if it is not committed, the journal supplies the payload of the resolved
/// version instead, and version 0 means the entity does not exist.
pub struct TransactionManager {
    store: Arc<dyn BatchStore>,
    lock: Arc<dyn LockService>,
    retry: RetryPolicy,
}

impl TransactionManager {
    pub fn new(store: Arc<dyn BatchStore>, lock: Arc<dyn LockService>, retry: RetryPolicy) -> Self {
        Self { store, lock, retry }
    }

    // =========================================================================
    // Explicit Transactions
    // =========================================================================

    /// Start an explicit transaction
    pub fn begin(&self, app: &str, xg: bool) -> Result<u64> {
        let txn = self.lock.get_transaction_id(app, xg)?;
        debug!(app, txn, xg, "transaction started");
        Ok(txn)
    }

    /// Commit: the writes are already applied, so only the locks go
    pub fn commit(&self, app: &str, txn: u64) -> Result<()> {
        self.lock.release_lock(app, txn).map_err(|err| match err {
            LockError::InvalidTransaction(_) => DatastoreError::ConcurrentModification(format!(
                "transaction {} failed or already finished",
                txn
            )),
            other => other.into(),
        })?;
        debug!(app, txn, "transaction committed");
        Ok(())
    }

    /// Roll back an explicit transaction.
    ///
    /// Rows written by the transaction are put back to their registered
    /// previous versions from the journal, then the transaction id is marked
    /// failed. Readers stay correct even if the restore step fails, because
    /// version resolution skips failed ids.
    pub fn rollback(
        &self,
        app: &str,
        txn: u64,
        writer: &EntityWriter,
        indexes: &[CompositeIndex],
    ) -> Result<()> {
        // Step 1: Restore registered rows
        match self.collect_restores(app, txn) {
            Ok(restores) if !restores.is_empty() => {
                if let Err(err) = writer.restore_entities(&restores, indexes) {
                    warn!(app, txn, error = %err, "restoring rolled back rows failed");
                }
            }
            Ok(_) => {}
            Err(err) => warn!(app, txn, error = %err, "unable to collect rows to restore"),
        }

        // Step 2: Blacklist the transaction and release its locks
        self.lock.notify_failed_transaction(app, txn)?;
        debug!(app, txn, "transaction rolled back");
        Ok(())
    }

    fn collect_restores(&self, app: &str, txn: u64) -> Result<Vec<Restore>> {
        let updated = self.lock.updated_keys(app, txn)?;
        if updated.is_empty() {
            return Ok(Vec::new());
        }

        let row_keys: Vec<Vec<u8>> = updated.iter().map(|(k, _)| k.clone()).collect();
        let current = self.store.batch_get(Table::Entity, &row_keys)?;
        let journal_keys: Vec<Vec<u8>> = updated
            .iter()
            .map(|(row_key, version)| journal_key(row_key, *version))
            .collect();
        let journal = self.store.batch_get(Table::Journal, &journal_keys)?;

        let mut restores = Vec::new();
        for (((row_key, version), current), previous) in updated.iter().zip(current).zip(journal) {
            let current = match current {
                Some(bytes) => EntityRow::from_bytes(&bytes)?,
                None => continue,
            };
            // Only rows still carrying this transaction's write
            if current.txn_id != txn {
                continue;
            }
            let payload = if *version == 0 {
                None
            } else {
                match previous {
                    Some(bytes) => Some(JournalRow::from_bytes(&bytes)?.payload),
                    None => {
                        warn!(app, txn, version, "journal entry missing for rollback");
                        continue;
                    }
                }
            };
            restores.push(Restore {
                key: key_from_entity_key(row_key)?,
                current: current.payload.entity()?,
                version: *version,
                payload,
            });
        }
        Ok(restores)
    }

    // =========================================================================
    // Locking
    // =========================================================================

    /// Lock every entity group touched by `keys` with a fresh transaction id
    /// per group.
    ///
    /// A conflict fails every id taken in that attempt, sleeps, and retries;
    /// when the policy is exhausted the caller sees a concurrent-modification
    /// error.
    pub fn acquire_locks_for_nontrans(&self, app: &str, keys: &[Key]) -> Result<TxnMap> {
        let groups: BTreeSet<Vec<u8>> = keys.iter().map(group_key).collect();
        let mut last_conflict = String::new();

        for attempt in 1..=self.retry.attempts {
            let mut txn_map = TxnMap::new();
            let mut conflict = None;

            for group in &groups {
                let txn = match self.lock.get_transaction_id(app, false) {
                    Ok(txn) => txn,
                    Err(err) => {
                        self.notify_failed(app, &txn_map);
                        return Err(err.into());
                    }
                };
                txn_map.insert(group.clone(), txn);

                match self.lock.acquire_lock(app, txn, group) {
                    Ok(()) => {}
                    Err(LockError::Conflict(detail)) => {
                        conflict = Some(detail);
                        break;
                    }
                    Err(err) => {
                        self.notify_failed(app, &txn_map);
                        return Err(err.into());
                    }
                }
            }

            match conflict {
                None => return Ok(txn_map),
                Some(detail) => {
                    self.notify_failed(app, &txn_map);
                    debug!(app, attempt, detail = %detail, "entity group lock busy");
                    last_conflict = detail;
                    if attempt < self.retry.attempts {
                        self.retry.pause();
                    }
                }
            }
        }

        Err(DatastoreError::ConcurrentModification(format!(
            "unable to lock entity group after {} attempts: {}",
            self.retry.attempts, last_conflict
        )))
    }

    /// Lock every entity group touched by `keys` for an explicit transaction.
    ///
    /// Any failure invalidates the transaction.
    pub fn acquire_locks_for_trans(&self, app: &str, keys: &[Key], txn: u64) -> Result<TxnMap> {
        let groups: BTreeSet<Vec<u8>> = keys.iter().map(group_key).collect();
        let mut txn_map = TxnMap::new();
        for group in groups {
            if let Err(err) = self.lock.acquire_lock(app, txn, &group) {
                if !matches!(err, LockError::InvalidTransaction(_)) {
                    if let Err(notify_err) = self.lock.notify_failed_transaction(app, txn) {
                        warn!(app, txn, error = %notify_err, "failed to invalidate transaction");
                    }
                }
                return Err(err.into());
            }
            txn_map.insert(group, txn);
        }
        Ok(txn_map)
    }

    /// Commit every transaction of a non-transactional write
    pub fn release_locks(&self, app: &str, txn_map: &TxnMap) -> Result<()> {
        for txn in txn_map.values() {
            self.lock.release_lock(app, *txn)?;
        }
        Ok(())
    }

    /// Mark every transaction in the map failed. Errors are logged, never
    /// raised, so the caller's original error propagates.
    pub fn notify_failed(&self, app: &str, txn_map: &TxnMap) {
        for txn in txn_map.values() {
            if let Err(err) = self.lock.notify_failed_transaction(app, *txn) {
                warn!(app, txn, error = %err, "failed to notify lock service of failed transaction");
            }
        }
    }

    /// Mark one explicit transaction failed, logging errors
    pub fn invalidate(&self, app: &str, txn: u64) {
        if let Err(err) = self.lock.notify_failed_transaction(app, txn) {
            warn!(app, txn, error = %err, "failed to invalidate transaction");
        }
    }

    // =========================================================================
    // Version Protocol
    // =========================================================================

    /// Register the committed version of each row about to be overwritten
    pub fn register_old_entities(
        &self,
        app: &str,
        keys: &[Key],
        current: &[Option<EntityRow>],
        txn_map: &TxnMap,
    ) -> Result<()> {
        for (key, row) in keys.iter().zip(current) {
            let txn = *txn_map.get(&group_key(key)).ok_or_else(|| {
                DatastoreError::Internal(format!("no transaction assigned to group of {}", key))
            })?;
            let row_key = crate::codec::entity_key(key);
            let previous = match row {
                None => 0,
                // Already registered by this transaction
                Some(row) if row.txn_id == txn => continue,
                Some(row) => self.lock.get_valid_transaction_id(app, row.txn_id, &row_key)?,
            };
            self.lock.register_updated_key(app, txn, previous, &row_key)?;
        }
        Ok(())
    }

    /// Resolve raw entity rows to the entities a reader may see.
    ///
    /// Rows written by `txn` itself are returned as is.
    pub fn validated_result(
        &self,
        app: &str,
        rows: &[(Vec<u8>, Option<EntityRow>)],
        txn: Option<u64>,
    ) -> Result<Vec<Option<Entity>>> {
        let mut payloads: Vec<Option<Payload>> = Vec::with_capacity(rows.len());
        let mut lookups: Vec<(usize, Vec<u8>)> = Vec::new();

        for (position, (row_key, row)) in rows.iter().enumerate() {
            let Some(row) = row else {
                payloads.push(None);
                continue;
            };
            if Some(row.txn_id) == txn {
                payloads.push(Some(row.payload.clone()));
                continue;
            }

            let valid = self.lock.get_valid_transaction_id(app, row.txn_id, row_key)?;
            if valid == row.txn_id {
                payloads.push(Some(row.payload.clone()));
            } else if valid == 0 {
                payloads.push(None);
            } else {
                payloads.push(None);
                lookups.push((position, journal_key(row_key, valid)));
            }
        }

        if !lookups.is_empty() {
            let keys: Vec<Vec<u8>> = lookups.iter().map(|(_, k)| k.clone()).collect();
            let journal = self.store.batch_get(Table::Journal, &keys)?;
            for ((position, key), value) in lookups.into_iter().zip(journal) {
                match value {
                    Some(bytes) => payloads[position] = Some(JournalRow::from_bytes(&bytes)?.payload),
                    None => warn!(app, journal_key = ?key, "journal entry missing for resolved version"),
                }
            }
        }

        payloads
            .into_iter()
            .map(|payload| match payload {
                Some(payload) => payload.entity(),
                None => Ok(None),
            })
            .collect()
    }

    /// Fetch entity rows by row key and resolve them
    pub fn validated_entities(
        &self,
        app: &str,
        row_keys: &[Vec<u8>],
        txn: Option<u64>,
    ) -> Result<Vec<Option<Entity>>> {
        let raw = self.store.batch_get(Table::Entity, row_keys)?;
        let rows = row_keys
            .iter()
            .cloned()
            .zip(raw)
            .map(|(key, value)| Ok((key, value.map(|b| EntityRow::from_bytes(&b)).transpose()?)))
            .collect::<Result<Vec<_>>>()?;
        self.validated_result(app, &rows, txn)
    }
}

//! In-process lock service
//!
//! Keeps the coordinator state in memory behind a single mutex. Suitable for
//! a single datastore process and for tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::{LockError, LockResult, LockService, MAX_GROUPS_FOR_XG};

#[derive(Debug, Default)]
struct TxnRecord {
    xg: bool,
    groups: Vec<Vec<u8>>,
    updated: Vec<(Vec<u8>, u64)>,
}

#[derive(Debug, Default)]
struct AppState {
    last_txn: u64,
    active: HashMap<u64, TxnRecord>,
    failed: HashSet<u64>,
    valid_versions: HashMap<Vec<u8>, u64>,
    locks: HashMap<Vec<u8>, u64>,
}

impl AppState {
    fn release_groups(&mut self, txn: u64, groups: &[Vec<u8>]) {
        for group in groups {
            if self.locks.get(group) == Some(&txn) {
                self.locks.remove(group);
            }
        }
    }
}

/// [`LockService`] held entirely in process memory
///
/// ## Failure injection:
/// - `inject_fault(err)` queues an error returned by the next call
/// - `set_unavailable(true)` fails every call
#[derive(Default)]
pub struct InMemoryLockService {
    apps: Mutex<HashMap<String, AppState>>,
    counters: Mutex<HashMap<String, i64>>,
    faults: Mutex<VecDeque<LockError>>,
    unavailable: AtomicBool,
}

impl InMemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an error for the next call
    pub fn inject_fault(&self, err: LockError) {
        self.faults.lock().push_back(err);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Continue issuing transaction ids of `app` after `last`.
    ///
    /// Rows loaded from a snapshot carry ids from an earlier process; a new
    /// transaction must never reuse one of them.
    pub fn resume_after(&self, app: &str, last: u64) {
        let mut apps = self.apps.lock();
        let state = apps.entry(app.to_string()).or_default();
        state.last_txn = state.last_txn.max(last);
    }

    /// Transaction currently holding the lock on `root_key`
    pub fn lock_holder(&self, app: &str, root_key: &[u8]) -> Option<u64> {
        self.apps
            .lock()
            .get(app)
            .and_then(|state| state.locks.get(root_key).copied())
    }

    /// Whether `txn` has been marked failed
    pub fn is_failed(&self, app: &str, txn: u64) -> bool {
        self.apps
            .lock()
            .get(app)
            .map(|state| state.failed.contains(&txn))
            .unwrap_or(false)
    }

    fn check(&self) -> LockResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LockError::Unavailable("coordinator unreachable".to_string()));
        }
        match self.faults.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl LockService for InMemoryLockService {
    fn get_transaction_id(&self, app: &str, is_xg: bool) -> LockResult<u64> {
        self.check()?;
        let mut apps = self.apps.lock();
        let state = apps.entry(app.to_string()).or_default();
        state.last_txn += 1;
        let txn = state.last_txn;
        state.active.insert(
            txn,
            TxnRecord {
                xg: is_xg,
                ..TxnRecord::default()
            },
        );
        Ok(txn)
    }

    fn acquire_lock(&self, app: &str, txn: u64, root_key: &[u8]) -> LockResult<()> {
        self.check()?;
        let mut apps = self.apps.lock();
        let state = apps.entry(app.to_string()).or_default();

        match state.locks.get(root_key) {
            Some(holder) if *holder == txn => return Ok(()),
            Some(holder) => {
                return Err(LockError::Conflict(format!(
                    "group held by transaction {}",
                    holder
                )))
            }
            None => {}
        }

        let record = state
            .active
            .get_mut(&txn)
            .ok_or(LockError::InvalidTransaction(txn))?;
        let limit = if record.xg { MAX_GROUPS_FOR_XG } else { 1 };
        if record.groups.len() >= limit {
            return Err(LockError::TooManyGroups(format!(
                "transaction {} may lock at most {} entity group(s)",
                txn, limit
            )));
        }
        record.groups.push(root_key.to_vec());
        state.locks.insert(root_key.to_vec(), txn);
        Ok(())
    }

    fn release_lock(&self, app: &str, txn: u64) -> LockResult<()> {
        self.check()?;
        let mut apps = self.apps.lock();
        let state = apps.entry(app.to_string()).or_default();
        let record = state
            .active
            .remove(&txn)
            .ok_or(LockError::InvalidTransaction(txn))?;
        state.release_groups(txn, &record.groups);
        Ok(())
    }

    fn notify_failed_transaction(&self, app: &str, txn: u64) -> LockResult<()> {
        self.check()?;
        let mut apps = self.apps.lock();
        let state = apps.entry(app.to_string()).or_default();

        // Committed transactions stay committed
        let Some(record) = state.active.remove(&txn) else {
            return Ok(());
        };
        state.failed.insert(txn);
        for (row_key, prev_version) in &record.updated {
            state.valid_versions.insert(row_key.clone(), *prev_version);
        }
        state.release_groups(txn, &record.groups);
        Ok(())
    }

    fn get_valid_transaction_id(&self, app: &str, candidate: u64, row_key: &[u8]) -> LockResult<u64> {
        self.check()?;
        let apps = self.apps.lock();
        let Some(state) = apps.get(app) else {
            return Ok(candidate);
        };

        if state.failed.contains(&candidate) {
            return Ok(state.valid_versions.get(row_key).copied().unwrap_or(0));
        }
        if let Some(record) = state.active.get(&candidate) {
            if let Some((_, prev)) = record.updated.iter().find(|(key, _)| key == row_key) {
                return Ok(*prev);
            }
        }
        Ok(candidate)
    }

    fn register_updated_key(&self, app: &str, txn: u64, prev_version: u64, row_key: &[u8]) -> LockResult<()> {
        self.check()?;
        let mut apps = self.apps.lock();
        let state = apps.entry(app.to_string()).or_default();
        let record = state
            .active
            .get_mut(&txn)
            .ok_or(LockError::InvalidTransaction(txn))?;

        // The first registration holds the version to restore
        if !record.updated.iter().any(|(key, _)| key == row_key) {
            record.updated.push((row_key.to_vec(), prev_version));
        }
        Ok(())
    }

    fn updated_keys(&self, app: &str, txn: u64) -> LockResult<Vec<(Vec<u8>, u64)>> {
        self.check()?;
        let apps = self.apps.lock();
        Ok(apps
            .get(app)
            .and_then(|state| state.active.get(&txn))
            .map(|record| record.updated.clone())
            .unwrap_or_default())
    }

    fn is_xg(&self, app: &str, txn: u64) -> LockResult<bool> {
        self.check()?;
        let apps = self.apps.lock();
        apps.get(app)
            .and_then(|state| state.active.get(&txn))
            .map(|record| record.xg)
            .ok_or(LockError::InvalidTransaction(txn))
    }

    fn increment_and_get_counter(&self, path: &str, amount: i64) -> LockResult<(i64, i64)> {
        self.check()?;
        let mut counters = self.counters.lock();
        let value = counters.entry(path.to_string()).or_insert(0);
        let previous = *value;
        *value += amount;
        Ok((previous, *value))
    }
}

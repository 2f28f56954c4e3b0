//! ID Allocator
//!
//! Hands out blocks of numeric ids from one monotonically increasing counter
//! per application, stored in the lock service.
//!
//! ## Responsibilities
//! - Reserve a block of `size` ids
//! - Raise the counter so every id up to `max` is reserved
//! - Mark explicitly-keyed ids as used
//!
//! ```text
//! counter: 0 ──allocate(10)──► 10 ──allocate_max(50)──► 50 ──allocate(5)──► 55
//! ranges:     [1, 10]             [11, 50]                 [51, 55]
//! ```
//! Blocks handed out by one counter never overlap, and a block is never
//! returned to the pool.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::{DatastoreError, Result};
use crate::lock::{LockError, LockService};

/// Allocates id blocks through the lock service counters
pub struct IdAllocator {
    lock: Arc<dyn LockService>,
    retry: RetryPolicy,
    max_block: u64,
}

impl IdAllocator {
    pub fn new(lock: Arc<dyn LockService>, retry: RetryPolicy, max_block: u64) -> Self {
        Self {
            lock,
            retry,
            max_block,
        }
    }

    /// Reserve `size` ids; returns the inclusive range `(start, end)`
    pub fn allocate_size(&self, app: &str, size: u64) -> Result<(i64, i64)> {
        if size == 0 {
            return Err(DatastoreError::BadRequest(
                "id allocation size must be positive".to_string(),
            ));
        }
        if size > self.max_block {
            return Err(DatastoreError::BadRequest(format!(
                "cannot allocate {} ids, the limit is {}",
                size, self.max_block
            )));
        }

        let amount = i64::try_from(size)
            .map_err(|_| DatastoreError::BadRequest(format!("allocation size {} is too large", size)))?;
        let (previous, current) = self.increment(app, amount)?;
        debug!(app, start = previous + 1, end = current, "allocated id block");
        Ok((previous + 1, current))
    }

    /// Raise the counter to at least `max`.
    ///
    /// Returns the ids newly reserved by this call. When the counter is
    /// already at or beyond `max` the range is empty (`start > end`).
    pub fn allocate_max(&self, app: &str, max: i64) -> Result<(i64, i64)> {
        if max <= 0 {
            return Err(DatastoreError::BadRequest(format!(
                "id allocation maximum must be positive, got {}",
                max
            )));
        }

        // Step 1: Read the counter
        let (_, current) = self.increment(app, 0)?;
        if current >= max {
            return Ok((current + 1, current));
        }

        // Step 2: Bump it by the gap. A concurrent allocation can push the
        // counter further, which only reserves more.
        let (previous, updated) = self.increment(app, max - current)?;
        debug!(app, start = previous + 1, end = updated, "raised id counter");
        Ok((previous + 1, updated))
    }

    /// Make sure none of `ids` is ever handed out by the allocator
    pub fn reserve_ids(&self, app: &str, ids: &[i64]) -> Result<()> {
        match ids.iter().copied().filter(|id| *id > 0).max() {
            Some(max) => self.allocate_max(app, max).map(|_| ()),
            None => Ok(()),
        }
    }

    fn increment(&self, app: &str, amount: i64) -> Result<(i64, i64)> {
        let path = counter_path(app);
        let mut last_error = String::new();

        for attempt in 1..=self.retry.attempts {
            match self.lock.increment_and_get_counter(&path, amount) {
                Ok(values) => return Ok(values),
                Err(LockError::Transient(detail)) => {
                    warn!(app, attempt, detail = %detail, "id counter increment failed, retrying");
                    last_error = detail;
                    if attempt < self.retry.attempts {
                        self.retry.pause();
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(DatastoreError::LockService(format!(
            "id counter for {} unavailable after {} attempts: {}",
            app, self.retry.attempts, last_error
        )))
    }
}

/// Counter node of an application
fn counter_path(app: &str) -> String {
    format!("/{}/ids", app)
}

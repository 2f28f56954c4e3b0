//! Configuration for kindkv
//!
//! Centralized configuration with defaults matching the datastore's
//! historical constants.

use std::thread;
use std::time::Duration;

/// Main configuration for a Datastore instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Lock Configuration
    // -------------------------------------------------------------------------
    /// Retry policy for acquiring entity group locks on non-transactional writes
    pub lock_retry: RetryPolicy,

    // -------------------------------------------------------------------------
    // ID Allocation Configuration
    // -------------------------------------------------------------------------
    /// Retry policy for counter increments against the lock service
    pub id_retry: RetryPolicy,

    /// Largest block a single allocation request may reserve
    pub max_id_block: u64,

    // -------------------------------------------------------------------------
    // Query Configuration
    // -------------------------------------------------------------------------
    /// Upper bound on results returned by one query
    pub max_query_results: usize,

    /// Max filters + orders in one query
    pub max_query_components: usize,

    /// Extra references fetched when a batch holds invalid entries
    pub fetch_padding: usize,

    /// Per-property window size for the zigzag merge join
    pub zigzag_window: usize,

    // -------------------------------------------------------------------------
    // Index Metadata Configuration
    // -------------------------------------------------------------------------
    /// Entities fetched per backfill round when building an index
    pub backfill_batch_size: usize,

    /// Max composite indexes one application can register
    pub max_composite_indexes: usize,
}

/// Fixed-delay retry policy
///
/// `attempts` counts every try, including the first one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    /// Retry `attempts` times with a fixed `delay` between tries
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// A single attempt, no retries
    pub fn none() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Sleep between two attempts
    pub fn pause(&self) {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(5, Duration::from_millis(500))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lock_retry: RetryPolicy::default(),
            id_retry: RetryPolicy::default(),
            max_id_block: 1_000_000,
            max_query_results: 10_000,
            max_query_components: 63,
            fetch_padding: 5,
            zigzag_window: 1_000,
            backfill_batch_size: 100,
            max_composite_indexes: 1_000,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the lock acquisition retry policy
    pub fn lock_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.lock_retry = policy;
        self
    }

    /// Set the ID allocation retry policy
    pub fn id_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.id_retry = policy;
        self
    }

    /// Set the largest ID block one request may allocate
    pub fn max_id_block(mut self, size: u64) -> Self {
        self.config.max_id_block = size;
        self
    }

    /// Set the maximum number of results per query
    pub fn max_query_results(mut self, count: usize) -> Self {
        self.config.max_query_results = count;
        self
    }

    /// Set the maximum number of filter and order components
    pub fn max_query_components(mut self, count: usize) -> Self {
        self.config.max_query_components = count;
        self
    }

    /// Set the re-fetch padding
    pub fn fetch_padding(mut self, count: usize) -> Self {
        self.config.fetch_padding = count;
        self
    }

    /// Set the zigzag merge join window
    pub fn zigzag_window(mut self, size: usize) -> Self {
        self.config.zigzag_window = size.max(1);
        self
    }

    /// Set the index backfill batch size
    pub fn backfill_batch_size(mut self, size: usize) -> Self {
        self.config.backfill_batch_size = size.max(1);
        self
    }

    /// Set the composite index limit per application
    pub fn max_composite_indexes(mut self, count: usize) -> Self {
        self.config.max_composite_indexes = count;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

//! Query engine: validation, strategy selection and result shaping

use std::sync::Arc;

use tracing::debug;

use crate::config::Config;
use crate::error::{DatastoreError, Result};
use crate::model::{Entity, Property};
use crate::schema::{CompositeIndex, IndexManager};
use crate::store::BatchStore;
use crate::txn::TransactionManager;

use super::composite::CompositeStrategy;
use super::fetch::projected;
use super::kind::KindStrategy;
use super::plan::{
    find_index_to_use, normalize, validate, IndexChoice, Outcome, Plan, QueryContext, QueryStrategy,
};
use super::single::SinglePropertyStrategy;
use super::zigzag::ZigZagStrategy;
use super::{Cursor, Query, QueryResult};

/// Strategies in the order they are offered a query
const STRATEGIES: [&dyn QueryStrategy; 4] = [
    &CompositeStrategy,
    &KindStrategy,
    &SinglePropertyStrategy,
    &ZigZagStrategy,
];

/// Runs queries against the index tables
pub struct QueryEngine {
    store: Arc<dyn BatchStore>,
    txn: Arc<TransactionManager>,
    indexes: Arc<IndexManager>,
    config: Config,
}

impl QueryEngine {
    pub fn new(
        store: Arc<dyn BatchStore>,
        txn: Arc<TransactionManager>,
        indexes: Arc<IndexManager>,
        config: Config,
    ) -> Self {
        Self {
            store,
            txn,
            indexes,
            config,
        }
    }

    /// Execute a query.
    ///
    /// Queries inside a transaction lock the ancestor's entity group first,
    /// so they read the group as the transaction sees it.
    pub fn run(&self, query: &Query) -> Result<QueryResult> {
        // Step 1: Validate and normalize
        validate(query, &self.config)?;
        let plan = normalize(query, &self.config);

        // Step 2: Lock the group for transactional reads
        if let (Some(txn), Some(ancestor)) = (query.transaction, &query.ancestor) {
            self.txn
                .acquire_locks_for_trans(&query.app, std::slice::from_ref(ancestor), txn)?;
        }

        // Step 3: Resolve the composite index
        let (index, building) = self.resolve_index(&plan)?;
        let ctx = QueryContext {
            store: self.store.as_ref(),
            txn: self.txn.as_ref(),
            config: &self.config,
            index: index.as_ref(),
        };

        // Step 4: First strategy that accepts the query
        for strategy in STRATEGIES {
            if let Some(outcome) = strategy.execute(&ctx, &plan)? {
                debug!(
                    app = %query.app,
                    strategy = strategy.name(),
                    plan = %plan,
                    found = outcome.candidates.len(),
                    "query executed"
                );
                return Ok(finish(&plan, outcome));
            }
        }

        Err(match building {
            Some(id) => DatastoreError::NeedsIndex(format!(
                "composite index {} covering this query is still building",
                id
            )),
            None => DatastoreError::NeedsIndex(format!(
                "no index can serve the query ({})",
                plan
            )),
        })
    }

    /// The composite index to offer strategies, plus the id of a matching
    /// index that is not ready yet
    fn resolve_index(&self, plan: &Plan<'_>) -> Result<(Option<CompositeIndex>, Option<u64>)> {
        let app = &plan.query.app;
        match plan.query.composite_index {
            Some(id) => match self.indexes.get_composite_index(app, id)? {
                None => Err(DatastoreError::BadRequest(format!(
                    "no composite index {} for {}",
                    id, app
                ))),
                Some(index) if !index.is_queryable() => Ok((None, Some(id))),
                Some(index) => Ok((Some(index), None)),
            },
            None => match find_index_to_use(plan, &self.indexes.list_composite_indexes(app)?) {
                IndexChoice::Use(index) => Ok((Some(index), None)),
                IndexChoice::Building(id) => Ok((None, Some(id))),
                IndexChoice::None => Ok((None, None)),
            },
        }
    }
}

/// Apply offset and limit, build the cursor and shape the entities
fn finish(plan: &Plan<'_>, outcome: Outcome) -> QueryResult {
    let query = plan.query;
    let mut candidates = outcome.candidates;

    let page_end = query.offset.saturating_add(plan.limit);
    let more_results = candidates.len() > page_end;
    candidates.truncate(page_end);

    let cursor = candidates.last().map(|c| Cursor {
        last_key: c.entity.key.clone(),
        values: c.values.clone(),
    });
    let skipped = query.offset.min(candidates.len());

    let entities = candidates
        .into_iter()
        .skip(skipped)
        .map(|candidate| {
            if query.keys_only {
                Entity::new(candidate.entity.key)
            } else if !query.projection.is_empty() {
                let properties = projected(plan, &candidate)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(name, value)| Property { name, value })
                    .collect();
                Entity {
                    key: candidate.entity.key,
                    properties,
                }
            } else {
                candidate.entity
            }
        })
        .collect();

    QueryResult {
        entities,
        cursor,
        more_results,
        skipped,
        strategy: outcome.strategy,
    }
}

//! Composite index queries
//!
//! Equality filters fix the leading index values, the inequality filter
//! bounds the next one, and the index order provides the sort. Projected
//! values come from the row key, after the referenced entity is resolved
//! to its committed version and checked against the row.

use crate::codec::{
    composite_key, composite_prefix, encode_path, encode_value_directed, entity_key, split_composite_key,
    KEY_DELIMITER,
};
use crate::error::{DatastoreError, Result};
use crate::model::{Entity, Key, PropertyValue, KEY_PROPERTY};
use crate::schema::CompositeIndex;
use crate::store::{ScanRange, Table};

use super::fetch::{equality_prefix, fetch_validated, first_in_range, resume_after, value_range, RowSource, Scan};
use super::plan::{index_fit, Candidate, Outcome, Plan, QueryContext, QueryStrategy};
use super::StrategyKind;

/// Scans the composite index resolved for the query
pub(crate) struct CompositeStrategy;

impl QueryStrategy for CompositeStrategy {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn execute(&self, ctx: &QueryContext<'_>, plan: &Plan<'_>) -> Result<Option<Outcome>> {
        let Some(index) = ctx.index else {
            return Ok(None);
        };
        if index_fit(plan, index).is_none() {
            return Ok(None);
        }

        let range = index_range(plan, index);
        let range = match &plan.query.cursor {
            Some(cursor) => resume_after(range, cursor_key(ctx, plan, index, &cursor.last_key, &cursor.values)?),
            None => range,
        };

        let candidates = fetch_entities(ctx, plan, index, range)?;
        Ok(Some(Outcome {
            candidates,
            strategy: StrategyKind::Composite,
        }))
    }
}

// =============================================================================
// Ranges
// =============================================================================

/// Prefix up to (and excluding) the index values
fn index_base(plan: &Plan<'_>, index: &CompositeIndex) -> Vec<u8> {
    let query = plan.query;
    let mut base = composite_prefix(&query.app, &query.namespace, index.id);
    if let (true, Some(ancestor)) = (index.definition.ancestor, &query.ancestor) {
        base.extend_from_slice(&encode_path(&ancestor.path));
        base.push(KEY_DELIMITER);
    }
    base
}

/// Equality values narrow the prefix in index order; the first
/// non-equality property takes the inequality bounds
fn index_range(plan: &Plan<'_>, index: &CompositeIndex) -> ScanRange {
    let mut base = index_base(plan, index);
    let properties = &index.definition.properties;

    let mut position = 0;
    while let Some(property) = properties.get(position) {
        if !plan.is_equality_only(&property.name) {
            break;
        }
        let Some(value) = plan.equality_value(&property.name) else {
            break;
        };
        base = equality_prefix(&base, value, property.direction);
        position += 1;
    }

    match properties.get(position) {
        Some(property) if plan.inequality.as_deref() == Some(property.name.as_str()) => {
            value_range(&base, &plan.bounds(&property.name), property.direction)
        }
        _ => ScanRange::prefix(&base),
    }
}

/// Full composite row key of the cursor entity
fn cursor_key(
    ctx: &QueryContext<'_>,
    plan: &Plan<'_>,
    index: &CompositeIndex,
    last_key: &Key,
    values: &[(String, PropertyValue)],
) -> Result<Vec<u8>> {
    let query = plan.query;
    let properties = &index.definition.properties;

    let recorded: Option<Vec<PropertyValue>> = properties
        .iter()
        .map(|p| values.iter().find(|(name, _)| *name == p.name).map(|(_, v)| v.clone()))
        .collect();
    let tuple = match recorded {
        Some(tuple) => tuple,
        None => {
            // Re-read the entity for the missing index values
            let fetched = ctx
                .txn
                .validated_entities(&query.app, &[entity_key(last_key)], query.transaction)?;
            let entity = fetched.into_iter().flatten().next().ok_or_else(|| {
                DatastoreError::BadRequest(format!("cursor entity {} no longer exists", last_key))
            })?;
            properties
                .iter()
                .map(|p| index_value(&entity, &p.name))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| {
                    DatastoreError::BadRequest(format!("cursor entity {} is not in the index", last_key))
                })?
        }
    };

    let encoded: Vec<Vec<u8>> = tuple
        .iter()
        .zip(properties)
        .map(|(value, property)| encode_value_directed(value, property.direction))
        .collect();
    let prefix = composite_prefix(&query.app, &query.namespace, index.id);
    let ancestor = match (index.definition.ancestor, &query.ancestor) {
        (true, Some(ancestor)) => Some(ancestor.path.as_slice()),
        _ => None,
    };
    Ok(composite_key(&prefix, ancestor, &encoded, &last_key.path))
}

fn index_value(entity: &Entity, name: &str) -> Option<PropertyValue> {
    if name == KEY_PROPERTY {
        return Some(PropertyValue::Key(entity.key.clone()));
    }
    entity.get(name).cloned()
}

// =============================================================================
// Execution
// =============================================================================

/// Fetch referenced entities, keeping for each the row of its first value
/// tuple in range. Rows holding values the entity no longer has are stale.
///
/// The entity's in-range values per property are independent, so the first
/// tuple takes the first value at every position.
fn fetch_entities(
    ctx: &QueryContext<'_>,
    plan: &Plan<'_>,
    index: &CompositeIndex,
    range: ScanRange,
) -> Result<Vec<Candidate>> {
    let directions = index.directions();
    let scan = Scan {
        table: Table::Composite,
        range,
        source: RowSource::Reference,
    };
    fetch_validated(ctx, plan, scan, &mut |row_key: &[u8], entity: &Entity| {
        let parts = split_composite_key(row_key, &directions, index.definition.ancestor)?;
        let mut values = Vec::with_capacity(parts.values.len());
        let tokens = parts.values.into_iter().zip(parts.encoded_values);
        for (property, (value, encoded)) in index.definition.properties.iter().zip(tokens) {
            let first = if property.name == KEY_PROPERTY {
                value == PropertyValue::Key(entity.key.clone())
            } else {
                first_in_range(plan, entity, &property.name, property.direction).as_deref() == Some(encoded.as_slice())
            };
            if !first {
                return Ok(None);
            }
            values.push((property.name.clone(), value));
        }
        Ok(Some(values))
    })
}

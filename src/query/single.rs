//! Single-property queries
//!
//! Filters and orders on one property are answered by a contiguous range
//! of the ascending or descending property table.

use crate::codec::{
    decode_value_directed, encode_path, encode_value_directed, entity_key, property_prefix, split_index_key,
    KEY_DELIMITER,
};
use crate::error::{DatastoreError, Result};
use crate::model::{Entity, Key, PropertyValue};
use crate::store::{ScanRange, Table};

use super::fetch::{
    equality_prefix, fetch_validated, first_in_range, key_filter_range, resume_after, value_range, RowSource, Scan,
};
use super::plan::{Outcome, Plan, QueryContext, QueryStrategy};
use super::StrategyKind;

/// Scans the property table of the only property a query mentions
pub(crate) struct SinglePropertyStrategy;

impl QueryStrategy for SinglePropertyStrategy {
    fn name(&self) -> &'static str {
        "single_property"
    }

    fn execute(&self, ctx: &QueryContext<'_>, plan: &Plan<'_>) -> Result<Option<Outcome>> {
        let query = plan.query;
        let Some(kind) = query.kind.as_deref() else {
            return Ok(None);
        };
        let properties = plan.referenced_properties();
        if properties.len() != 1 || plan.has_key_orders() {
            return Ok(None);
        }
        let Some(property) = properties.into_iter().next() else {
            return Ok(None);
        };
        let direction = plan.direction_of(property);
        let base = property_prefix(&query.app, &query.namespace, kind, property);

        // Step 1: Range from the filters. Equality narrows to one value,
        // under which rows sort by path, so ancestor and key filters apply
        // there; otherwise neither can.
        let range = match plan.equality_value(property) {
            Some(value) => {
                let prefix = equality_prefix(&base, value, direction);
                let scoped = match &query.ancestor {
                    Some(ancestor) => {
                        let mut scoped = prefix.clone();
                        scoped.extend_from_slice(&encode_path(&ancestor.path));
                        ScanRange::prefix(&scoped)
                    }
                    None => ScanRange::prefix(&prefix),
                };
                key_filter_range(scoped, &prefix, plan.key_filters())
            }
            None => {
                if query.ancestor.is_some() || !plan.key_filters().is_empty() {
                    return Ok(None);
                }
                value_range(&base, &plan.bounds(property), direction)
            }
        };

        // Step 2: Resume after the cursor
        let range = match &query.cursor {
            Some(cursor) => {
                let value = match cursor.value(property) {
                    Some(value) => value.clone(),
                    None => cursor_value(ctx, plan, &cursor.last_key, property)?,
                };
                let mut start = base.clone();
                start.extend_from_slice(&encode_value_directed(&value, direction));
                start.push(KEY_DELIMITER);
                start.extend_from_slice(&encode_path(&cursor.last_key.path));
                resume_after(range, start)
            }
            None => range,
        };

        // Step 3: Fetch, keeping the row of the entity's first value in
        // range. Stale rows hold values the entity no longer has.
        let scan = Scan {
            table: Table::property(direction),
            range,
            source: RowSource::Reference,
        };
        let name = property.to_string();
        let candidates = fetch_validated(ctx, plan, scan, &mut |row_key: &[u8], entity: &Entity| {
            let parts = split_index_key(row_key)?;
            if first_in_range(plan, entity, &name, direction).as_deref() != Some(parts.value.as_slice()) {
                return Ok(None);
            }
            let value = decode_value_directed(&parts.value, direction)?;
            Ok(Some(vec![(name.clone(), value)]))
        })?;

        Ok(Some(Outcome {
            candidates,
            strategy: StrategyKind::SingleProperty,
        }))
    }
}

/// Cursor value of a property, read from the entity the cursor points at
fn cursor_value(
    ctx: &QueryContext<'_>,
    plan: &Plan<'_>,
    last_key: &Key,
    property: &str,
) -> Result<PropertyValue> {
    let query = plan.query;
    let fetched = ctx
        .txn
        .validated_entities(&query.app, &[entity_key(last_key)], query.transaction)?;
    fetched
        .into_iter()
        .flatten()
        .next()
        .and_then(|entity| entity.get(property).cloned())
        .ok_or_else(|| {
            DatastoreError::BadRequest(format!(
                "cursor entity {} no longer has property {}",
                last_key, property
            ))
        })
}

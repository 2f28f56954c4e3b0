//! Kindless, kind and ancestor queries
//!
//! Queries with no property filters are answered from the entity table
//! (kindless and ancestor queries) or the kind table. Ancestor queries with
//! sort orders collect the whole entity group and sort in memory.

use std::cmp::Ordering;

use crate::codec::{encode_path, encode_value, entity_key, entity_prefix, kind_key, kind_prefix, Direction};
use crate::error::Result;
use crate::model::{Entity, Key, PropertyValue, KEY_PROPERTY};
use crate::store::{decode_rows, EntityRow, ScanRange, Table};

use super::fetch::{fetch_validated, intersect, key_filter_range, resume_after, Dedup, RowSource, Scan};
use super::plan::{Candidate, Outcome, Plan, QueryContext, QueryStrategy};
use super::StrategyKind;

/// Answers queries that filter on nothing but `__key__`
pub(crate) struct KindStrategy;

impl QueryStrategy for KindStrategy {
    fn name(&self) -> &'static str {
        "kind"
    }

    fn execute(&self, ctx: &QueryContext<'_>, plan: &Plan<'_>) -> Result<Option<Outcome>> {
        if !plan.filtered_properties().is_empty() {
            return Ok(None);
        }
        let query = plan.query;

        match (&query.kind, &query.ancestor) {
            (_, Some(ancestor)) if !plan.orders.is_empty() => {
                ordered_ancestor(ctx, plan, ancestor).map(Some)
            }
            _ if !plan.orders.is_empty() => Ok(None),
            (None, None) => kindless(ctx, plan).map(Some),
            (_, Some(ancestor)) => ancestor_scan(ctx, plan, ancestor).map(Some),
            (Some(kind), None) => kind_scan(ctx, plan, kind).map(Some),
        }
    }
}

fn kindless(ctx: &QueryContext<'_>, plan: &Plan<'_>) -> Result<Outcome> {
    let query = plan.query;
    let base = entity_prefix(&query.app, &query.namespace);
    let mut range = key_filter_range(ScanRange::prefix(&base), &base, plan.key_filters());
    if let Some(cursor) = &query.cursor {
        range = resume_after(range, entity_key(&cursor.last_key));
    }

    let scan = Scan {
        table: Table::Entity,
        range,
        source: RowSource::Entity,
    };
    let candidates = fetch_validated(ctx, plan, scan, &mut |_, _| Ok(Some(Vec::new())))?;
    Ok(Outcome {
        candidates,
        strategy: StrategyKind::Kindless,
    })
}

fn ancestor_scan(ctx: &QueryContext<'_>, plan: &Plan<'_>, ancestor: &Key) -> Result<Outcome> {
    let query = plan.query;
    let mut range = ancestor_range(plan, ancestor);
    if let Some(cursor) = &query.cursor {
        range = resume_after(range, entity_key(&cursor.last_key));
    }

    let kind = query.kind.clone();
    let scan = Scan {
        table: Table::Entity,
        range,
        source: RowSource::Entity,
    };
    let candidates = fetch_validated(ctx, plan, scan, &mut |_, entity: &Entity| {
        Ok(kind_matches(kind.as_deref(), entity).then(Vec::new))
    })?;
    Ok(Outcome {
        candidates,
        strategy: StrategyKind::Ancestor,
    })
}

fn kind_scan(ctx: &QueryContext<'_>, plan: &Plan<'_>, kind: &str) -> Result<Outcome> {
    let query = plan.query;
    let base = kind_prefix(&query.app, &query.namespace, kind);
    let mut range = key_filter_range(ScanRange::prefix(&base), &base, plan.key_filters());
    if let Some(cursor) = &query.cursor {
        range = resume_after(range, kind_key(&cursor.last_key));
    }

    let scan = Scan {
        table: Table::Kind,
        range,
        source: RowSource::Reference,
    };
    let candidates = fetch_validated(ctx, plan, scan, &mut |_, _| Ok(Some(Vec::new())))?;
    Ok(Outcome {
        candidates,
        strategy: StrategyKind::Kind,
    })
}

/// Entity table range covering the ancestor and its descendants
fn ancestor_range(plan: &Plan<'_>, ancestor: &Key) -> ScanRange {
    let base = entity_prefix(&plan.query.app, &plan.query.namespace);
    let mut prefix = base.clone();
    prefix.extend_from_slice(&encode_path(&ancestor.path));
    let scoped = ScanRange::prefix(&prefix);
    let filtered = key_filter_range(ScanRange::prefix(&base), &base, plan.key_filters());
    intersect(&scoped, &filtered)
}

fn kind_matches(kind: Option<&str>, entity: &Entity) -> bool {
    kind.map(|kind| entity.key.kind() == kind).unwrap_or(true)
}

// =============================================================================
// Ordered Ancestor Queries
// =============================================================================

/// Sort key of an entity: one component per order, then its row key
struct SortKey {
    components: Vec<Vec<u8>>,
    row_key: Vec<u8>,
}

fn ordered_ancestor(ctx: &QueryContext<'_>, plan: &Plan<'_>, ancestor: &Key) -> Result<Outcome> {
    let query = plan.query;

    // Step 1: Collect every matching entity of the group
    let mut range = ancestor_range(plan, ancestor);
    let page = ctx.config.max_query_results.max(1);
    let mut entities = Vec::new();
    loop {
        let rows = ctx.store.range_query(Table::Entity, &range, page, 0)?;
        let Some((last_key, _)) = rows.last() else {
            break;
        };
        let next = range.resume_at(last_key.clone(), false);
        let exhausted = rows.len() < page;

        let pairs: Vec<(Vec<u8>, Option<EntityRow>)> = decode_rows::<EntityRow>(rows)?
            .into_iter()
            .map(|(key, row)| (key, Some(row)))
            .collect();
        for entity in ctx.txn.validated_result(&query.app, &pairs, query.transaction)? {
            let Some(entity) = entity else {
                continue;
            };
            if kind_matches(query.kind.as_deref(), &entity) && plan.matches(&entity) {
                entities.push(entity);
            }
        }

        if exhausted {
            break;
        }
        range = next;
    }

    // Step 2: Sort; entities missing an ordered property are left out
    let mut keyed: Vec<(SortKey, Candidate)> = entities
        .into_iter()
        .filter_map(|entity| {
            let (components, values) = sort_components(plan, &entity)?;
            let key = SortKey {
                components,
                row_key: entity_key(&entity.key),
            };
            Some((key, Candidate { entity, values }))
        })
        .collect();
    keyed.sort_by(|(a, _), (b, _)| compare(plan, a, b));

    // Step 3: Position after the cursor
    if let Some(cursor) = &query.cursor {
        let position = match cursor_sort_key(plan, &cursor.last_key, &cursor.values) {
            Some(cursor_key) => keyed
                .iter()
                .position(|(key, _)| compare(plan, key, &cursor_key) == Ordering::Greater)
                .unwrap_or(keyed.len()),
            None => keyed
                .iter()
                .position(|(_, c)| c.entity.key == cursor.last_key)
                .map(|p| p + 1)
                .unwrap_or(0),
        };
        keyed.drain(..position);
    }

    // Step 4: Distinct and projection presence, then cut to size
    let mut dedup = Dedup::new(plan);
    let candidates: Vec<Candidate> = keyed
        .into_iter()
        .map(|(key, candidate)| (key.row_key, candidate))
        .filter(|(row_key, candidate)| dedup.admit(row_key, candidate))
        .map(|(_, candidate)| candidate)
        .take(plan.want)
        .collect();

    Ok(Outcome {
        candidates,
        strategy: StrategyKind::OrderedAncestor,
    })
}

/// Per-order components: the smallest value for ascending orders, the
/// largest for descending ones
fn sort_components(plan: &Plan<'_>, entity: &Entity) -> Option<(Vec<Vec<u8>>, Vec<(String, PropertyValue)>)> {
    let mut components = Vec::with_capacity(plan.orders.len());
    let mut values = Vec::with_capacity(plan.orders.len());
    for order in &plan.orders {
        if order.property == KEY_PROPERTY {
            components.push(entity_key(&entity.key));
            continue;
        }
        let encoded = entity.values(&order.property).map(|v| (encode_value(v), v));
        let chosen = match order.direction {
            Direction::Ascending => encoded.min_by(|a, b| a.0.cmp(&b.0)),
            Direction::Descending => encoded.max_by(|a, b| a.0.cmp(&b.0)),
        }?;
        components.push(chosen.0);
        values.push((order.property.clone(), chosen.1.clone()));
    }
    Some((components, values))
}

fn cursor_sort_key(plan: &Plan<'_>, last_key: &Key, values: &[(String, PropertyValue)]) -> Option<SortKey> {
    let mut components = Vec::with_capacity(plan.orders.len());
    for order in &plan.orders {
        if order.property == KEY_PROPERTY {
            components.push(entity_key(last_key));
            continue;
        }
        let value = values
            .iter()
            .find(|(name, _)| *name == order.property)
            .map(|(_, value)| value)?;
        components.push(encode_value(value));
    }
    Some(SortKey {
        components,
        row_key: entity_key(last_key),
    })
}

fn compare(plan: &Plan<'_>, a: &SortKey, b: &SortKey) -> Ordering {
    for (position, order) in plan.orders.iter().enumerate() {
        let ordering = a.components[position].cmp(&b.components[position]);
        let ordering = match order.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a.row_key.cmp(&b.row_key)
}

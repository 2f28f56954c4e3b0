//! Reference resolution and key range helpers shared by every strategy

use std::collections::HashSet;

use tracing::debug;

use crate::codec::{encode_path, encode_value, encode_value_directed, Direction, KEY_DELIMITER, TERMINATOR};
use crate::error::{DatastoreError, Result};
use crate::model::{Entity, PropertyValue};
use crate::store::{decode_rows, EntityRow, ReferenceRow, ScanRange, Table};

use super::plan::{Candidate, FilterOp, Plan, QueryContext, ValueBounds};
use super::Operator;

// =============================================================================
// Fetch and Validate
// =============================================================================

/// What the rows of a scanned table hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RowSource {
    /// Entity rows, read directly
    Entity,
    /// Index rows pointing at entity row keys
    Reference,
}

/// One ordered scan over a table
#[derive(Debug, Clone)]
pub(crate) struct Scan {
    pub table: Table,
    pub range: ScanRange,
    pub source: RowSource,
}

/// Checks an index row against the entity it references. Returns the index
/// values to remember for cursors, or `None` when the row is stale.
pub(crate) type EntryCheck<'f> =
    dyn FnMut(&[u8], &Entity) -> Result<Option<Vec<(String, PropertyValue)>>> + 'f;

/// Scan `scan` until `plan.want` valid entities are collected or the range
/// is exhausted.
///
/// Index rows may outlive the entity version they were written for, so
/// every referenced entity is fetched, resolved to its committed version and
/// checked. When a batch holds invalid rows the next request asks for the
/// missing count plus a padding, starting just past the last row seen.
pub(crate) fn fetch_validated(
    ctx: &QueryContext<'_>,
    plan: &Plan<'_>,
    scan: Scan,
    check: &mut EntryCheck<'_>,
) -> Result<Vec<Candidate>> {
    let app = plan.query.app.as_str();
    let txn = plan.query.transaction;
    let want = plan.want;

    let mut results = Vec::new();
    let mut dedup = Dedup::new(plan);
    let mut range = scan.range;
    let mut request = want;
    let mut previous_start: Option<Vec<u8>> = None;

    while results.len() < want {
        let rows = ctx.store.range_query(scan.table, &range, request, 0)?;
        let last_key = match rows.last() {
            Some((key, _)) => key.clone(),
            None => break,
        };
        if previous_start.as_deref() == Some(last_key.as_slice()) {
            return Err(DatastoreError::DataInconsistency(format!(
                "scan over {:?} returned its exclusive start key again",
                scan.table
            )));
        }
        let exhausted = rows.len() < request;

        // Step 1: Resolve the referenced entities
        let (row_keys, references, entities) = match scan.source {
            RowSource::Entity => {
                let rows = decode_rows::<EntityRow>(rows)?;
                let pairs: Vec<(Vec<u8>, Option<EntityRow>)> =
                    rows.into_iter().map(|(key, row)| (key, Some(row))).collect();
                let entities = ctx.txn.validated_result(app, &pairs, txn)?;
                let keys: Vec<Vec<u8>> = pairs.into_iter().map(|(key, _)| key).collect();
                (keys.clone(), keys, entities)
            }
            RowSource::Reference => {
                let rows = decode_rows::<ReferenceRow>(rows)?;
                let (keys, references): (Vec<Vec<u8>>, Vec<Vec<u8>>) =
                    rows.into_iter().map(|(key, row)| (key, row.reference)).unzip();
                let entities = ctx.txn.validated_entities(app, &references, txn)?;
                (keys, references, entities)
            }
        };

        // Step 2: Keep rows that still describe their entity
        let mut valid = 0;
        for ((row_key, reference), entity) in row_keys.iter().zip(references).zip(entities) {
            let Some(entity) = entity else {
                continue;
            };
            let Some(values) = check(row_key, &entity)? else {
                continue;
            };
            if !plan.matches(&entity) {
                continue;
            }
            let candidate = Candidate { entity, values };
            if !dedup.admit(&reference, &candidate) {
                continue;
            }
            valid += 1;
            results.push(candidate);
            if results.len() >= want {
                break;
            }
        }

        if exhausted || results.len() >= want {
            break;
        }
        if valid < request {
            debug!(
                table = ?scan.table,
                invalid = request - valid,
                "skipping stale or filtered index rows"
            );
        }
        request = want - results.len() + ctx.config.fetch_padding;
        previous_start = Some(last_key.clone());
        range = range.resume_at(last_key, false);
    }

    Ok(results)
}

/// Stored encoding of the entity's first value of `name` inside the scanned
/// range, in scan order.
///
/// A repeated property has one index row per value. Only the row at this
/// position is admitted, so a scan, and every page resumed from a cursor
/// taken during it, sees the entity once.
pub(crate) fn first_in_range(
    plan: &Plan<'_>,
    entity: &Entity,
    name: &str,
    direction: Direction,
) -> Option<Vec<u8>> {
    entity
        .values(name)
        .filter(|value| plan.in_scan_range(name, value))
        .map(|value| encode_value_directed(value, direction))
        .min()
}

// =============================================================================
// Projection and Distinct
// =============================================================================

/// Values of the projected properties, in projection order.
///
/// Index values found by the scan win over the entity's first value, so a
/// projection on the scanned property reports the value it matched on.
/// `None` when the entity lacks a projected property.
pub(crate) fn projected(plan: &Plan<'_>, candidate: &Candidate) -> Option<Vec<(String, PropertyValue)>> {
    plan.query
        .projection
        .iter()
        .map(|name| {
            let value = candidate
                .values
                .iter()
                .find(|(property, _)| property == name)
                .map(|(_, value)| value)
                .or_else(|| candidate.entity.get(name))?;
            Some((name.clone(), value.clone()))
        })
        .collect()
}

/// Drops repeated entities and, for distinct queries, repeated projections
pub(crate) struct Dedup {
    keys: HashSet<Vec<u8>>,
    projections: HashSet<Vec<u8>>,
    projection: Vec<String>,
    distinct: bool,
}

impl Dedup {
    pub fn new(plan: &Plan<'_>) -> Self {
        Self {
            keys: HashSet::new(),
            projections: HashSet::new(),
            projection: plan.query.projection.clone(),
            distinct: plan.query.distinct,
        }
    }

    /// Whether a candidate found under `reference` joins the results
    pub fn admit(&mut self, reference: &[u8], candidate: &Candidate) -> bool {
        if self.keys.contains(reference) {
            return false;
        }
        if !self.projection.is_empty() {
            let mut signature = Vec::new();
            for name in &self.projection {
                let value = candidate
                    .values
                    .iter()
                    .find(|(property, _)| property == name)
                    .map(|(_, value)| value)
                    .or_else(|| candidate.entity.get(name));
                match value {
                    Some(value) => {
                        signature.extend_from_slice(&encode_value(value));
                        signature.push(KEY_DELIMITER);
                    }
                    None => return false,
                }
            }
            if self.distinct && !self.projections.insert(signature) {
                return false;
            }
        }
        self.keys.insert(reference.to_vec());
        true
    }
}

// =============================================================================
// Key Ranges
// =============================================================================

/// Range over the value component following `base`, bounded by `bounds`.
///
/// Descending tables store reverse-lexed values, so the value bounds swap
/// ends there.
pub(crate) fn value_range(base: &[u8], bounds: &ValueBounds, direction: Direction) -> ScanRange {
    let at = |value: &PropertyValue, past: bool| {
        let mut key = base.to_vec();
        key.extend_from_slice(&encode_value_directed(value, direction));
        if past {
            key.extend_from_slice(TERMINATOR);
        }
        key
    };

    let (low, high) = match direction {
        Direction::Ascending => (&bounds.lower, &bounds.upper),
        Direction::Descending => (&bounds.upper, &bounds.lower),
    };
    let start = match low {
        Some((value, inclusive)) => at(value, !inclusive),
        None => base.to_vec(),
    };
    let end = match high {
        Some((value, inclusive)) => at(value, *inclusive),
        None => {
            let mut end = base.to_vec();
            end.extend_from_slice(TERMINATOR);
            end
        }
    };
    ScanRange::new(start, end)
}

/// Rows whose value component equals `value`
pub(crate) fn equality_prefix(base: &[u8], value: &PropertyValue, direction: Direction) -> Vec<u8> {
    let mut prefix = base.to_vec();
    prefix.extend_from_slice(&encode_value_directed(value, direction));
    prefix.push(KEY_DELIMITER);
    prefix
}

/// Narrow a scan over `base + path` keys with `__key__` filters
pub(crate) fn key_filter_range(range: ScanRange, base: &[u8], filters: &[FilterOp]) -> ScanRange {
    let mut range = range;
    for filter in filters {
        let PropertyValue::Key(key) = &filter.value else {
            continue;
        };
        let mut bound = base.to_vec();
        bound.extend_from_slice(&encode_path(&key.path));
        let narrowed = match filter.op {
            Operator::Equal => ScanRange::new(bound.clone(), bound),
            Operator::GreaterThan => ScanRange {
                start_inclusive: false,
                ..ScanRange::new(bound, range.end.clone())
            },
            Operator::GreaterThanOrEqual => ScanRange::new(bound, range.end.clone()),
            Operator::LessThan => ScanRange {
                end_inclusive: false,
                ..ScanRange::new(range.start.clone(), bound)
            },
            Operator::LessThanOrEqual => ScanRange::new(range.start.clone(), bound),
        };
        range = intersect(&range, &narrowed);
    }
    range
}

/// Intersection of two ranges
pub(crate) fn intersect(a: &ScanRange, b: &ScanRange) -> ScanRange {
    let (start, start_inclusive) = if a.start > b.start {
        (a.start.clone(), a.start_inclusive)
    } else if b.start > a.start {
        (b.start.clone(), b.start_inclusive)
    } else {
        (a.start.clone(), a.start_inclusive && b.start_inclusive)
    };
    let (end, end_inclusive) = if a.end < b.end {
        (a.end.clone(), a.end_inclusive)
    } else if b.end < a.end {
        (b.end.clone(), b.end_inclusive)
    } else {
        (a.end.clone(), a.end_inclusive && b.end_inclusive)
    };
    ScanRange {
        start,
        end,
        start_inclusive,
        end_inclusive,
    }
}

/// Resume a range just past `key`, unless the range already starts later
pub(crate) fn resume_after(range: ScanRange, key: Vec<u8>) -> ScanRange {
    if key >= range.start {
        range.resume_at(key, false)
    } else {
        range
    }
}

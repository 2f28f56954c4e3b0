//! Zigzag merge join
//!
//! Answers queries with equality filters on several properties by walking
//! one ascending-table range per filter in path order and keeping the paths
//! every range contains.
//!
//! ```text
//!  color=red   : A1 ─ A4 ─────── A9 ─ B2
//!  size=large  : A2 ─ A4 ─ A7 ───────── B2
//!                     ▲                  ▲
//!                  match              match
//! ```
//!
//! Each range reads fixed-size windows. When one range is behind, it jumps
//! straight to the largest path seen so far instead of reading through the
//! gap, so the join stays complete while skipping ranges that cannot
//! intersect.

use std::collections::VecDeque;

use crate::codec::{encode_path, entity_prefix, property_prefix, Direction};
use crate::error::Result;
use crate::store::{BatchStore, ScanRange, Table};

use super::fetch::{equality_prefix, Dedup};
use super::plan::{Candidate, Outcome, Plan, QueryContext, QueryStrategy};
use super::StrategyKind;

/// Intersects per-property equality scans
pub(crate) struct ZigZagStrategy;

impl QueryStrategy for ZigZagStrategy {
    fn name(&self) -> &'static str {
        "zigzag"
    }

    fn execute(&self, ctx: &QueryContext<'_>, plan: &Plan<'_>) -> Result<Option<Outcome>> {
        let query = plan.query;
        let Some(kind) = query.kind.as_deref() else {
            return Ok(None);
        };
        let properties = plan.filtered_properties();
        if properties.len() < 2
            || plan.inequality.is_some()
            || !plan.orders.is_empty()
            || !properties.iter().all(|name| plan.is_equality_only(name))
        {
            return Ok(None);
        }

        // Step 1: One range per property over its first equality value
        let mut ranges = Vec::with_capacity(properties.len());
        for name in &properties {
            let Some(value) = plan.equality_value(name) else {
                return Ok(None);
            };
            let base = property_prefix(&query.app, &query.namespace, kind, name);
            let prefix = equality_prefix(&base, value, Direction::Ascending);
            let mut scoped = prefix.clone();
            if let Some(ancestor) = &query.ancestor {
                scoped.extend_from_slice(&encode_path(&ancestor.path));
            }
            ranges.push(RangeIterator::new(
                ctx.store,
                prefix,
                ScanRange::prefix(&scoped),
                ctx.config.zigzag_window,
            ));
        }
        if let Some(cursor) = &query.cursor {
            let path = encode_path(&cursor.last_key.path);
            for range in ranges.iter_mut() {
                range.set_cursor(&path, false);
            }
        }

        // Step 2: Join, then fetch and check the common references
        let entities_base = entity_prefix(&query.app, &query.namespace);
        let mut dedup = Dedup::new(plan);
        let mut candidates = Vec::new();
        let mut request = plan.want;
        while candidates.len() < plan.want {
            let paths = common_paths(&mut ranges, request)?;
            let exhausted = paths.len() < request;

            let references: Vec<Vec<u8>> = paths
                .into_iter()
                .map(|path| [entities_base.as_slice(), path.as_slice()].concat())
                .collect();
            let entities = ctx
                .txn
                .validated_entities(&query.app, &references, query.transaction)?;
            for (reference, entity) in references.iter().zip(entities) {
                let Some(entity) = entity else {
                    continue;
                };
                if !plan.matches(&entity) {
                    continue;
                }
                let candidate = Candidate::new(entity);
                if dedup.admit(reference, &candidate) {
                    candidates.push(candidate);
                }
                if candidates.len() >= plan.want {
                    break;
                }
            }

            if exhausted {
                break;
            }
            request = plan.want - candidates.len().min(plan.want) + ctx.config.fetch_padding;
        }

        Ok(Some(Outcome {
            candidates,
            strategy: StrategyKind::ZigZag,
        }))
    }
}

/// Up to `limit` paths present in every range, in path order.
///
/// Stops early when any range runs out.
fn common_paths(ranges: &mut [RangeIterator<'_>], limit: usize) -> Result<Vec<Vec<u8>>> {
    let mut found = Vec::new();
    'join: while found.len() < limit {
        let Some(first) = ranges.first_mut() else {
            break;
        };
        let mut target = match first.peek()? {
            Some(path) => path.to_vec(),
            None => break,
        };

        let mut agreed = true;
        for range in ranges.iter_mut() {
            match range.peek()? {
                None => break 'join,
                Some(path) if path > target.as_slice() => {
                    target = path.to_vec();
                    agreed = false;
                    break;
                }
                // Behind; catches up below
                Some(path) if path < target.as_slice() => agreed = false,
                Some(_) => {}
            }
        }

        if agreed {
            for range in ranges.iter_mut() {
                range.set_cursor(&target, false);
            }
            found.push(target);
        } else {
            for range in ranges.iter_mut() {
                range.set_cursor(&target, true);
            }
        }
    }
    Ok(found)
}

/// Windowed iterator over the paths of one equality range
struct RangeIterator<'a> {
    store: &'a dyn BatchStore,
    /// Row key prefix in front of the path
    prefix: Vec<u8>,
    /// Rows not fetched yet
    range: ScanRange,
    buffer: VecDeque<Vec<u8>>,
    exhausted: bool,
    window: usize,
}

impl<'a> RangeIterator<'a> {
    fn new(store: &'a dyn BatchStore, prefix: Vec<u8>, range: ScanRange, window: usize) -> Self {
        Self {
            store,
            prefix,
            range,
            buffer: VecDeque::new(),
            exhausted: false,
            window: window.max(1),
        }
    }

    /// Smallest path not yet passed
    fn peek(&mut self) -> Result<Option<&[u8]>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fill()?;
        }
        Ok(self.buffer.front().map(Vec::as_slice))
    }

    fn fill(&mut self) -> Result<()> {
        let rows = self
            .store
            .range_query(Table::AscProperty, &self.range, self.window, 0)?;
        if rows.len() < self.window {
            self.exhausted = true;
        }
        if let Some((last, _)) = rows.last() {
            self.range = self.range.resume_at(last.clone(), false);
        }
        for (key, _) in rows {
            if let Some(path) = key.strip_prefix(self.prefix.as_slice()) {
                self.buffer.push_back(path.to_vec());
            }
        }
        Ok(())
    }

    /// Skip every path before `path` (or up to and including it)
    fn set_cursor(&mut self, path: &[u8], inclusive: bool) {
        while let Some(front) = self.buffer.front() {
            let behind = if inclusive {
                front.as_slice() < path
            } else {
                front.as_slice() <= path
            };
            if !behind {
                break;
            }
            self.buffer.pop_front();
        }

        // Jump ahead instead of reading the gap
        if self.buffer.is_empty() && !self.exhausted {
            let key = [self.prefix.as_slice(), path].concat();
            if key > self.range.start {
                self.range = self.range.resume_at(key, inclusive);
            }
        }
    }
}

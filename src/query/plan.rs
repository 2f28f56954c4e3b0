//! Query validation, normalization and index matching

use std::collections::BTreeSet;
use std::fmt;

use crate::codec::{encode_value, Direction};
use crate::config::Config;
use crate::error::{DatastoreError, Result};
use crate::model::{is_reserved_name, Entity, PropertyValue, KEY_PROPERTY};
use crate::schema::CompositeIndex;
use crate::store::BatchStore;
use crate::txn::TransactionManager;

use super::{Operator, Order, Query, StrategyKind};

// =============================================================================
// Normalized Query
// =============================================================================

/// One comparison on a property
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FilterOp {
    pub op: Operator,
    pub value: PropertyValue,
}

/// Tightest bounds implied by the inequality filters on one property.
/// The flag is true for inclusive bounds.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ValueBounds {
    pub lower: Option<(PropertyValue, bool)>,
    pub upper: Option<(PropertyValue, bool)>,
}

impl ValueBounds {
    pub fn is_unbounded(&self) -> bool {
        self.lower.is_none() && self.upper.is_none()
    }

    pub fn contains(&self, value: &PropertyValue) -> bool {
        let encoded = encode_value(value);
        let above = match &self.lower {
            Some((bound, true)) => encoded >= encode_value(bound),
            Some((bound, false)) => encoded > encode_value(bound),
            None => true,
        };
        let below = match &self.upper {
            Some((bound, true)) => encoded <= encode_value(bound),
            Some((bound, false)) => encoded < encode_value(bound),
            None => true,
        };
        above && below
    }
}

/// A validated query with filters grouped by property and redundant
/// orders removed
#[derive(Debug)]
pub(crate) struct Plan<'a> {
    pub query: &'a Query,
    /// Filters per property, in first-seen order
    pub filters: Vec<(String, Vec<FilterOp>)>,
    pub orders: Vec<Order>,
    /// The single property carrying inequality filters
    pub inequality: Option<String>,
    pub limit: usize,
    /// Results to collect: offset + limit + 1, the extra one answering
    /// whether more results exist
    pub want: usize,
}

impl<'a> Plan<'a> {
    pub fn filters_on(&self, name: &str) -> &[FilterOp] {
        self.filters
            .iter()
            .find(|(property, _)| property == name)
            .map(|(_, ops)| ops.as_slice())
            .unwrap_or(&[])
    }

    pub fn key_filters(&self) -> &[FilterOp] {
        self.filters_on(KEY_PROPERTY)
    }

    /// Non-key properties with filters
    pub fn filtered_properties(&self) -> Vec<&str> {
        self.filters
            .iter()
            .map(|(name, _)| name.as_str())
            .filter(|name| *name != KEY_PROPERTY)
            .collect()
    }

    /// Non-key properties referenced by filters or orders
    pub fn referenced_properties(&self) -> BTreeSet<&str> {
        let mut names: BTreeSet<&str> = self.filtered_properties().into_iter().collect();
        names.extend(
            self.orders
                .iter()
                .map(|o| o.property.as_str())
                .filter(|name| *name != KEY_PROPERTY),
        );
        names
    }

    pub fn has_key_orders(&self) -> bool {
        self.orders.iter().any(|o| o.property == KEY_PROPERTY)
    }

    /// Whether every filter on the property is an equality
    pub fn is_equality_only(&self, name: &str) -> bool {
        let ops = self.filters_on(name);
        !ops.is_empty() && ops.iter().all(|f| f.op == Operator::Equal)
    }

    /// First equality value on a property
    pub fn equality_value(&self, name: &str) -> Option<&PropertyValue> {
        self.filters_on(name)
            .iter()
            .find(|f| f.op == Operator::Equal)
            .map(|f| &f.value)
    }

    /// Tightest bounds of the inequality filters on a property
    pub fn bounds(&self, name: &str) -> ValueBounds {
        let mut bounds = ValueBounds::default();
        for filter in self.filters_on(name) {
            let encoded = encode_value(&filter.value);
            match filter.op {
                Operator::GreaterThan | Operator::GreaterThanOrEqual => {
                    let inclusive = filter.op == Operator::GreaterThanOrEqual;
                    let tighter = match &bounds.lower {
                        None => true,
                        Some((current, current_inclusive)) => {
                            let current = encode_value(current);
                            encoded > current || (encoded == current && *current_inclusive && !inclusive)
                        }
                    };
                    if tighter {
                        bounds.lower = Some((filter.value.clone(), inclusive));
                    }
                }
                Operator::LessThan | Operator::LessThanOrEqual => {
                    let inclusive = filter.op == Operator::LessThanOrEqual;
                    let tighter = match &bounds.upper {
                        None => true,
                        Some((current, current_inclusive)) => {
                            let current = encode_value(current);
                            encoded < current || (encoded == current && *current_inclusive && !inclusive)
                        }
                    };
                    if tighter {
                        bounds.upper = Some((filter.value.clone(), inclusive));
                    }
                }
                Operator::Equal => {}
            }
        }
        bounds
    }

    /// Whether a value of `name` lies in the range a property scan reads:
    /// the first equality value when there is one, else the inequality bounds
    pub fn in_scan_range(&self, name: &str, value: &PropertyValue) -> bool {
        match self.equality_value(name) {
            Some(expected) => encode_value(value) == encode_value(expected),
            None => self.bounds(name).contains(value),
        }
    }

    /// Direction the results are sorted on `name`, ascending by default
    pub fn direction_of(&self, name: &str) -> Direction {
        self.orders
            .iter()
            .find(|o| o.property == name)
            .map(|o| o.direction)
            .unwrap_or(Direction::Ascending)
    }

    /// Whether an entity satisfies every filter.
    ///
    /// A filter on a repeated property matches when any value matches. Key
    /// filters compare entity row keys, which is the order of every
    /// key-ordered scan.
    pub fn matches(&self, entity: &Entity) -> bool {
        self.filters.iter().all(|(name, ops)| {
            if name == KEY_PROPERTY {
                let own = crate::codec::entity_key(&entity.key);
                return ops.iter().all(|filter| match &filter.value {
                    PropertyValue::Key(key) => filter.op.accepts(own.cmp(&crate::codec::entity_key(key))),
                    _ => false,
                });
            }
            ops.iter().all(|filter| {
                let expected = encode_value(&filter.value);
                entity
                    .values(name)
                    .any(|value| filter.op.accepts(encode_value(value).cmp(&expected)))
            })
        })
    }
}

// =============================================================================
// Validation
// =============================================================================

/// Reject queries the datastore cannot answer regardless of indexes
pub(crate) fn validate(query: &Query, config: &Config) -> Result<()> {
    if query.app.is_empty() {
        return Err(bad_request("query has no application id"));
    }
    if let Some(kind) = &query.kind {
        if kind.is_empty() || kind.contains(&['\u{0}', '\u{1}', ':'][..]) {
            return Err(bad_request(format!("invalid kind {:?}", kind)));
        }
    }

    // The ancestor counts as one component
    let components = query.filters.len() + query.orders.len() + usize::from(query.ancestor.is_some());
    if components > config.max_query_components {
        return Err(bad_request(format!(
            "query has {} components, the limit is {}",
            components, config.max_query_components
        )));
    }

    if let Some(ancestor) = &query.ancestor {
        ancestor.validate(false)?;
        if ancestor.app != query.app || ancestor.namespace != query.namespace {
            return Err(bad_request("ancestor belongs to another application or namespace"));
        }
    }
    if query.transaction.is_some() && query.ancestor.is_none() {
        return Err(bad_request("queries inside a transaction must have an ancestor"));
    }

    // Filters
    let mut inequality: Option<&str> = None;
    for filter in &query.filters {
        let name = filter.property.as_str();
        if name.is_empty() || (is_reserved_name(name) && name != KEY_PROPERTY) {
            return Err(bad_request(format!("cannot filter on property {:?}", name)));
        }
        if name == KEY_PROPERTY {
            match &filter.value {
                PropertyValue::Key(key) => {
                    if key.app != query.app || key.namespace != query.namespace {
                        return Err(bad_request("__key__ filter value belongs to another application or namespace"));
                    }
                }
                other => {
                    return Err(bad_request(format!(
                        "__key__ filter needs a key value, got {}",
                        other.type_name()
                    )))
                }
            }
        } else if query.kind.is_none() {
            return Err(bad_request("kindless queries can only filter on __key__"));
        }
        if filter.op.is_inequality() {
            match inequality {
                Some(existing) if existing != name => {
                    return Err(bad_request(format!(
                        "inequality filters on {} and {}; only one property may have inequality filters",
                        existing, name
                    )))
                }
                _ => inequality = Some(name),
            }
        }
    }

    // Orders
    for order in &query.orders {
        if order.property.is_empty() || (is_reserved_name(&order.property) && order.property != KEY_PROPERTY) {
            return Err(bad_request(format!("cannot order on property {:?}", order.property)));
        }
        if query.kind.is_none() && order.property != KEY_PROPERTY {
            return Err(bad_request("kindless queries can only order on __key__"));
        }
    }
    if let (Some(inequality), Some(first)) = (inequality, query.orders.first()) {
        if first.property != inequality {
            return Err(bad_request(format!(
                "the first sort order must be on the inequality property {}",
                inequality
            )));
        }
    }

    // Projection
    for name in &query.projection {
        if name.is_empty() || is_reserved_name(name) {
            return Err(bad_request(format!("cannot project property {:?}", name)));
        }
    }
    if query.distinct && query.projection.is_empty() {
        return Err(bad_request("distinct requires a projection"));
    }
    if query.keys_only && !query.projection.is_empty() {
        return Err(bad_request("a query cannot be both keys-only and a projection"));
    }
    if let Some(cursor) = &query.cursor {
        if cursor.last_key.app != query.app || cursor.last_key.namespace != query.namespace {
            return Err(bad_request("cursor belongs to another application or namespace"));
        }
    }
    Ok(())
}

/// Group filters and drop orders that cannot change the result order
pub(crate) fn normalize<'a>(query: &'a Query, config: &Config) -> Plan<'a> {
    let mut filters: Vec<(String, Vec<FilterOp>)> = Vec::new();
    for filter in &query.filters {
        let op = FilterOp {
            op: filter.op,
            value: filter.value.clone(),
        };
        match filters.iter_mut().find(|(name, _)| *name == filter.property) {
            Some((_, ops)) => ops.push(op),
            None => filters.push((filter.property.clone(), vec![op])),
        }
    }

    let inequality = query
        .filters
        .iter()
        .find(|f| f.op.is_inequality())
        .map(|f| f.property.clone());

    let mut plan = Plan {
        query,
        filters,
        orders: Vec::new(),
        inequality,
        limit: 0,
        want: 0,
    };

    // Orders: first occurrence wins, equality-filtered properties sort as
    // one value, and a trailing ascending key order is the natural order
    let mut orders: Vec<Order> = Vec::new();
    for order in &query.orders {
        if orders.iter().any(|o| o.property == order.property) {
            continue;
        }
        if order.property != KEY_PROPERTY && plan.is_equality_only(&order.property) {
            continue;
        }
        orders.push(order.clone());
    }
    if matches!(orders.last(), Some(o) if o.property == KEY_PROPERTY && o.direction == Direction::Ascending) {
        orders.pop();
    }
    plan.orders = orders;

    plan.limit = query
        .limit
        .unwrap_or(config.max_query_results)
        .min(config.max_query_results);
    plan.want = query.offset.saturating_add(plan.limit).saturating_add(1);
    plan
}

fn bad_request(message: impl Into<String>) -> DatastoreError {
    DatastoreError::BadRequest(message.into())
}

// =============================================================================
// Strategies
// =============================================================================

/// An entity accepted by a strategy, with the index values it was found
/// under (used to build cursors)
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub entity: Entity,
    pub values: Vec<(String, PropertyValue)>,
}

impl Candidate {
    pub fn new(entity: Entity) -> Self {
        Self {
            entity,
            values: Vec::new(),
        }
    }
}

/// Candidates in final order, at most `plan.want` of them
#[derive(Debug)]
pub(crate) struct Outcome {
    pub candidates: Vec<Candidate>,
    pub strategy: StrategyKind,
}

/// Shared handles for one query execution
pub(crate) struct QueryContext<'a> {
    pub store: &'a dyn BatchStore,
    pub txn: &'a TransactionManager,
    pub config: &'a Config,
    /// Composite index resolved for this query
    pub index: Option<&'a CompositeIndex>,
}

/// One way of answering a query. Returns `None` when the query is not of
/// the shape the strategy handles.
pub(crate) trait QueryStrategy {
    fn name(&self) -> &'static str;

    fn execute(&self, ctx: &QueryContext<'_>, plan: &Plan<'_>) -> Result<Option<Outcome>>;
}

// =============================================================================
// Composite Index Matching
// =============================================================================

/// How well an index covers a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum IndexFit {
    Exact,
    /// Extra trailing properties; entities lacking them are not indexed
    Prefix,
}

/// Sort key implied by the query for the non-equality part of an index
pub(crate) fn postfix(plan: &Plan<'_>) -> Vec<(String, Direction)> {
    let mut postfix: Vec<(String, Direction)> = plan
        .orders
        .iter()
        .map(|o| (o.property.clone(), o.direction))
        .collect();
    if let Some(inequality) = &plan.inequality {
        if postfix.first().map(|(name, _)| name != inequality).unwrap_or(true) {
            postfix.insert(0, (inequality.clone(), Direction::Ascending));
        }
    }
    postfix
}

/// Whether `index` can answer the query, and how closely
pub(crate) fn index_fit(plan: &Plan<'_>, index: &CompositeIndex) -> Option<IndexFit> {
    let definition = &index.definition;
    if plan.query.kind.as_deref() != Some(definition.kind.as_str())
        || definition.ancestor != plan.query.ancestor.is_some()
        || !plan.key_filters().is_empty()
    {
        return None;
    }

    let equality: BTreeSet<&str> = plan
        .filtered_properties()
        .into_iter()
        .filter(|name| plan.is_equality_only(name))
        .collect();
    // A property with equality and inequality filters has no single slot
    if let Some(inequality) = &plan.inequality {
        if plan.filters_on(inequality).iter().any(|f| f.op == Operator::Equal) {
            return None;
        }
    }
    let postfix = postfix(plan);

    let properties = &definition.properties;
    if properties.len() < equality.len() + postfix.len() {
        return None;
    }
    let head: BTreeSet<&str> = properties[..equality.len()]
        .iter()
        .map(|p| p.name.as_str())
        .collect();
    if head != equality {
        return None;
    }
    let tail = &properties[equality.len()..];
    let ordered = postfix
        .iter()
        .zip(tail)
        .all(|((name, direction), property)| *name == property.name && *direction == property.direction);
    if !ordered {
        return None;
    }

    if tail.len() == postfix.len() {
        Some(IndexFit::Exact)
    } else {
        Some(IndexFit::Prefix)
    }
}

/// Outcome of looking for a composite index
#[derive(Debug)]
pub(crate) enum IndexChoice {
    Use(CompositeIndex),
    /// A matching index exists but is still building
    Building(u64),
    None,
}

/// Pick the closest queryable index covering the query.
///
/// Only queries referencing at least one property are considered; exact
/// fits beat prefix fits, then fewer properties win. Prefix fits leave out
/// entities lacking the extra properties, so they only serve sorted queries.
pub(crate) fn find_index_to_use(plan: &Plan<'_>, indexes: &[CompositeIndex]) -> IndexChoice {
    if plan.referenced_properties().is_empty() {
        return IndexChoice::None;
    }

    let mut best: Option<(IndexFit, usize, &CompositeIndex)> = None;
    let mut building = None;
    for index in indexes {
        let Some(fit) = index_fit(plan, index) else {
            continue;
        };
        if fit == IndexFit::Prefix && plan.orders.is_empty() {
            continue;
        }
        if !index.is_queryable() {
            building.get_or_insert(index.id);
            continue;
        }
        let rank = (fit, index.definition.properties.len());
        if best.map(|(f, n, _)| rank < (f, n)).unwrap_or(true) {
            best = Some((fit, rank.1, index));
        }
    }

    match (best, building) {
        (Some((_, _, index)), _) => IndexChoice::Use(index.clone()),
        (None, Some(id)) => IndexChoice::Building(id),
        (None, None) => IndexChoice::None,
    }
}

impl fmt::Display for Plan<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "kind={} ancestor={} filters={} orders={}",
            self.query.kind.as_deref().unwrap_or("*"),
            self.query.ancestor.is_some(),
            self.query.filters.len(),
            self.orders.len()
        )
    }
}

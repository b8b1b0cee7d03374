use serde_json::Value;

use crate::config::CompilerConfig;
use crate::error::CompileError;
use crate::models::{
    DateRangeInput, DimensionType, FilterLeaf, FilterNode, FilterOperator, MemberKind,
    QueryRequest, SortDirection,
};
use crate::schema::{MemberRef, Schema};
use crate::time::{DateRange, Granularity, Timezone};

type Result<T> = std::result::Result<T, CompileError>;

#[derive(Debug, Clone, PartialEq)]
pub struct TimeDimension {
    pub member: MemberRef,
    pub granularity: Option<Granularity>,
    /// Wall-clock range in the query timezone.
    pub date_range: Option<DateRange>,
}

impl TimeDimension {
    /// Output alias for the projected bucket, e.g. `orders__created_at_month`.
    pub fn alias(&self) -> Option<String> {
        self.granularity
            .map(|g| format!("{}_{}", self.member.alias(), g.as_str()))
    }
}

/// A filter leaf whose member is resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub member: MemberRef,
    pub kind: MemberKind,
    pub operator: FilterOperator,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterTree {
    And(Vec<FilterTree>),
    Or(Vec<FilterTree>),
    Leaf(Filter),
}

impl FilterTree {
    pub fn leaves(&self) -> Vec<&Filter> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Filter>) {
        match self {
            FilterTree::And(items) | FilterTree::Or(items) => {
                items.iter().for_each(|i| i.collect_leaves(out))
            }
            FilterTree::Leaf(f) => out.push(f),
        }
    }
}

/// What an ORDER BY entry points at.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderTarget {
    pub member: MemberRef,
    /// Set when ordering by a specific time bucket (`Orders.createdAt.month`).
    pub granularity: Option<Granularity>,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogicalQuery {
    pub measures: Vec<MemberRef>,
    pub dimensions: Vec<MemberRef>,
    pub segments: Vec<MemberRef>,
    pub time_dimensions: Vec<TimeDimension>,
    /// Filters placed in WHERE, implicitly AND-ed.
    pub where_filters: Vec<FilterTree>,
    /// Filters on measures, placed in HAVING.
    pub having_filters: Vec<FilterTree>,
    pub order: Vec<OrderTarget>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub timezone: Timezone,
}

impl LogicalQuery {
    /// Validate `request` against `schema`. Missing order and limit are filled
    /// with the defaults.
    pub fn from_request(
        schema: &Schema,
        request: &QueryRequest,
        config: &CompilerConfig,
    ) -> Result<Self> {
        let timezone = Timezone::parse(
            request
                .timezone
                .as_deref()
                .unwrap_or(&config.default_timezone),
        )?;

        let measures = resolve_members(schema, &request.measures, MemberKind::Measure)?;
        let dimensions = resolve_members(schema, &request.dimensions, MemberKind::Dimension)?;
        let segments = resolve_members(schema, &request.segments, MemberKind::Segment)?;

        let mut time_dimensions = Vec::with_capacity(request.time_dimensions.len());
        for td in &request.time_dimensions {
            let member = expect_kind(schema, &td.dimension, MemberKind::Dimension)?;
            if schema.symbol(&member)?.dimension_type != Some(DimensionType::Time) {
                return Err(CompileError::MalformedQuery(format!(
                    "'{member}' is used as a time dimension but is not of type time"
                )));
            }
            if td.date_range.is_some() && td.compare_date_range.is_some() {
                return Err(CompileError::MalformedQuery(format!(
                    "time dimension '{member}' sets both dateRange and compareDateRange"
                )));
            }
            if td.compare_date_range.is_some() {
                return Err(CompileError::MalformedQuery(format!(
                    "compareDateRange on '{member}' must be expanded with compile_all"
                )));
            }
            let date_range = td.date_range.as_ref().map(parse_range).transpose()?;
            time_dimensions.push(TimeDimension {
                member,
                granularity: td.granularity,
                date_range,
            });
        }

        if measures.is_empty()
            && dimensions.is_empty()
            && !time_dimensions.iter().any(|t| t.granularity.is_some())
        {
            return Err(CompileError::MalformedQuery(
                "query must select at least one measure or dimension".to_string(),
            ));
        }

        let mut where_filters = Vec::new();
        let mut having_filters = Vec::new();
        for node in &request.filters {
            let tree = resolve_filter(schema, node)?;
            match placement(&tree)? {
                Placement::Where => where_filters.push(tree),
                Placement::Having => having_filters.push(tree),
            }
        }

        let mut query = LogicalQuery {
            measures,
            dimensions,
            segments,
            time_dimensions,
            where_filters,
            having_filters,
            order: Vec::new(),
            limit: request
                .limit
                .or((config.default_limit > 0).then_some(config.default_limit)),
            offset: request.offset,
            timezone,
        };

        query.order = if request.order.is_empty() {
            query.default_order()
        } else {
            request
                .order
                .0
                .iter()
                .map(|(key, dir)| resolve_order(schema, key, *dir))
                .collect::<Result<_>>()?
        };
        Ok(query)
    }

    /// First bucketed time dimension ascending, else first measure descending,
    /// else first dimension ascending.
    fn default_order(&self) -> Vec<OrderTarget> {
        if let Some(td) = self.time_dimensions.iter().find(|t| t.granularity.is_some()) {
            return vec![OrderTarget {
                member: td.member.clone(),
                granularity: td.granularity,
                direction: SortDirection::Asc,
            }];
        }
        if let Some(m) = self.measures.first() {
            return vec![OrderTarget {
                member: m.clone(),
                granularity: None,
                direction: SortDirection::Desc,
            }];
        }
        self.dimensions
            .first()
            .map(|d| OrderTarget {
                member: d.clone(),
                granularity: None,
                direction: SortDirection::Asc,
            })
            .into_iter()
            .collect()
    }

    /// Every member the query reads, in projection order then filters.
    pub fn referenced_members(&self) -> Vec<&MemberRef> {
        let mut out: Vec<&MemberRef> = Vec::new();
        out.extend(self.dimensions.iter());
        out.extend(self.time_dimensions.iter().map(|t| &t.member));
        out.extend(self.measures.iter());
        out.extend(self.segments.iter());
        for tree in self.where_filters.iter().chain(self.having_filters.iter()) {
            out.extend(tree.leaves().into_iter().map(|f| &f.member));
        }
        out
    }

    /// The bucketed time dimension, if any.
    pub fn granularity(&self) -> Option<Granularity> {
        self.time_dimensions.iter().find_map(|t| t.granularity)
    }
}

/// Split a request using `compareDateRange` into one request per range.
/// Requests without one are returned unchanged.
pub fn expand_compare_date_range(request: &QueryRequest) -> Result<Vec<QueryRequest>> {
    let Some((idx, ranges)) = request
        .time_dimensions
        .iter()
        .enumerate()
        .find_map(|(i, td)| td.compare_date_range.as_ref().map(|r| (i, r)))
    else {
        return Ok(vec![request.clone()]);
    };
    if ranges.is_empty() {
        return Err(CompileError::MalformedQuery(
            "compareDateRange must list at least one range".to_string(),
        ));
    }
    if request
        .time_dimensions
        .iter()
        .filter(|td| td.compare_date_range.is_some())
        .count()
        > 1
    {
        return Err(CompileError::MalformedQuery(
            "only one time dimension may set compareDateRange".to_string(),
        ));
    }
    Ok(ranges
        .iter()
        .map(|range| {
            let mut expanded = request.clone();
            let td = &mut expanded.time_dimensions[idx];
            td.compare_date_range = None;
            td.date_range = Some(range.clone());
            expanded
        })
        .collect())
}

fn parse_range(input: &DateRangeInput) -> Result<DateRange> {
    let (from, to) = input.bounds();
    DateRange::parse(from, to)
}

fn resolve_members(schema: &Schema, paths: &[String], kind: MemberKind) -> Result<Vec<MemberRef>> {
    let mut out: Vec<MemberRef> = Vec::with_capacity(paths.len());
    for path in paths {
        let member = expect_kind(schema, path, kind)?;
        if !out.contains(&member) {
            out.push(member);
        }
    }
    Ok(out)
}

fn expect_kind(schema: &Schema, path: &str, kind: MemberKind) -> Result<MemberRef> {
    let member = MemberRef::parse(path, None)?;
    let symbol = schema.symbol(&member)?;
    if symbol.kind != kind {
        return Err(CompileError::UnresolvedMember {
            member: member.to_string(),
            reason: format!("requested as a {kind} but declared as a {}", symbol.kind),
        });
    }
    Ok(member)
}

fn resolve_filter(schema: &Schema, node: &FilterNode) -> Result<FilterTree> {
    match node {
        FilterNode::And { and } => Ok(FilterTree::And(
            and.iter().map(|n| resolve_filter(schema, n)).collect::<Result<_>>()?,
        )),
        FilterNode::Or { or } => Ok(FilterTree::Or(
            or.iter().map(|n| resolve_filter(schema, n)).collect::<Result<_>>()?,
        )),
        FilterNode::Leaf(leaf) => resolve_leaf(schema, leaf).map(FilterTree::Leaf),
    }
}

fn resolve_leaf(schema: &Schema, leaf: &FilterLeaf) -> Result<Filter> {
    let path = leaf
        .member
        .as_deref()
        .ok_or_else(|| CompileError::MalformedFilter("filter has no member".to_string()))?;
    let member = MemberRef::parse(path, None)?;
    let kind = schema.symbol(&member)?.kind;
    if kind == MemberKind::Segment {
        return Err(CompileError::MalformedFilter(format!(
            "'{member}' is a segment; list it under segments instead"
        )));
    }
    if leaf.operator == FilterOperator::MeasureFilter && kind != MemberKind::Measure {
        return Err(CompileError::MalformedFilter(format!(
            "measureFilter needs a measure, '{member}' is a {kind}"
        )));
    }
    check_arity(&member, leaf.operator, &leaf.values)?;
    Ok(Filter {
        member,
        kind,
        operator: leaf.operator,
        values: leaf.values.clone(),
    })
}

fn check_arity(member: &MemberRef, op: FilterOperator, values: &[Value]) -> Result<()> {
    use FilterOperator::*;
    let expected = match op {
        Set | NotSet | MeasureFilter => return Ok(()),
        InDateRange | NotInDateRange => Some(2),
        Gt | Gte | Lt | Lte | BeforeDate | BeforeOrOnDate | AfterDate | AfterOrOnDate => Some(1),
        _ => None,
    };
    match expected {
        Some(n) if values.len() != n => Err(CompileError::MalformedFilter(format!(
            "{op:?} on '{member}' takes {n} value(s), got {}",
            values.len()
        ))),
        None if values.is_empty() => Err(CompileError::MalformedFilter(format!(
            "{op:?} on '{member}' needs at least one value"
        ))),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Where,
    Having,
}

fn leaf_placement(filter: &Filter) -> Placement {
    if filter.kind == MemberKind::Measure && filter.operator != FilterOperator::MeasureFilter {
        Placement::Having
    } else {
        Placement::Where
    }
}

/// A group must be entirely row-level or entirely aggregate.
fn placement(tree: &FilterTree) -> Result<Placement> {
    let leaves = tree.leaves();
    let mut placements = leaves.iter().map(|f| leaf_placement(f));
    let Some(first) = placements.next() else {
        return Ok(Placement::Where);
    };
    if placements.any(|p| p != first) {
        let members: Vec<String> = leaves.iter().map(|f| f.member.to_string()).collect();
        return Err(CompileError::MalformedFilter(format!(
            "cannot mix measures and dimensions in one filter group: {}",
            members.join(", ")
        )));
    }
    Ok(first)
}

fn resolve_order(schema: &Schema, key: &str, direction: SortDirection) -> Result<OrderTarget> {
    let segments: Vec<&str> = key.split('.').collect();
    if let [cube, member, grain] = segments.as_slice() {
        if let Ok(granularity) = grain.parse::<Granularity>() {
            let member = expect_kind(schema, &format!("{cube}.{member}"), MemberKind::Dimension)?;
            return Ok(OrderTarget {
                member,
                granularity: Some(granularity),
                direction,
            });
        }
    }
    let member = MemberRef::parse(key, None)?;
    let kind = schema.symbol(&member)?.kind;
    if kind == MemberKind::Segment {
        return Err(CompileError::MalformedQuery(format!(
            "cannot order by segment '{member}'"
        )));
    }
    Ok(OrderTarget {
        member,
        granularity: None,
        direction,
    })
}

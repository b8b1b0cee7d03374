//! Decides whether a rollup can answer a query and rewrites the query to
//! read from it.
//!
//! Matching never fails a query: anything the matcher cannot prove correct is
//! a non-match and the caller falls back to the source SQL.

use std::collections::{BTreeSet, HashMap};

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dialect::Dialect;
use crate::error::Result;
use crate::models::{FilterOperator, MeasureType, MemberKind};
use crate::query_builder::{render_query, LogicalQuery, OutputColumn, RollupSource};
use crate::schema::{MemberRef, Schema, TemplatePart};
use crate::sql_ast::TableRef;
use crate::time::{DateRange, Granularity};

use super::partitions::{windows, PartitionWindow};
use super::PreAggregation;

#[derive(Debug, Clone)]
pub struct MatchOptions {
    /// Schema the rollup tables live in.
    pub schema: String,
    pub max_partitions: usize,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            schema: "cubeflow_pre_aggregations".to_string(),
            max_partitions: 10_000,
        }
    }
}

/// A query rewritten to read from a rollup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewrittenQuery {
    pub sql: String,
    pub params: Vec<Value>,
    pub columns: Vec<OutputColumn>,
    pub pre_aggregation: String,
    /// Logical table names, one per partition, in range order.
    pub tables: Vec<String>,
    pub partitions: Vec<PartitionWindow>,
    pub external: bool,
    pub data_source: String,
    pub time_granularity: Option<Granularity>,
}

impl RewrittenQuery {
    /// Point the query at physical tables. `physical` maps logical names to
    /// the versioned tables currently serving them.
    pub fn with_tables(&self, physical: &HashMap<String, String>) -> Self {
        let mut names: Vec<&String> = self.tables.iter().collect();
        names.sort_by_key(|n| std::cmp::Reverse(n.len()));
        let mut sql = self.sql.clone();
        let mut tables = self.tables.clone();
        for logical in names {
            if let Some(target) = physical.get(logical) {
                sql = replace_table(&sql, logical, target);
            }
        }
        for table in tables.iter_mut() {
            if let Some(target) = physical.get(table) {
                *table = target.clone();
            }
        }
        Self {
            sql,
            tables,
            ..self.clone()
        }
    }
}

/// Replace whole-word occurrences of `from`.
fn replace_table(sql: &str, from: &str, to: &str) -> String {
    let is_ident = |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '.';
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find(from) {
        let before = rest[..pos].chars().next_back();
        let after = rest[pos + from.len()..].chars().next();
        out.push_str(&rest[..pos]);
        if before.map_or(true, |c| !is_ident(c)) && after.map_or(true, |c| !is_ident(c)) {
            out.push_str(to);
        } else {
            out.push_str(from);
        }
        rest = &rest[pos + from.len()..];
    }
    out.push_str(rest);
    out
}

/// Pick the first rollup that can answer `query`, preferring the ones with
/// fewer dimensions, and rewrite the query against it.
pub fn match_query(
    schema: &Schema,
    query: &LogicalQuery,
    pre_aggregations: &[PreAggregation],
    dialect: &dyn Dialect,
    options: &MatchOptions,
) -> Result<Option<RewrittenQuery>> {
    let mut candidates: Vec<(usize, &PreAggregation)> = pre_aggregations.iter().enumerate().collect();
    candidates.sort_by_key(|(idx, p)| (p.dimensions.len(), *idx));

    for (_, pre_aggregation) in candidates {
        match plan_match(schema, query, pre_aggregation, options) {
            Ok(plan) => {
                tracing::debug!(pre_aggregation = %pre_aggregation.id, "query matched rollup");
                return rewrite(schema, query, pre_aggregation, plan, dialect, options).map(Some);
            }
            Err(reason) => {
                tracing::debug!(pre_aggregation = %pre_aggregation.id, %reason, "rollup rejected");
            }
        }
    }
    Ok(None)
}

struct MatchPlan {
    leaves: BTreeSet<MemberRef>,
    partitions: Vec<PartitionWindow>,
}

type Check<T> = std::result::Result<T, String>;

fn plan_match(
    schema: &Schema,
    query: &LogicalQuery,
    pre: &PreAggregation,
    options: &MatchOptions,
) -> Check<MatchPlan> {
    if query.timezone != pre.timezone {
        return Err(format!("timezone {} differs from rollup {}", query.timezone, pre.timezone));
    }
    let query_segments: BTreeSet<&MemberRef> = query.segments.iter().collect();
    let rollup_segments: BTreeSet<&MemberRef> = pre.segments.iter().collect();
    if query_segments != rollup_segments {
        return Err("segments differ".to_string());
    }

    let dims: BTreeSet<&MemberRef> = pre.dimensions.iter().collect();
    let stored: BTreeSet<&MemberRef> = pre.measures.iter().collect();

    let mut leaves = BTreeSet::new();
    let having_measures = query
        .having_filters
        .iter()
        .flat_map(|t| t.leaves())
        .map(|f| &f.member);
    for measure in query.measures.iter().chain(having_measures) {
        collect_leaves(schema, measure, &dims, &mut leaves, &mut Vec::new())?;
    }
    if let Some(missing) = leaves.iter().find(|l| !stored.contains(l)) {
        return Err(format!("measure {missing} is not stored"));
    }
    let additive = leaves.iter().all(|l| {
        schema
            .symbol(l)
            .ok()
            .and_then(|s| s.measure_type)
            .is_some_and(|t| t.is_additive())
    });

    for dim in &query.dimensions {
        if !dims.contains(dim) {
            return Err(format!("dimension {dim} is not stored"));
        }
    }
    if !additive {
        let requested: BTreeSet<&MemberRef> = query.dimensions.iter().collect();
        if requested != dims {
            return Err("non-additive measures need the exact dimension set".to_string());
        }
    }

    let mut range: Option<DateRange> = None;
    for td in &query.time_dimensions {
        if pre.time_dimension.as_ref() != Some(&td.member) {
            return Err(format!("time dimension {} is not the rollup's", td.member));
        }
        let stored_granularity = pre.granularity.ok_or("rollup has no granularity")?;
        if let Some(g) = td.granularity {
            let fits = if additive {
                g.can_roll_up_from(stored_granularity)
            } else {
                g == stored_granularity
            };
            if !fits {
                return Err(format!("granularity {g} cannot be read from {stored_granularity}"));
            }
        }
        if let Some(r) = &td.date_range {
            if !r.is_aligned_to(stored_granularity) {
                return Err(format!("date range is not aligned to {stored_granularity}"));
            }
            range = Some(match range {
                Some(existing) => existing.intersect(r).ok_or("date ranges do not overlap")?,
                None => *r,
            });
        }
    }
    if !additive
        && pre.time_dimension.is_some()
        && !query.time_dimensions.iter().any(|t| t.granularity == pre.granularity)
    {
        return Err("non-additive measures need the rollup's time bucket".to_string());
    }

    for leaf in query.where_filters.iter().flat_map(|t| t.leaves()) {
        if leaf.operator == FilterOperator::MeasureFilter {
            return Err("measureFilter cannot be applied to stored rows".to_string());
        }
        let is_time = pre.time_dimension.as_ref() == Some(&leaf.member);
        if !is_time && !dims.contains(&leaf.member) {
            return Err(format!("filter on {} which is not stored", leaf.member));
        }
        if !additive && !query.dimensions.contains(&leaf.member) && !is_time {
            return Err(format!("filter on {} would change distinct counts", leaf.member));
        }
        if is_time && leaf.operator.is_date_operator() {
            let granularity = pre.granularity.ok_or("rollup has no granularity")?;
            if !date_filter_aligned(leaf.operator, &leaf.values, granularity) {
                return Err(format!("date filter on {} is not aligned", leaf.member));
            }
        } else if is_time {
            return Err(format!("non-date filter on time dimension {}", leaf.member));
        }
    }

    // The table only holds rows inside the build range.
    if let Some(built) = &pre.build_range {
        match &range {
            Some(r) if !built.contains(r) => {
                return Err(format!(
                    "date range {}..{} is outside the build range",
                    r.from_str_value(),
                    r.to_str_value()
                ));
            }
            None if pre.partition_granularity.is_none() => {
                return Err("query without a date range cannot read a bounded rollup".to_string());
            }
            _ => {}
        }
    }

    let partitions = match pre.partition_granularity {
        Some(granularity) => {
            let range = range
                .or(pre.build_range)
                .ok_or("partitioned rollup needs a date range")?;
            windows(granularity, &range, options.max_partitions)
                .ok_or_else(|| format!("more than {} partitions", options.max_partitions))?
        }
        None => Vec::new(),
    };

    Ok(MatchPlan { leaves, partitions })
}

/// Walk a measure down to the stored measures it is computed from.
fn collect_leaves(
    schema: &Schema,
    measure: &MemberRef,
    dims: &BTreeSet<&MemberRef>,
    out: &mut BTreeSet<MemberRef>,
    stack: &mut Vec<MemberRef>,
) -> Check<()> {
    if stack.contains(measure) {
        return Err(format!("cyclic measure {measure}"));
    }
    let symbol = schema.symbol(measure).map_err(|e| e.to_string())?;
    if symbol.measure_type != Some(MeasureType::Number) {
        out.insert(measure.clone());
        return Ok(());
    }
    let Some(template) = &symbol.template else {
        return Err(format!("number measure {measure} has no sql"));
    };
    stack.push(measure.clone());
    for part in &template.parts {
        let TemplatePart::Member { cube, member } = part else {
            continue;
        };
        let target = MemberRef::new(cube.as_deref().unwrap_or(&measure.cube), member.as_str());
        let kind = schema.symbol(&target).map_err(|e| e.to_string())?.kind;
        match kind {
            MemberKind::Measure => collect_leaves(schema, &target, dims, out, stack)?,
            _ if dims.contains(&target) => {}
            _ => return Err(format!("{measure} reads {target} which is not stored")),
        }
    }
    stack.pop();
    Ok(())
}

fn date_filter_aligned(op: FilterOperator, values: &[Value], granularity: Granularity) -> bool {
    let bounds: Vec<&str> = values.iter().filter_map(Value::as_str).collect();
    let starts_bucket = |ts: NaiveDateTime| granularity.truncate(ts) == ts;
    let ends_bucket = |ts: NaiveDateTime| {
        let next = ts + Duration::milliseconds(1);
        granularity.truncate(next) == next
    };
    match (op, bounds.as_slice()) {
        (FilterOperator::InDateRange | FilterOperator::NotInDateRange, [from, to]) => {
            DateRange::parse(from, to).is_ok_and(|r| r.is_aligned_to(granularity))
        }
        (FilterOperator::BeforeDate | FilterOperator::AfterOrOnDate, [day]) => {
            DateRange::parse(day, day).is_ok_and(|r| starts_bucket(r.from))
        }
        (FilterOperator::BeforeOrOnDate | FilterOperator::AfterDate, [day]) => {
            DateRange::parse(day, day).is_ok_and(|r| ends_bucket(r.to))
        }
        _ => false,
    }
}

fn rewrite(
    schema: &Schema,
    query: &LogicalQuery,
    pre: &PreAggregation,
    plan: MatchPlan,
    dialect: &dyn Dialect,
    options: &MatchOptions,
) -> Result<RewrittenQuery> {
    let alias = pre.alias();
    let column = |name: &str| format!("{}.{}", dialect.quote_ident(&alias), dialect.quote_ident(name));

    let mut overrides: Vec<(MemberRef, String)> = Vec::new();
    for dim in &pre.dimensions {
        overrides.push((dim.clone(), column(&dim.alias())));
    }
    if let (Some(td), Some(time_column)) = (&pre.time_dimension, pre.time_column()) {
        overrides.push((td.clone(), column(&time_column)));
    }
    for leaf in &plan.leaves {
        let measure_type = schema.symbol(leaf)?.measure_type.unwrap_or(MeasureType::Sum);
        let function = match measure_type {
            MeasureType::Count | MeasureType::Sum => "SUM",
            MeasureType::Min => "MIN",
            MeasureType::Max | MeasureType::CountDistinct | MeasureType::Avg | MeasureType::Number => {
                "MAX"
            }
        };
        overrides.push((leaf.clone(), format!("{function}({})", column(&leaf.alias()))));
    }

    let tables: Vec<String> = if plan.partitions.is_empty() {
        vec![pre.table_name(&options.schema, None)]
    } else {
        plan.partitions
            .iter()
            .map(|w| pre.table_name(&options.schema, Some(w)))
            .collect()
    };
    let source = match tables.as_slice() {
        [single] => single.clone(),
        many => format!(
            "({})",
            many.iter()
                .map(|t| format!("SELECT * FROM {t}"))
                .collect::<Vec<_>>()
                .join(" UNION ALL ")
        ),
    };
    let rollup = RollupSource {
        from: TableRef {
            source,
            alias: Some(alias.clone()),
        },
        granularity: pre.granularity,
    };

    let mut rollup_query = query.clone();
    rollup_query.segments.clear();
    let rendered = render_query(schema, &rollup_query, dialect, overrides, Some(&rollup))?;

    Ok(RewrittenQuery {
        sql: rendered.sql,
        params: rendered.params,
        columns: rendered.columns,
        pre_aggregation: pre.id.clone(),
        tables,
        partitions: plan.partitions,
        external: pre.external,
        data_source: pre.data_source.clone(),
        time_granularity: query.granularity(),
    })
}

use serde::{Deserialize, Serialize};

use crate::error::CompileError;
use crate::models::MemberKind;
use crate::schema::{MemberRef, MemberResolver};
use crate::sql_ast::{
    Join, OrderItem, ParamAllocator, SelectItem, SelectQuery, SqlExpr, SqlJoinType, TableRef,
};
use crate::time::Granularity;

use super::components::{LogicalQuery, TimeDimension};
use super::filters::{date_range_condition, render_tree, FilterContext};

type Result<T> = std::result::Result<T, CompileError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Dimension,
    TimeDimension,
    Measure,
}

/// Metadata for one projected column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputColumn {
    pub alias: String,
    pub member: String,
    pub kind: ColumnKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granularity: Option<Granularity>,
}

/// Read from a rollup table instead of the cube sources. Member overrides
/// must already be installed on the resolver.
#[derive(Debug, Clone)]
pub(crate) struct RollupSource {
    pub from: TableRef,
    /// Granularity the rollup stored its time column at.
    pub granularity: Option<Granularity>,
}

pub(crate) struct PlannedQuery {
    pub select: SelectQuery,
    pub columns: Vec<OutputColumn>,
    /// Cubes joined into the query, root first. Empty for rollup plans.
    pub cubes: Vec<String>,
}

pub(crate) fn build_query(
    query: &LogicalQuery,
    resolver: &mut MemberResolver<'_>,
    params: &mut ParamAllocator,
    rollup: Option<&RollupSource>,
) -> Result<PlannedQuery> {
    let dialect = resolver.dialect();
    let ctx = FilterContext {
        timezone: &query.timezone,
        local_time: rollup.is_some(),
    };
    let mut select = SelectQuery::default();
    let mut columns = Vec::new();

    for dim in &query.dimensions {
        let sql = resolver.dimension_sql(dim)?;
        push_column(&mut select, &mut columns, sql, dim, ColumnKind::Dimension);
    }

    let mut tz_marker: Option<String> = None;
    for td in query.time_dimensions.iter() {
        let (Some(granularity), Some(alias)) = (td.granularity, td.alias()) else {
            continue;
        };
        let raw = resolver.dimension_sql(&td.member)?;
        let bucket = match rollup {
            Some(source) if source.granularity == Some(granularity) => raw,
            Some(_) => dialect.time_truncate(granularity, &raw),
            None => {
                let tz = tz_marker
                    .get_or_insert_with(|| params.allocate(dialect.timezone_param(&query.timezone)))
                    .clone();
                dialect.time_truncate(granularity, &dialect.convert_tz(&raw, &tz))
            }
        };
        select.select.push(SelectItem {
            expr: SqlExpr::Raw(bucket),
            alias: Some(alias.clone()),
        });
        columns.push(OutputColumn {
            alias,
            member: td.member.to_string(),
            kind: ColumnKind::TimeDimension,
            granularity: Some(granularity),
        });
    }

    let group_len = select.select.len();

    for measure in &query.measures {
        let sql = resolver.measure_sql(measure)?;
        push_column(&mut select, &mut columns, sql, measure, ColumnKind::Measure);
    }

    if rollup.is_none() {
        for segment in &query.segments {
            let sql = resolver.segment_sql(segment)?;
            select.filters.push(SqlExpr::Raw(format!("({sql})")));
        }
    }

    for td in &query.time_dimensions {
        if let Some(range) = &td.date_range {
            let column = SqlExpr::Raw(resolver.dimension_sql(&td.member)?);
            select
                .filters
                .push(date_range_condition(column, range, false, resolver, params, ctx));
        }
    }

    for tree in &query.where_filters {
        if let Some(expr) = render_tree(tree, resolver, params, ctx)? {
            select.filters.push(expr);
        }
    }
    for tree in &query.having_filters {
        if let Some(expr) = render_tree(tree, resolver, params, ctx)? {
            select.having.push(expr);
        }
    }

    for target in &query.order {
        let expr = match find_alias(query, &columns, &target.member, target.granularity) {
            Some(alias) => SqlExpr::Raw(dialect.quote_ident(&alias)),
            // An aggregate is valid in ORDER BY under any grouping; a raw
            // column that is not grouped is not.
            None if resolver.schema().symbol(&target.member)?.kind == MemberKind::Measure => {
                SqlExpr::Raw(resolver.measure_sql(&target.member)?)
            }
            None => {
                return Err(CompileError::MalformedQuery(format!(
                    "cannot order by '{}' without selecting it",
                    target.member
                )))
            }
        };
        select.order_by.push(OrderItem {
            expr,
            direction: target.direction,
        });
    }

    if group_len > 0 {
        select.group_by = (1..=group_len).map(SqlExpr::Ordinal).collect();
    }
    select.limit = query.limit;
    select.offset = query.offset;

    let cubes = match rollup {
        Some(source) => {
            select.from = source.from.clone();
            Vec::new()
        }
        None => attach_joins(&mut select, resolver)?,
    };

    Ok(PlannedQuery {
        select,
        columns,
        cubes,
    })
}

fn push_column(
    select: &mut SelectQuery,
    columns: &mut Vec<OutputColumn>,
    sql: String,
    member: &MemberRef,
    kind: ColumnKind,
) {
    let alias = member.alias();
    select.select.push(SelectItem {
        expr: SqlExpr::Raw(sql),
        alias: Some(alias.clone()),
    });
    columns.push(OutputColumn {
        alias,
        member: member.to_string(),
        kind,
        granularity: None,
    });
}

/// Alias of the projected column for `member`. A bare time dimension reference
/// matches its first bucketed projection.
fn find_alias(
    query: &LogicalQuery,
    columns: &[OutputColumn],
    member: &MemberRef,
    granularity: Option<Granularity>,
) -> Option<String> {
    let name = member.to_string();
    if let Some(col) = columns
        .iter()
        .find(|c| c.member == name && c.kind != ColumnKind::TimeDimension)
    {
        return Some(col.alias.clone());
    }
    query
        .time_dimensions
        .iter()
        .filter(|td: &&TimeDimension| &td.member == member && td.granularity.is_some())
        .find(|td| granularity.is_none() || td.granularity == granularity)
        .and_then(TimeDimension::alias)
}

fn attach_joins(select: &mut SelectQuery, resolver: &mut MemberResolver<'_>) -> Result<Vec<String>> {
    resolver.freeze_touches();
    let schema = resolver.schema();
    let tree = schema.join_graph().build_joins(resolver.touched())?;

    let root = schema.cube(&tree.root)?;
    select.from = TableRef {
        source: root.source.render(),
        alias: Some(tree.root.clone()),
    };
    let mut cubes = vec![tree.root.clone()];
    let data_source = root.data_source().to_string();

    for step in &tree.steps {
        let cube = schema.cube(&step.to)?;
        if cube.data_source() != data_source {
            return Err(CompileError::MalformedQuery(format!(
                "cube '{}' lives in data source '{}' but the query runs against '{}'",
                step.to,
                cube.data_source(),
                data_source
            )));
        }
        if step.fans_out {
            tracing::debug!(from = %step.from, to = %step.to, "join may multiply rows");
        }
        let on = resolver.join_condition(&step.edge.owner, &step.edge.template)?;
        select.joins.push(Join {
            join_type: SqlJoinType::Left,
            table: TableRef {
                source: cube.source.render(),
                alias: Some(step.to.clone()),
            },
            on: vec![SqlExpr::Raw(on)],
        });
        cubes.push(step.to.clone());
    }
    Ok(cubes)
}

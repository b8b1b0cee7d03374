use serde_json::Value;

use crate::error::CompileError;
use crate::models::{FilterOperator, MemberKind};
use crate::schema::MemberResolver;
use crate::sql_ast::{ParamAllocator, SqlBinaryOperator, SqlExpr};
use crate::time::{format_timestamp, DateRange, Timezone};

use super::components::{Filter, FilterTree};

type Result<T> = std::result::Result<T, CompileError>;

/// How date bounds are bound.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FilterContext<'a> {
    pub timezone: &'a Timezone,
    /// Time columns already hold wall-clock values in the query timezone
    /// (rollup tables), so bounds are bound as local timestamps.
    pub local_time: bool,
}

/// Render a filter tree. `None` when nothing constrains the rows, e.g. a
/// `measureFilter` on a measure without filters.
pub(crate) fn render_tree(
    tree: &FilterTree,
    resolver: &mut MemberResolver<'_>,
    params: &mut ParamAllocator,
    ctx: FilterContext<'_>,
) -> Result<Option<SqlExpr>> {
    match tree {
        FilterTree::And(items) => Ok(group(items, resolver, params, ctx)?.map(SqlExpr::And)),
        FilterTree::Or(items) => Ok(group(items, resolver, params, ctx)?.map(SqlExpr::Or)),
        FilterTree::Leaf(filter) => render_leaf(filter, resolver, params, ctx),
    }
}

fn group(
    items: &[FilterTree],
    resolver: &mut MemberResolver<'_>,
    params: &mut ParamAllocator,
    ctx: FilterContext<'_>,
) -> Result<Option<Vec<SqlExpr>>> {
    let mut rendered = Vec::with_capacity(items.len());
    for item in items {
        if let Some(expr) = render_tree(item, resolver, params, ctx)? {
            rendered.push(expr);
        }
    }
    Ok((!rendered.is_empty()).then_some(rendered))
}

fn render_leaf(
    filter: &Filter,
    resolver: &mut MemberResolver<'_>,
    params: &mut ParamAllocator,
    ctx: FilterContext<'_>,
) -> Result<Option<SqlExpr>> {
    if filter.operator == FilterOperator::MeasureFilter {
        return Ok(resolver.measure_filter_sql(&filter.member)?.map(SqlExpr::Raw));
    }
    let column = match filter.kind {
        MemberKind::Measure => resolver.measure_sql(&filter.member)?,
        _ => resolver.dimension_sql(&filter.member)?,
    };
    let column = SqlExpr::Raw(column);

    use FilterOperator::*;
    let expr = match filter.operator {
        Equals | In => equality(column, &filter.values, false, params),
        NotEquals | NotIn => equality(column, &filter.values, true, params),
        Contains => like(column, &filter.values, "%", "%", false, params),
        NotContains => like(column, &filter.values, "%", "%", true, params),
        StartsWith => like(column, &filter.values, "", "%", false, params),
        NotStartsWith => like(column, &filter.values, "", "%", true, params),
        EndsWith => like(column, &filter.values, "%", "", false, params),
        NotEndsWith => like(column, &filter.values, "%", "", true, params),
        Gt => compare(column, SqlBinaryOperator::Gt, &filter.values, params),
        Gte => compare(column, SqlBinaryOperator::Gte, &filter.values, params),
        Lt => compare(column, SqlBinaryOperator::Lt, &filter.values, params),
        Lte => compare(column, SqlBinaryOperator::Lte, &filter.values, params),
        Set => SqlExpr::is_null(column, true),
        NotSet => SqlExpr::is_null(column, false),
        InDateRange | NotInDateRange => {
            let range = DateRange::parse(&date_value(filter, 0)?, &date_value(filter, 1)?)?;
            let negated = filter.operator == NotInDateRange;
            date_range_condition(column, &range, negated, resolver, params, ctx)
        }
        BeforeDate | BeforeOrOnDate | AfterDate | AfterOrOnDate => {
            let raw = date_value(filter, 0)?;
            let day = DateRange::parse(&raw, &raw)?;
            let (op, bound) = match filter.operator {
                BeforeDate => (SqlBinaryOperator::Lt, day.from),
                BeforeOrOnDate => (SqlBinaryOperator::Lte, day.to),
                AfterDate => (SqlBinaryOperator::Gt, day.to),
                _ => (SqlBinaryOperator::Gte, day.from),
            };
            let bound = timestamp_bound(bound, resolver, params, ctx);
            SqlExpr::binary(op, column, bound)
        }
        MeasureFilter => return Ok(None),
    };
    Ok(Some(expr))
}

/// `from <= column <= to` on wall-clock bounds, or its complement.
pub(crate) fn date_range_condition(
    column: SqlExpr,
    range: &DateRange,
    negated: bool,
    resolver: &MemberResolver<'_>,
    params: &mut ParamAllocator,
    ctx: FilterContext<'_>,
) -> SqlExpr {
    let from = timestamp_bound(range.from, resolver, params, ctx);
    let to = timestamp_bound(range.to, resolver, params, ctx);
    if negated {
        SqlExpr::Or(vec![
            SqlExpr::binary(SqlBinaryOperator::Lt, column.clone(), from),
            SqlExpr::binary(SqlBinaryOperator::Gt, column, to),
        ])
    } else {
        SqlExpr::And(vec![
            SqlExpr::binary(SqlBinaryOperator::Gte, column.clone(), from),
            SqlExpr::binary(SqlBinaryOperator::Lte, column, to),
        ])
    }
}

fn timestamp_bound(
    local: chrono::NaiveDateTime,
    resolver: &MemberResolver<'_>,
    params: &mut ParamAllocator,
    ctx: FilterContext<'_>,
) -> SqlExpr {
    if ctx.local_time {
        return SqlExpr::Param(params.allocate(format_timestamp(local)));
    }
    let utc = ctx.timezone.to_utc(local);
    let marker = params.allocate(resolver.dialect().timestamp_param(utc));
    SqlExpr::TimestampParam(marker)
}

fn date_value(filter: &Filter, idx: usize) -> Result<String> {
    match filter.values.get(idx) {
        Some(Value::String(s)) => Ok(s.clone()),
        other => Err(CompileError::MalformedFilter(format!(
            "{:?} on '{}' expects date strings, got {}",
            filter.operator,
            filter.member,
            other.map(Value::to_string).unwrap_or_else(|| "nothing".to_string())
        ))),
    }
}

/// `=` / `IN` with null handling. The negated form keeps NULL rows unless a
/// null is one of the excluded values.
fn equality(column: SqlExpr, values: &[Value], negated: bool, params: &mut ParamAllocator) -> SqlExpr {
    let has_null = values.iter().any(Value::is_null);
    let bound: Vec<SqlExpr> = values
        .iter()
        .filter(|v| !v.is_null())
        .map(|v| SqlExpr::Param(params.allocate(v.clone())))
        .collect();

    let matched = match bound.len() {
        0 => None,
        1 => {
            let op = if negated {
                SqlBinaryOperator::Neq
            } else {
                SqlBinaryOperator::Eq
            };
            bound
                .into_iter()
                .next()
                .map(|v| SqlExpr::binary(op, column.clone(), v))
        }
        _ => Some(SqlExpr::InList {
            expr: Box::new(column.clone()),
            list: bound,
            negated,
        }),
    };

    match (matched, negated, has_null) {
        (None, _, _) => SqlExpr::is_null(column, negated),
        (Some(m), false, false) => m,
        (Some(m), false, true) => SqlExpr::Or(vec![m, SqlExpr::is_null(column, false)]),
        (Some(m), true, false) => SqlExpr::Or(vec![m, SqlExpr::is_null(column, false)]),
        (Some(m), true, true) => SqlExpr::And(vec![m, SqlExpr::is_null(column, true)]),
    }
}

fn compare(column: SqlExpr, op: SqlBinaryOperator, values: &[Value], params: &mut ParamAllocator) -> SqlExpr {
    let value = values.first().cloned().unwrap_or(Value::Null);
    SqlExpr::binary(op, column, SqlExpr::Param(params.allocate(value)))
}

fn like(
    column: SqlExpr,
    values: &[Value],
    prefix: &str,
    suffix: &str,
    negated: bool,
    params: &mut ParamAllocator,
) -> SqlExpr {
    let patterns: Vec<SqlExpr> = values
        .iter()
        .filter(|v| !v.is_null())
        .map(|v| {
            let text = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let mut parts = Vec::with_capacity(3);
            if !prefix.is_empty() {
                parts.push(SqlExpr::raw(format!("'{prefix}'")));
            }
            parts.push(SqlExpr::Param(params.allocate(escape_like(&text))));
            if !suffix.is_empty() {
                parts.push(SqlExpr::raw(format!("'{suffix}'")));
            }
            SqlExpr::ILike {
                expr: Box::new(column.clone()),
                pattern: Box::new(SqlExpr::Concat(parts)),
                negated,
            }
        })
        .collect();

    if negated {
        let mut all = vec![SqlExpr::And(patterns)];
        all.push(SqlExpr::is_null(column, false));
        SqlExpr::Or(all)
    } else {
        SqlExpr::Or(patterns)
    }
}

/// Escape LIKE wildcards so user values match literally.
pub(crate) fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

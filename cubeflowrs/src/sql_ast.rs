//! Minimal SELECT AST and renderer.
//!
//! Member SQL comes out of the resolver as finished text, so most leaves are
//! [`SqlExpr::Raw`]. Predicates produced by filters stay structured until
//! rendering, which keeps parenthesisation and null handling in one place.
//!
//! Bind parameters are never spelled directly. [`ParamAllocator`] hands out
//! opaque markers, and [`ParamAllocator::finalize`] swaps them for dialect
//! placeholders in text order.

use serde_json::Value;

use crate::dialect::Dialect;
use crate::models::SortDirection;

const MARK: char = '\u{1}';

#[derive(Debug, Clone, PartialEq)]
pub enum SqlExpr {
    Raw(String),
    /// Bind parameter marker produced by [`ParamAllocator::allocate`].
    Param(String),
    /// Bind parameter cast to the dialect's timestamp type.
    TimestampParam(String),
    /// `'%' || ? || '%'`, escaped value bound as a parameter.
    Concat(Vec<SqlExpr>),
    BinaryOp {
        op: SqlBinaryOperator,
        left: Box<SqlExpr>,
        right: Box<SqlExpr>,
    },
    And(Vec<SqlExpr>),
    Or(Vec<SqlExpr>),
    IsNull {
        expr: Box<SqlExpr>,
        negated: bool,
    },
    InList {
        expr: Box<SqlExpr>,
        list: Vec<SqlExpr>,
        negated: bool,
    },
    ILike {
        expr: Box<SqlExpr>,
        pattern: Box<SqlExpr>,
        negated: bool,
    },
    /// Position in the SELECT list, 1-based.
    Ordinal(usize),
}

impl SqlExpr {
    pub fn raw(sql: impl Into<String>) -> Self {
        SqlExpr::Raw(sql.into())
    }

    pub fn binary(op: SqlBinaryOperator, left: SqlExpr, right: SqlExpr) -> Self {
        SqlExpr::BinaryOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn is_null(expr: SqlExpr, negated: bool) -> Self {
        SqlExpr::IsNull {
            expr: Box::new(expr),
            negated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlBinaryOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl SqlBinaryOperator {
    fn as_sql(&self) -> &'static str {
        match self {
            SqlBinaryOperator::Eq => "=",
            SqlBinaryOperator::Neq => "<>",
            SqlBinaryOperator::Gt => ">",
            SqlBinaryOperator::Gte => ">=",
            SqlBinaryOperator::Lt => "<",
            SqlBinaryOperator::Lte => "<=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectItem {
    pub expr: SqlExpr,
    pub alias: Option<String>,
}

/// A FROM or JOIN target. `source` is already rendered SQL: a table name or
/// a parenthesised subquery.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableRef {
    pub source: String,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlJoinType {
    Inner,
    Left,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub join_type: SqlJoinType,
    pub table: TableRef,
    pub on: Vec<SqlExpr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderItem {
    pub expr: SqlExpr,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectQuery {
    pub select: Vec<SelectItem>,
    pub from: TableRef,
    pub joins: Vec<Join>,
    pub filters: Vec<SqlExpr>,
    pub group_by: Vec<SqlExpr>,
    pub having: Vec<SqlExpr>,
    pub order_by: Vec<OrderItem>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

pub struct SqlRenderer<'d> {
    dialect: &'d dyn Dialect,
}

impl<'d> SqlRenderer<'d> {
    pub fn new(dialect: &'d dyn Dialect) -> Self {
        Self { dialect }
    }

    pub fn render_select(&self, query: &SelectQuery) -> String {
        let select_items: Vec<String> = query
            .select
            .iter()
            .map(|item| {
                let expr_sql = self.render_expr(&item.expr);
                match &item.alias {
                    Some(alias) => format!("{expr_sql} {}", self.alias_clause(alias)),
                    None => expr_sql,
                }
            })
            .collect();

        let mut sql = format!(
            "SELECT {} FROM {}",
            select_items.join(", "),
            self.render_table_ref(&query.from)
        );

        for join in &query.joins {
            let join_kw = match join.join_type {
                SqlJoinType::Inner => "INNER JOIN",
                SqlJoinType::Left => "LEFT JOIN",
            };
            let on_clause: Vec<String> = join.on.iter().map(|e| self.render_expr(e)).collect();
            sql.push_str(&format!(
                " {join_kw} {} ON {}",
                self.render_table_ref(&join.table),
                on_clause.join(" AND ")
            ));
        }

        if !query.filters.is_empty() {
            sql.push_str(&format!(" WHERE {}", self.render_conjunction(&query.filters)));
        }

        if !query.group_by.is_empty() {
            let groups: Vec<String> = query.group_by.iter().map(|g| self.render_expr(g)).collect();
            sql.push_str(&format!(" GROUP BY {}", groups.join(", ")));
        }

        if !query.having.is_empty() {
            sql.push_str(&format!(" HAVING {}", self.render_conjunction(&query.having)));
        }

        if !query.order_by.is_empty() {
            let orders: Vec<String> = query
                .order_by
                .iter()
                .map(|o| {
                    let expr = self.render_expr(&o.expr);
                    let dir = match o.direction {
                        SortDirection::Asc => "ASC",
                        SortDirection::Desc => "DESC",
                    };
                    format!("{expr} {dir}")
                })
                .collect();
            sql.push_str(&format!(" ORDER BY {}", orders.join(", ")));
        }

        if let Some(clause) = self.dialect.limit_offset(query.limit, query.offset) {
            sql.push(' ');
            sql.push_str(&clause);
        }

        sql
    }

    fn alias_clause(&self, alias: &str) -> String {
        format!("AS {}", self.dialect.quote_ident(alias))
    }

    fn render_table_ref(&self, table: &TableRef) -> String {
        match &table.alias {
            Some(alias) => format!("{} {}", table.source, self.alias_clause(alias)),
            None => table.source.clone(),
        }
    }

    fn render_conjunction(&self, exprs: &[SqlExpr]) -> String {
        exprs
            .iter()
            .map(|e| self.render_expr(e))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    pub fn render_expr(&self, expr: &SqlExpr) -> String {
        match expr {
            SqlExpr::Raw(sql) => sql.clone(),
            SqlExpr::Param(marker) => marker.clone(),
            SqlExpr::TimestampParam(marker) => self.dialect.timestamp_cast(marker),
            SqlExpr::Concat(parts) => {
                let rendered: Vec<String> = parts.iter().map(|p| self.render_expr(p)).collect();
                self.dialect.concat(&rendered)
            }
            SqlExpr::BinaryOp { op, left, right } => format!(
                "{} {} {}",
                self.render_expr(left),
                op.as_sql(),
                self.render_expr(right)
            ),
            SqlExpr::And(items) => self.render_group(items, " AND "),
            SqlExpr::Or(items) => self.render_group(items, " OR "),
            SqlExpr::IsNull { expr, negated } => {
                let not_kw = if *negated { "NOT " } else { "" };
                format!("{} IS {not_kw}NULL", self.render_expr(expr))
            }
            SqlExpr::InList {
                expr,
                list,
                negated,
            } => {
                let rendered_values: Vec<String> =
                    list.iter().map(|v| self.render_expr(v)).collect();
                let not_kw = if *negated { "NOT " } else { "" };
                format!(
                    "{} {}IN ({})",
                    self.render_expr(expr),
                    not_kw,
                    rendered_values.join(", ")
                )
            }
            SqlExpr::ILike {
                expr,
                pattern,
                negated,
            } => self.dialect.ilike(
                &self.render_expr(expr),
                &self.render_expr(pattern),
                *negated,
            ),
            SqlExpr::Ordinal(n) => n.to_string(),
        }
    }

    fn render_group(&self, items: &[SqlExpr], sep: &str) -> String {
        match items {
            [] => "1 = 1".to_string(),
            [single] => self.render_expr(single),
            _ => {
                let parts: Vec<String> = items.iter().map(|i| self.render_expr(i)).collect();
                format!("({})", parts.join(sep))
            }
        }
    }
}

/// Hands out parameter markers and later rewrites them into placeholders.
#[derive(Debug, Clone, Default)]
pub struct ParamAllocator {
    values: Vec<Value>,
}

impl ParamAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `value` and return the marker to embed in SQL.
    pub fn allocate(&mut self, value: impl Into<Value>) -> String {
        self.values.push(value.into());
        format!("{MARK}{}{MARK}", self.values.len() - 1)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Replace markers in `sql` with the dialect's placeholders, returning the
    /// bound values in placeholder order. Numbered dialects reuse a placeholder
    /// for a repeated marker; positional ones bind the value again.
    pub fn finalize(&self, sql: &str, dialect: &dyn Dialect) -> (String, Vec<Value>) {
        let mut out = String::with_capacity(sql.len());
        let mut params: Vec<Value> = Vec::new();
        let mut assigned: Vec<Option<usize>> = vec![None; self.values.len()];
        let mut rest = sql;

        while let Some(start) = rest.find(MARK) {
            out.push_str(&rest[..start]);
            let after = &rest[start + MARK.len_utf8()..];
            let Some(end) = after.find(MARK) else {
                out.push_str(&rest[start..]);
                rest = "";
                break;
            };
            match after[..end].parse::<usize>().ok().filter(|i| *i < self.values.len()) {
                Some(idx) => {
                    let position = match assigned[idx] {
                        Some(p) if dialect.numbered_placeholders() => p,
                        _ => {
                            params.push(self.values[idx].clone());
                            let p = params.len() - 1;
                            assigned[idx] = Some(p);
                            p
                        }
                    };
                    out.push_str(&dialect.placeholder(position));
                }
                None => out.push_str(&rest[start..start + MARK.len_utf8() + end + MARK.len_utf8()]),
            }
            rest = &after[end + MARK.len_utf8()..];
        }
        out.push_str(rest);
        (out, params)
    }
}

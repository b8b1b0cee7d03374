//! DuckDB dialect implementation.

use super::Dialect;

#[derive(Debug, Default, Clone, Copy)]
pub struct DuckDbDialect;

impl Dialect for DuckDbDialect {
    fn name(&self) -> &'static str {
        "duckdb"
    }

    fn supports_filtered_aggregates(&self) -> bool {
        true
    }

    fn convert_tz(&self, expr: &str, tz: &str) -> String {
        format!("timezone({tz}, {expr}::timestamptz)")
    }

    // DuckDB LIKE has no default escape character.
    fn ilike(&self, expr: &str, pattern: &str, negated: bool) -> String {
        let not = if negated { "NOT " } else { "" };
        format!("{expr} {not}ILIKE {pattern} ESCAPE '\\'")
    }
}

//! BigQuery dialect implementation.

use crate::time::Granularity;

use super::Dialect;

#[derive(Debug, Default, Clone, Copy)]
pub struct BigQueryDialect;

impl Dialect for BigQueryDialect {
    fn name(&self) -> &'static str {
        "bigquery"
    }

    fn quote_ident(&self, ident: &str) -> String {
        // BigQuery uses backticks for identifiers
        format!("`{}`", ident.replace('`', "\\`"))
    }

    fn placeholder(&self, idx: usize) -> String {
        // Named parameters: @p0, @p1, ...
        format!("@p{idx}")
    }

    fn numbered_placeholders(&self) -> bool {
        true
    }

    fn time_truncate(&self, granularity: Granularity, expr: &str) -> String {
        let part = match granularity {
            Granularity::Week => "ISOWEEK".to_string(),
            other => other.as_str().to_ascii_uppercase(),
        };
        format!("DATETIME_TRUNC({expr}, {part})")
    }

    fn convert_tz(&self, expr: &str, tz: &str) -> String {
        format!("DATETIME({expr}, {tz})")
    }

    fn timestamp_cast(&self, expr: &str) -> String {
        format!("TIMESTAMP({expr})")
    }

    fn concat(&self, parts: &[String]) -> String {
        format!("CONCAT({})", parts.join(", "))
    }

    fn ilike(&self, expr: &str, pattern: &str, negated: bool) -> String {
        let not = if negated { "NOT " } else { "" };
        format!("LOWER({expr}) {not}LIKE LOWER({pattern})")
    }
}

//! SQL dialect abstractions for different database backends.
//!
//! The query builder never spells engine-specific syntax itself; everything that
//! differs between warehouses (placeholders, quoting, time bucketing, casts,
//! string operators) goes through a [`Dialect`]. Each dialect lives in its own
//! file.

use chrono::NaiveDateTime;

use crate::models::MeasureType;
use crate::time::{Granularity, Timezone};

/// Dialects render identifiers and primitive expression pieces.
/// Clause assembly lives in the query builder; the dialect only maps logical
/// constructs to SQL fragments.
pub trait Dialect: Send + Sync {
    fn name(&self) -> &'static str;

    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// Placeholder for the parameter at zero-based position `idx`.
    fn placeholder(&self, _idx: usize) -> String {
        "?".to_string()
    }

    /// True when placeholders name a parameter (`$1`, `@p0`) and may therefore
    /// appear more than once; positional `?` placeholders are bound in text order.
    fn numbered_placeholders(&self) -> bool {
        false
    }

    fn supports_filtered_aggregates(&self) -> bool {
        false
    }

    /// Truncate a local timestamp expression to the start of its bucket.
    fn time_truncate(&self, granularity: Granularity, expr: &str) -> String {
        format!("date_trunc('{}', {expr})", granularity.as_str())
    }

    /// Convert a stored (UTC) timestamp into the query timezone. `tz` is the
    /// already-rendered timezone placeholder.
    fn convert_tz(&self, expr: &str, tz: &str) -> String;

    /// Value bound for the timezone placeholder.
    fn timezone_param(&self, tz: &Timezone) -> String {
        tz.name()
    }

    /// Cast a bound timestamp parameter to the engine's timestamp type.
    fn timestamp_cast(&self, expr: &str) -> String {
        format!("{expr}::timestamptz")
    }

    /// Text value bound for a UTC instant.
    fn timestamp_param(&self, utc: NaiveDateTime) -> String {
        format!("{}Z", crate::time::format_timestamp(utc))
    }

    fn concat(&self, parts: &[String]) -> String {
        parts.join(" || ")
    }

    fn boolean_literal(&self, value: bool) -> String {
        if value { "TRUE" } else { "FALSE" }.to_string()
    }

    /// Case-insensitive pattern match of `expr` against the pattern expression.
    fn ilike(&self, expr: &str, pattern: &str, negated: bool) -> String {
        let not = if negated { "NOT " } else { "" };
        format!("{expr} {not}ILIKE {pattern}")
    }

    fn render_aggregation(&self, measure_type: MeasureType, expr: Option<&str>) -> String {
        match (measure_type, expr) {
            (MeasureType::Count, None) => "COUNT(*)".to_string(),
            (MeasureType::Count, Some(e)) => format!("COUNT({e})"),
            (MeasureType::CountDistinct, Some(e)) => format!("COUNT(DISTINCT {e})"),
            (MeasureType::Sum, Some(e)) => format!("SUM({e})"),
            (MeasureType::Avg, Some(e)) => format!("AVG({e})"),
            (MeasureType::Min, Some(e)) => format!("MIN({e})"),
            (MeasureType::Max, Some(e)) => format!("MAX({e})"),
            (MeasureType::Number, Some(e)) => e.to_string(),
            (_, None) => "NULL".to_string(),
        }
    }

    fn limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> Option<String> {
        match (limit, offset) {
            (None, None) => None,
            (Some(l), None) => Some(format!("LIMIT {l}")),
            (Some(l), Some(o)) => Some(format!("LIMIT {l} OFFSET {o}")),
            (None, Some(o)) => Some(format!("OFFSET {o}")),
        }
    }
}

/// Look up a built-in dialect by name.
pub fn dialect_for(name: &str) -> Option<Box<dyn Dialect>> {
    match name.to_ascii_lowercase().as_str() {
        "postgres" | "postgresql" => Some(Box::new(PostgresDialect)),
        "duckdb" => Some(Box::new(DuckDbDialect)),
        "bigquery" => Some(Box::new(BigQueryDialect)),
        "mysql" => Some(Box::new(MySqlDialect)),
        _ => None,
    }
}

mod bigquery;
mod duckdb;
mod mysql;
mod postgres;

pub use bigquery::BigQueryDialect;
pub use duckdb::DuckDbDialect;
pub use mysql::MySqlDialect;
pub use postgres::PostgresDialect;

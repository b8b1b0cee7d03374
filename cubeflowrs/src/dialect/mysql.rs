use chrono::NaiveDateTime;

use crate::time::{format_timestamp, Granularity, Timezone};

use super::Dialect;

#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlDialect;

impl Dialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    // MySQL has no date_trunc; rebuild the bucket start from its parts.
    fn time_truncate(&self, granularity: Granularity, expr: &str) -> String {
        let format = match granularity {
            Granularity::Second => "%Y-%m-%d %H:%i:%s",
            Granularity::Minute => "%Y-%m-%d %H:%i:00",
            Granularity::Hour => "%Y-%m-%d %H:00:00",
            Granularity::Day => "%Y-%m-%d 00:00:00",
            Granularity::Month => "%Y-%m-01 00:00:00",
            Granularity::Year => "%Y-01-01 00:00:00",
            Granularity::Week => {
                return format!(
                    "CAST(DATE_SUB(DATE({expr}), INTERVAL WEEKDAY({expr}) DAY) AS DATETIME)"
                )
            }
            Granularity::Quarter => {
                return format!(
                    "CAST(CONCAT(YEAR({expr}), '-', LPAD(QUARTER({expr}) * 3 - 2, 2, '0'), '-01 00:00:00') AS DATETIME)"
                )
            }
        };
        format!("CAST(DATE_FORMAT({expr}, '{format}') AS DATETIME)")
    }

    fn convert_tz(&self, expr: &str, tz: &str) -> String {
        format!("CONVERT_TZ({expr}, '+00:00', {tz})")
    }

    // Named zones need the server's tz tables loaded.
    fn timezone_param(&self, tz: &Timezone) -> String {
        tz.iso_offset().unwrap_or_else(|| tz.name())
    }

    fn timestamp_cast(&self, expr: &str) -> String {
        format!("TIMESTAMP({expr})")
    }

    fn timestamp_param(&self, utc: NaiveDateTime) -> String {
        format_timestamp(utc)
    }

    fn concat(&self, parts: &[String]) -> String {
        format!("CONCAT({})", parts.join(", "))
    }

    fn boolean_literal(&self, value: bool) -> String {
        if value { "1" } else { "0" }.to_string()
    }

    // Default collations compare case-insensitively.
    fn ilike(&self, expr: &str, pattern: &str, negated: bool) -> String {
        let not = if negated { "NOT " } else { "" };
        format!("{expr} {not}LIKE {pattern}")
    }

    fn limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> Option<String> {
        match (limit, offset) {
            (None, None) => None,
            (Some(l), None) => Some(format!("LIMIT {l}")),
            (Some(l), Some(o)) => Some(format!("LIMIT {l} OFFSET {o}")),
            // MySQL requires a LIMIT before OFFSET.
            (None, Some(o)) => Some(format!("LIMIT 18446744073709551615 OFFSET {o}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_mysql_pieces() {
        let d = MySqlDialect;
        assert_eq!(d.placeholder(3), "?");
        assert_eq!(
            d.time_truncate(Granularity::Month, "t"),
            "CAST(DATE_FORMAT(t, '%Y-%m-01 00:00:00') AS DATETIME)"
        );
        assert_eq!(d.timezone_param(&Timezone::Utc), "+00:00");
        assert_eq!(
            d.limit_offset(None, Some(5)).unwrap(),
            "LIMIT 18446744073709551615 OFFSET 5"
        );
    }
}

//! PostgreSQL dialect implementation.

use crate::time::Timezone;

use super::Dialect;

#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn placeholder(&self, idx: usize) -> String {
        format!("${}", idx + 1) // PostgreSQL uses $1, $2, ...
    }

    fn numbered_placeholders(&self) -> bool {
        true
    }

    fn supports_filtered_aggregates(&self) -> bool {
        true // PostgreSQL 9.4+ supports FILTER
    }

    fn convert_tz(&self, expr: &str, tz: &str) -> String {
        format!("({expr}::timestamptz AT TIME ZONE {tz})")
    }

    /// `AT TIME ZONE` reads bare offsets with POSIX sign rules (positive is
    /// west of Greenwich), so offsets are bound as `<+05:30>-05:30`.
    fn timezone_param(&self, tz: &Timezone) -> String {
        match tz {
            Timezone::Utc | Timezone::Named(_) => tz.name(),
            Timezone::Fixed(_) => {
                let iso = tz.name();
                let inverted = match iso.strip_prefix('+') {
                    Some(rest) => format!("-{rest}"),
                    None => format!("+{}", iso.trim_start_matches('-')),
                };
                format!("<{iso}>{inverted}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Granularity;

    #[test]
    fn renders_postgres_pieces() {
        let d = PostgresDialect;
        assert_eq!(d.placeholder(0), "$1");
        assert_eq!(d.quote_ident("Or\"ders"), "\"Or\"\"ders\"");
        assert_eq!(
            d.time_truncate(Granularity::Month, "x"),
            "date_trunc('month', x)"
        );
        assert_eq!(
            d.timezone_param(&Timezone::parse("+05:30").unwrap()),
            "<+05:30>-05:30"
        );
        assert_eq!(
            d.timezone_param(&Timezone::parse("-08:00").unwrap()),
            "<-08:00>+08:00"
        );
        assert_eq!(
            d.timezone_param(&Timezone::parse("Europe/Berlin").unwrap()),
            "Europe/Berlin"
        );
    }
}

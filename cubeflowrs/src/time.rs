//! Calendar arithmetic shared by the compiler, matcher and partition generator.
//!
//! All bucket math is done on naive (wall clock) timestamps. Queries carry a
//! [`Timezone`] that converts wall clock bounds into UTC before they are bound
//! as SQL parameters.

use std::fmt;
use std::str::FromStr;

use chrono::{
    Datelike, Duration, FixedOffset, LocalResult, Months, NaiveDate, NaiveDateTime, Offset, TimeZone,
    Timelike,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::CompileError;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Second => "second",
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
            Granularity::Quarter => "quarter",
            Granularity::Year => "year",
        }
    }

    /// Granularities whose buckets nest exactly inside one bucket of `self`.
    /// Weeks straddle months, so week only derives from day and finer.
    fn derivable_from(&self) -> &'static [Granularity] {
        use Granularity::*;
        match self {
            Second => &[Second],
            Minute => &[Minute, Second],
            Hour => &[Hour, Minute, Second],
            Day => &[Day, Hour, Minute, Second],
            Week => &[Week, Day, Hour, Minute, Second],
            Month => &[Month, Day, Hour, Minute, Second],
            Quarter => &[Quarter, Month, Day, Hour, Minute, Second],
            Year => &[Year, Quarter, Month, Day, Hour, Minute, Second],
        }
    }

    /// True when data stored at `source` granularity can be re-aggregated to
    /// `self` without splitting a stored bucket.
    pub fn can_roll_up_from(&self, source: Granularity) -> bool {
        self.derivable_from().contains(&source)
    }

    /// Start of the bucket containing `ts`.
    pub fn truncate(&self, ts: NaiveDateTime) -> NaiveDateTime {
        let date = ts.date();
        match self {
            Granularity::Second => ts.with_nanosecond(0).unwrap_or(ts),
            Granularity::Minute => midnight(date) + hms(ts.hour(), ts.minute(), 0),
            Granularity::Hour => midnight(date) + hms(ts.hour(), 0, 0),
            Granularity::Day => midnight(date),
            Granularity::Week => {
                midnight(date) - Duration::days(i64::from(date.weekday().num_days_from_monday()))
            }
            Granularity::Month => midnight(first_of_month(date.year(), date.month())),
            Granularity::Quarter => {
                let month = (date.month0() / 3) * 3 + 1;
                midnight(first_of_month(date.year(), month))
            }
            Granularity::Year => midnight(first_of_month(date.year(), 1)),
        }
    }

    /// Start of the bucket after the one that starts at `start`.
    pub fn advance(&self, start: NaiveDateTime) -> Option<NaiveDateTime> {
        match self {
            Granularity::Second => start.checked_add_signed(Duration::seconds(1)),
            Granularity::Minute => start.checked_add_signed(Duration::minutes(1)),
            Granularity::Hour => start.checked_add_signed(Duration::hours(1)),
            Granularity::Day => start.checked_add_signed(Duration::days(1)),
            Granularity::Week => start.checked_add_signed(Duration::weeks(1)),
            Granularity::Month => start.checked_add_months(Months::new(1)),
            Granularity::Quarter => start.checked_add_months(Months::new(3)),
            Granularity::Year => start.checked_add_months(Months::new(12)),
        }
    }

    /// Length of the timestamp prefix used for partition table suffixes.
    pub fn suffix_len(&self) -> usize {
        match self {
            Granularity::Second | Granularity::Minute => 12,
            Granularity::Hour => 10,
            _ => 8,
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = CompileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "second" => Ok(Granularity::Second),
            "minute" => Ok(Granularity::Minute),
            "hour" => Ok(Granularity::Hour),
            "day" => Ok(Granularity::Day),
            "week" => Ok(Granularity::Week),
            "month" => Ok(Granularity::Month),
            "quarter" => Ok(Granularity::Quarter),
            "year" => Ok(Granularity::Year),
            other => Err(CompileError::MalformedQuery(format!(
                "unknown granularity '{other}'"
            ))),
        }
    }
}

fn midnight(date: NaiveDate) -> NaiveDateTime {
    date.and_time(chrono::NaiveTime::MIN)
}

fn hms(h: u32, m: u32, s: u32) -> Duration {
    Duration::seconds(i64::from(h * 3600 + m * 60 + s))
}

fn first_of_month(year: i32, month: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MIN)
}

/// A closed wall-clock interval, millisecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDateTime,
    pub to: NaiveDateTime,
}

impl DateRange {
    pub fn new(from: NaiveDateTime, to: NaiveDateTime) -> Result<Self, CompileError> {
        if from > to {
            return Err(CompileError::MalformedQuery(format!(
                "date range start {} is after end {}",
                format_timestamp(from),
                format_timestamp(to)
            )));
        }
        Ok(Self { from, to })
    }

    /// Parses a request date range. A bare `YYYY-MM-DD` start means the
    /// beginning of that day; a bare end date means its last millisecond.
    pub fn parse(from: &str, to: &str) -> Result<Self, CompileError> {
        let from = parse_bound(from, false)?;
        let to = parse_bound(to, true)?;
        Self::new(from, to)
    }

    pub fn intersect(&self, other: &DateRange) -> Option<DateRange> {
        let from = self.from.max(other.from);
        let to = self.to.min(other.to);
        (from <= to).then_some(DateRange { from, to })
    }

    pub fn contains(&self, other: &DateRange) -> bool {
        self.from <= other.from && other.to <= self.to
    }

    /// True when both ends sit on `granularity` bucket boundaries, so a rollup
    /// at that granularity covers exactly the requested rows.
    pub fn is_aligned_to(&self, granularity: Granularity) -> bool {
        let after_end = self.to + Duration::milliseconds(1);
        granularity.truncate(self.from) == self.from && granularity.truncate(after_end) == after_end
    }

    pub fn from_str_value(&self) -> String {
        format_timestamp(self.from)
    }

    pub fn to_str_value(&self) -> String {
        format_timestamp(self.to)
    }
}

fn parse_bound(raw: &str, end_of_day: bool) -> Result<NaiveDateTime, CompileError> {
    let trimmed = raw.trim().trim_end_matches('Z');
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        let start = midnight(date);
        return Ok(if end_of_day {
            start + Duration::days(1) - Duration::milliseconds(1)
        } else {
            start
        });
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Ok(ts);
        }
    }
    Err(CompileError::MalformedQuery(format!(
        "cannot parse date '{raw}'"
    )))
}

/// Parse a timestamp or bare date; a bare date means its midnight.
pub fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, CompileError> {
    parse_bound(raw, false)
}

pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Query timezone. IANA names go through the tz database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timezone {
    Utc,
    Fixed(FixedOffset),
    Named(Tz),
}

impl Timezone {
    pub fn parse(raw: &str) -> Result<Self, CompileError> {
        let trimmed = raw.trim();
        match trimmed {
            "UTC" | "Etc/UTC" | "GMT" | "Etc/GMT" | "Z" | "utc" => return Ok(Timezone::Utc),
            _ => {}
        }
        let offset = trimmed
            .strip_prefix("UTC")
            .or_else(|| trimmed.strip_prefix("GMT"))
            .unwrap_or(trimmed);
        if let Some(secs) = parse_offset(offset) {
            return Ok(if secs == 0 {
                Timezone::Utc
            } else {
                FixedOffset::east_opt(secs).map_or(Timezone::Utc, Timezone::Fixed)
            });
        }
        trimmed
            .parse::<Tz>()
            .map(Timezone::Named)
            .map_err(|_| CompileError::MalformedQuery(format!("unsupported timezone '{raw}'")))
    }

    /// Offset from UTC in effect at the given UTC instant.
    pub fn offset_seconds_at(&self, utc: NaiveDateTime) -> i32 {
        match self {
            Timezone::Utc => 0,
            Timezone::Fixed(offset) => offset.local_minus_utc(),
            Timezone::Named(tz) => tz.offset_from_utc_datetime(&utc).fix().local_minus_utc(),
        }
    }

    /// `UTC`, `+05:30` or the zone name.
    pub fn name(&self) -> String {
        match self {
            Timezone::Utc => "UTC".to_string(),
            Timezone::Fixed(offset) => format_offset(offset.local_minus_utc()),
            Timezone::Named(tz) => tz.name().to_string(),
        }
    }

    /// `+00:00` style offset. Named zones have none.
    pub fn iso_offset(&self) -> Option<String> {
        match self {
            Timezone::Utc => Some(format_offset(0)),
            Timezone::Fixed(offset) => Some(format_offset(offset.local_minus_utc())),
            Timezone::Named(_) => None,
        }
    }

    /// Wall clock time in this zone to UTC. An ambiguous local time takes the
    /// earlier instant; a time inside a DST gap uses the offset before the gap.
    pub fn to_utc(&self, local: NaiveDateTime) -> NaiveDateTime {
        match self {
            Timezone::Named(tz) => match tz.from_local_datetime(&local) {
                LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt.naive_utc(),
                LocalResult::None => {
                    let before = local - Duration::hours(3);
                    local - Duration::seconds(i64::from(self.offset_seconds_at(before)))
                }
            },
            _ => local - Duration::seconds(i64::from(self.offset_seconds_at(local))),
        }
    }

    /// UTC instant to wall clock time in this zone.
    pub fn to_local(&self, utc: NaiveDateTime) -> NaiveDateTime {
        utc + Duration::seconds(i64::from(self.offset_seconds_at(utc)))
    }
}

impl fmt::Display for Timezone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

fn format_offset(secs: i32) -> String {
    let sign = if secs < 0 { '-' } else { '+' };
    let abs = secs.abs();
    format!("{sign}{:02}:{:02}", abs / 3600, (abs % 3600) / 60)
}

fn parse_offset(raw: &str) -> Option<i32> {
    let (sign, rest) = match raw.as_bytes().first()? {
        b'+' => (1, &raw[1..]),
        b'-' => (-1, &raw[1..]),
        _ => return None,
    };
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit() || b == b':') {
        return None;
    }
    let (hours, minutes): (u32, u32) = match rest.split_once(':') {
        Some((h, m)) => (h.parse().ok()?, m.parse().ok()?),
        None if rest.len() == 4 => (rest[..2].parse().ok()?, rest[2..].parse().ok()?),
        None => (rest.parse().ok()?, 0),
    };
    if hours > 14 || minutes >= 60 {
        return None;
    }
    let secs = i32::try_from(hours * 3600 + minutes * 60).ok()?;
    Some(sign * secs)
}

use std::fmt;

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::{CubeflowError, Result};
use crate::time::{format_timestamp, DateRange, Granularity};

use super::PreAggregation;

/// Half-open `[start, end)` slice of a rollup, in the rollup's timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub granularity: Granularity,
}

impl PartitionWindow {
    /// Table-name suffix: `YYYYMMDD`, or `YYYYMMDDHH` for hourly partitions.
    pub fn suffix(&self) -> String {
        match self.granularity.suffix_len() {
            8 => self.start.format("%Y%m%d").to_string(),
            10 => self.start.format("%Y%m%d%H").to_string(),
            _ => self.start.format("%Y%m%d%H%M").to_string(),
        }
    }

    /// The closed range of rows this window loads.
    pub fn as_date_range(&self) -> DateRange {
        DateRange {
            from: self.start,
            to: self.end - Duration::milliseconds(1),
        }
    }

    pub fn overlaps(&self, range: &DateRange) -> bool {
        self.start <= range.to && range.from < self.end
    }
}

impl fmt::Display for PartitionWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            format_timestamp(self.start),
            format_timestamp(self.end)
        )
    }
}

/// Identity of one buildable unit: a whole rollup, or one of its windows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub pre_aggregation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<PartitionWindow>,
}

impl PartitionKey {
    pub fn new(pre_aggregation: impl Into<String>, window: Option<PartitionWindow>) -> Self {
        Self {
            pre_aggregation: pre_aggregation.into(),
            window,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.window {
            Some(window) => write!(f, "{}{}", self.pre_aggregation, window),
            None => f.write_str(&self.pre_aggregation),
        }
    }
}

/// Contiguous windows aligned to the rollup's partition granularity that cover
/// `requested`. Rollups without partitioning yield nothing.
pub fn partitions(
    pre_aggregation: &PreAggregation,
    requested: &DateRange,
    max_partitions: usize,
) -> Result<Vec<PartitionWindow>> {
    let Some(granularity) = pre_aggregation.partition_granularity else {
        return Ok(Vec::new());
    };
    windows(granularity, requested, max_partitions).ok_or_else(|| CubeflowError::TooManyPartitions {
        id: pre_aggregation.id.clone(),
        max: max_partitions,
    })
}

/// `None` when more than `max` windows would be needed.
pub(crate) fn windows(
    granularity: Granularity,
    requested: &DateRange,
    max: usize,
) -> Option<Vec<PartitionWindow>> {
    let mut out = Vec::new();
    let mut start = granularity.truncate(requested.from);
    while start <= requested.to {
        if out.len() == max {
            return None;
        }
        let Some(end) = granularity.advance(start) else {
            break;
        };
        out.push(PartitionWindow {
            start,
            end,
            granularity,
        });
        start = end;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    #[test]
    fn three_contiguous_days() {
        let range = DateRange::parse("2024-01-01", "2024-01-03").unwrap();
        let w = windows(Granularity::Day, &range, 100).unwrap();
        assert_eq!(w.len(), 3);
        assert_eq!(w[0].start, at(2024, 1, 1, 0));
        assert_eq!(w[0].end, w[1].start);
        assert_eq!(w[1].end, w[2].start);
        assert_eq!(w[2].end, at(2024, 1, 4, 0));
        assert_eq!(w[2].suffix(), "20240103");
    }

    #[test]
    fn unaligned_range_expands_to_boundaries() {
        let range = DateRange::parse("2024-01-01T10:30:00", "2024-01-01T12:10:00").unwrap();
        let w = windows(Granularity::Hour, &range, 100).unwrap();
        assert_eq!(w.len(), 3);
        assert_eq!(w[0].start, at(2024, 1, 1, 10));
        assert_eq!(w[0].suffix(), "2024010110");
    }

    #[test]
    fn weeks_start_on_monday() {
        // 2024-01-03 is a Wednesday.
        let range = DateRange::parse("2024-01-03", "2024-01-10").unwrap();
        let w = windows(Granularity::Week, &range, 100).unwrap();
        assert_eq!(w[0].start, at(2024, 1, 1, 0));
        assert_eq!(w.len(), 2);
    }

    #[test]
    fn enforces_limit() {
        let range = DateRange::parse("2024-01-01", "2024-12-31").unwrap();
        assert!(windows(Granularity::Day, &range, 30).is_none());
        assert_eq!(windows(Granularity::Month, &range, 12).unwrap().len(), 12);
    }

    #[test]
    fn key_display() {
        let range = DateRange::parse("2024-01-01", "2024-01-01").unwrap();
        let w = windows(Granularity::Day, &range, 1).unwrap()[0];
        let key = PartitionKey::new("Orders.main", Some(w));
        assert_eq!(
            key.to_string(),
            "Orders.main[2024-01-01T00:00:00.000, 2024-01-02T00:00:00.000)"
        );
    }
}

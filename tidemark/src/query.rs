//! Range queries and bucketed aggregation over the level history.
//!
//! This module holds the read-path types and the pure aggregation logic. The
//! store runs the SQL and hands the rows to [`bucketize`] and [`summarize`].
//!
//! # Time bounds
//!
//! All timestamps are local wall-clock [`NaiveDateTime`] values with second
//! precision, persisted as `YYYY-MM-DD HH:MM:SS`. Callers may bound a query
//! by a full timestamp or by a bare date; [`TimeRange::from_bounds`] expands a
//! date to `00:00:00` as a start and to `23:59:59` as an end, once, at the
//! boundary. Aggregation is half-open, so a date end is aggregated up to the
//! following midnight and rows at `23:59:59` still land in their day.
//!
//! # Buckets
//!
//! A [`Granularity`] defines calendar-aligned buckets: minutes and hours on
//! the clock, days from midnight, weeks from Monday 00:00, months from the
//! first of the month. Each bucket is half-open, `[start, end)`. Buckets
//! without rows are omitted, never reported with empty statistics.
//!
//! # Range caps
//!
//! Fine granularities over long ranges produce an excessive bucket count.
//! [`RangeCaps`] maps a granularity to the maximum span in days. A longer
//! request is narrowed to its last `cap` days and the narrowing is reported
//! as a [`RangeAdjustment`] alongside the result.
//!
//! # Example
//!
//! ```rust
//! use tidemark::query::{Granularity, RangeCaps, TimeRange};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let range = TimeRange::from_bounds("2024-01-01".parse()?, "2024-01-31".parse()?)?;
//! let (narrowed, adjustment) = RangeCaps::default().apply(range, Granularity::Minute);
//!
//! assert!(adjustment.is_some());
//! assert_eq!(narrowed.end(), range.end());
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Days, Months, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, QueryError, Result};
use crate::store::LevelReading;

/// Persisted timestamp format.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Default cap on minute-granularity queries, in days.
pub const DEFAULT_MINUTE_CAP_DAYS: u32 = 7;

/// Formats a timestamp the way it is persisted.
pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(TIME_FORMAT).to_string()
}

/// Parses a persisted timestamp.
///
/// # Errors
///
/// Returns [`QueryError::Parse`] if `s` is not `YYYY-MM-DD HH:MM:SS`.
pub fn parse_timestamp(s: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, TIME_FORMAT).map_err(|e| {
        QueryError::Parse {
            input: s.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

/// One end of a query range: a bare date or a full timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBound {
    /// A calendar day; expands to the whole day.
    Date(NaiveDate),
    /// An exact timestamp.
    DateTime(NaiveDateTime),
}

impl TimeBound {
    /// The bound used as a range start (`00:00:00` for dates).
    pub fn as_start(self) -> NaiveDateTime {
        match self {
            Self::Date(date) => date.and_time(NaiveTime::MIN),
            Self::DateTime(ts) => ts,
        }
    }

    /// The bound used as a range end (`23:59:59` for dates).
    pub fn as_end(self) -> NaiveDateTime {
        match self {
            Self::Date(date) => date.and_time(end_of_day()),
            Self::DateTime(ts) => ts,
        }
    }

    /// The bound used as a half-open range end (next midnight for dates).
    pub fn as_end_exclusive(self) -> NaiveDateTime {
        match self {
            Self::Date(date) => date
                .and_time(NaiveTime::MIN)
                .checked_add_days(Days::new(1))
                .unwrap_or(NaiveDateTime::MAX),
            Self::DateTime(ts) => ts,
        }
    }
}

fn end_of_day() -> NaiveTime {
    NaiveTime::MIN + TimeDelta::seconds(86_399)
}

impl From<NaiveDate> for TimeBound {
    fn from(date: NaiveDate) -> Self {
        Self::Date(date)
    }
}

impl From<NaiveDateTime> for TimeBound {
    fn from(ts: NaiveDateTime) -> Self {
        Self::DateTime(ts)
    }
}

impl FromStr for TimeBound {
    type Err = crate::error::TidemarkError;

    /// Accepts `YYYY-MM-DD`, `YYYY-MM-DD HH:MM[:SS]` and the `T`-separated forms.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        for format in [TIME_FORMAT, "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M"] {
            if let Ok(ts) = NaiveDateTime::parse_from_str(s, format) {
                return Ok(Self::DateTime(ts));
            }
        }
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Self::Date)
            .map_err(|_| {
                QueryError::Parse {
                    input: s.to_string(),
                    reason: "expected YYYY-MM-DD or YYYY-MM-DD HH:MM:SS".to_string(),
                }
                .into()
            })
    }
}

/// A resolved, inclusive time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    start: NaiveDateTime,
    end: NaiveDateTime,
    end_exclusive: NaiveDateTime,
}

impl TimeRange {
    /// Creates a range from two timestamps.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidTimeRange`] if `start > end`.
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Result<Self> {
        if start > end {
            return Err(QueryError::InvalidTimeRange { start, end }.into());
        }
        Ok(Self {
            start,
            end,
            end_exclusive: end,
        })
    }

    /// Resolves two bounds into a range, expanding dates to whole days.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidTimeRange`] if the resolved start is after
    /// the resolved end.
    pub fn from_bounds(start: TimeBound, end: TimeBound) -> Result<Self> {
        let range = Self::new(start.as_start(), end.as_end())?;
        Ok(Self {
            end_exclusive: end.as_end_exclusive(),
            ..range
        })
    }

    /// Range start (inclusive).
    pub fn start(&self) -> NaiveDateTime {
        self.start
    }

    /// Range end (inclusive), as used by raw queries.
    pub fn end(&self) -> NaiveDateTime {
        self.end
    }

    /// Range end (exclusive), as used by aggregation.
    ///
    /// Equal to [`TimeRange::end`] for a timestamp bound and to the following
    /// midnight for a date bound.
    pub fn end_exclusive(&self) -> NaiveDateTime {
        self.end_exclusive
    }

    /// Length of the half-open range.
    pub fn span(&self) -> TimeDelta {
        self.end_exclusive - self.start
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}..{}",
            format_timestamp(self.start),
            format_timestamp(self.end)
        )
    }
}

/// Bucket width for aggregate queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// One clock minute.
    Minute,
    /// One clock hour.
    Hour,
    /// One calendar day.
    Day,
    /// One week, Monday to Sunday.
    Week,
    /// One calendar month.
    Month,
}

impl Granularity {
    /// All granularities, finest first.
    pub const ALL: [Self; 5] = [Self::Minute, Self::Hour, Self::Day, Self::Week, Self::Month];

    /// Start of the bucket containing `ts`.
    pub fn floor(self, ts: NaiveDateTime) -> NaiveDateTime {
        let midnight = ts.date().and_time(NaiveTime::MIN);
        match self {
            Self::Minute => {
                midnight
                    + TimeDelta::hours(i64::from(ts.hour()))
                    + TimeDelta::minutes(i64::from(ts.minute()))
            }
            Self::Hour => midnight + TimeDelta::hours(i64::from(ts.hour())),
            Self::Day => midnight,
            Self::Week => {
                midnight - Days::new(u64::from(ts.weekday().num_days_from_monday()))
            }
            Self::Month => midnight - Days::new(u64::from(ts.day0())),
        }
    }

    /// End (exclusive) of the bucket starting at `bucket_start`.
    pub fn bucket_end(self, bucket_start: NaiveDateTime) -> NaiveDateTime {
        match self {
            Self::Minute => bucket_start + TimeDelta::minutes(1),
            Self::Hour => bucket_start + TimeDelta::hours(1),
            Self::Day => bucket_start + Days::new(1),
            Self::Week => bucket_start + Days::new(7),
            Self::Month => bucket_start
                .checked_add_months(Months::new(1))
                .unwrap_or(NaiveDateTime::MAX),
        }
    }

    /// Lowercase name, as accepted by [`FromStr`].
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = crate::error::TidemarkError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|g| g.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                QueryError::Parse {
                    input: s.to_string(),
                    reason: "expected minute, hour, day, week or month".to_string(),
                }
                .into()
            })
    }
}

/// Summary statistics of one column over a set of rows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Stats {
    /// Smallest value.
    pub min: f64,
    /// Largest value.
    pub max: f64,
    /// Arithmetic mean.
    pub mean: f64,
    /// Sample standard deviation; zero for a single value.
    pub std_dev: f64,
}

impl Stats {
    /// Computes statistics over `values`. Returns `None` if empty.
    #[allow(clippy::cast_precision_loss)] // row counts are far below 2^52
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let std_dev = if values.len() > 1 {
            let sq: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
            (sq / (n - 1.0)).sqrt()
        } else {
            0.0
        };

        Some(Self {
            min,
            max,
            mean,
            std_dev,
        })
    }
}

/// Statistics for one non-empty bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeBucket {
    /// Bucket start (inclusive).
    pub start: NaiveDateTime,
    /// Bucket end (exclusive).
    pub end: NaiveDateTime,
    /// Number of rows in the bucket.
    pub count: usize,
    /// Level statistics.
    pub level: Stats,
    /// Volume statistics.
    pub volume: Stats,
}

/// Statistics over a whole range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    /// Number of rows.
    pub count: usize,
    /// Level statistics.
    pub level: Stats,
    /// Volume statistics.
    pub volume: Stats,
    /// Timestamp of the first row.
    pub first: NaiveDateTime,
    /// Timestamp of the last row.
    pub last: NaiveDateTime,
}

/// Report that a query range was narrowed by a [`RangeCaps`] entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RangeAdjustment {
    /// Granularity whose cap applied.
    pub granularity: Granularity,
    /// The start the caller asked for.
    pub requested_start: NaiveDateTime,
    /// The start actually used.
    pub effective_start: NaiveDateTime,
    /// The cap, in days.
    pub cap_days: u32,
}

impl fmt::Display for RangeAdjustment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} granularity is limited to {} days; start moved from {} to {}",
            self.granularity,
            self.cap_days,
            format_timestamp(self.requested_start),
            format_timestamp(self.effective_start)
        )
    }
}

/// Maximum range span per granularity, in days.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RangeCaps(BTreeMap<Granularity, u32>);

impl Default for RangeCaps {
    fn default() -> Self {
        Self(BTreeMap::from([(Granularity::Minute, DEFAULT_MINUTE_CAP_DAYS)]))
    }
}

impl RangeCaps {
    /// Caps that never narrow a range.
    pub fn none() -> Self {
        Self(BTreeMap::new())
    }

    /// Sets the cap for a granularity.
    #[must_use]
    pub fn with(mut self, granularity: Granularity, days: u32) -> Self {
        self.0.insert(granularity, days);
        self
    }

    /// The cap for a granularity, if any.
    pub fn cap_days(&self, granularity: Granularity) -> Option<u32> {
        self.0.get(&granularity).copied()
    }

    /// Checks that every cap is at least one day.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidQuery`] for a zero-day cap.
    pub fn validate(&self) -> Result<()> {
        if let Some((granularity, _)) = self.0.iter().find(|(_, days)| **days == 0) {
            return Err(ConfigError::InvalidQuery {
                reason: format!("range cap for {granularity} must be at least 1 day"),
            }
            .into());
        }
        Ok(())
    }

    /// Narrows `range` to the cap for `granularity`.
    ///
    /// Returns the range unchanged and `None` when no cap applies or the span
    /// is within the cap.
    pub fn apply(
        &self,
        range: TimeRange,
        granularity: Granularity,
    ) -> (TimeRange, Option<RangeAdjustment>) {
        let Some(cap_days) = self.cap_days(granularity) else {
            return (range, None);
        };

        let cap = TimeDelta::days(i64::from(cap_days));
        if range.span() <= cap {
            return (range, None);
        }

        let effective_start = range.end_exclusive - cap;
        let narrowed = TimeRange {
            start: effective_start,
            ..range
        };
        let adjustment = RangeAdjustment {
            granularity,
            requested_start: range.start,
            effective_start,
            cap_days,
        };
        (narrowed, Some(adjustment))
    }
}

/// Result of an aggregate query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Aggregation {
    /// Bucket width.
    pub granularity: Granularity,
    /// Start of the range actually aggregated.
    pub start: NaiveDateTime,
    /// End (exclusive) of the range actually aggregated.
    pub end: NaiveDateTime,
    /// Non-empty buckets in time order.
    pub buckets: Vec<TimeBucket>,
    /// Present when the range was narrowed by a cap.
    pub adjustment: Option<RangeAdjustment>,
}

/// Groups readings into calendar-aligned buckets over `[range.start, range.end_exclusive)`.
///
/// Readings outside the half-open range are ignored. Input order does not
/// matter; buckets are returned in time order.
pub fn bucketize(
    readings: &[LevelReading],
    granularity: Granularity,
    range: TimeRange,
) -> Vec<TimeBucket> {
    let mut groups: BTreeMap<NaiveDateTime, (Vec<f64>, Vec<f64>)> = BTreeMap::new();

    for reading in readings
        .iter()
        .filter(|r| r.timestamp >= range.start && r.timestamp < range.end_exclusive)
    {
        let (levels, volumes) = groups.entry(granularity.floor(reading.timestamp)).or_default();
        levels.push(reading.level);
        volumes.push(reading.volume);
    }

    groups
        .into_iter()
        .filter_map(|(start, (levels, volumes))| {
            Some(TimeBucket {
                start,
                end: granularity.bucket_end(start),
                count: levels.len(),
                level: Stats::from_values(&levels)?,
                volume: Stats::from_values(&volumes)?,
            })
        })
        .collect()
}

/// Computes whole-range statistics. Returns `None` for no readings.
pub fn summarize(readings: &[LevelReading]) -> Option<Summary> {
    let levels: Vec<f64> = readings.iter().map(|r| r.level).collect();
    let volumes: Vec<f64> = readings.iter().map(|r| r.volume).collect();

    Some(Summary {
        count: readings.len(),
        level: Stats::from_values(&levels)?,
        volume: Stats::from_values(&volumes)?,
        first: readings.iter().map(|r| r.timestamp).min()?,
        last: readings.iter().map(|r| r.timestamp).max()?,
    })
}

//! Fixed-width time-bucket downsampling for the speed log.
//!
//! Converts an ordered sequence of point measurements into one summary
//! bucket per hour/day/week window, tracking open/close/low/high and a
//! recency-weighted average. Pure over its inputs: no clock, no I/O.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use core_types::types::Measurement;
use serde::Serialize;
use std::str::FromStr;
use thiserror::Error;

const MS_PER_HOUR: i64 = 3_600_000;
const MS_PER_DAY: i64 = 86_400_000;
const MS_PER_WEEK: i64 = 604_800_000;

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("invalid period: {0}")]
    InvalidPeriod(String),
}

/// Caller-selected bucket width.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Period {
    Hour,
    Day,
    Week,
}

impl Period {
    pub fn duration_ms(self) -> i64 {
        match self {
            Period::Hour => MS_PER_HOUR,
            Period::Day => MS_PER_DAY,
            Period::Week => MS_PER_WEEK,
        }
    }

    /// Calendar-aligned start of the unit containing `ts`. Weeks start on
    /// Sunday. Only the first bucket is aligned this way; every later
    /// boundary advances by fixed stride and is never re-aligned.
    fn align(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let date = ts.date_naive();
        let aligned = match self {
            Period::Hour => date.and_hms_opt(ts.hour(), 0, 0),
            Period::Day => date.and_hms_opt(0, 0, 0),
            Period::Week => {
                let back = ts.weekday().num_days_from_sunday() as i64;
                (date - Duration::days(back)).and_hms_opt(0, 0, 0)
            }
        };
        aligned
            .expect("midnight and whole hours are always valid")
            .and_utc()
    }
}

impl FromStr for Period {
    type Err = AggregationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "hour" => Ok(Period::Hour),
            "day" => Ok(Period::Day),
            "week" => Ok(Period::Week),
            other => Err(AggregationError::InvalidPeriod(other.to_string())),
        }
    }
}

/// How the window advances when a measurement lands past the open window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GapPolicy {
    /// Advance one duration at a time, emitting a degenerate single-member
    /// bucket per skipped step. Matches historical chart output and is the
    /// default.
    #[default]
    Stepwise,
    /// Jump directly to the stride-aligned window containing the new
    /// measurement, emitting nothing for the gap. Changes bucket boundaries
    /// for any data with gaps; opt-in only.
    JumpToContaining,
}

/// One sealed summary window. `end` is the window's end instant, emitted as
/// the representative timestamp.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bucket {
    #[serde(rename = "Date")]
    pub end: DateTime<Utc>,
    #[serde(rename = "SpeedMbps")]
    pub average: f64,
    #[serde(rename = "Open")]
    pub open: f64,
    #[serde(rename = "Close")]
    pub close: f64,
    #[serde(rename = "Low")]
    pub low: f64,
    #[serde(rename = "High")]
    pub high: f64,
}

#[derive(Clone, Copy)]
struct RunningStats {
    average: f64,
    open: f64,
    close: f64,
    low: f64,
    high: f64,
}

impl RunningStats {
    fn seed(speed: f64) -> Self {
        Self {
            average: speed,
            open: speed,
            close: speed,
            low: speed,
            high: speed,
        }
    }

    /// Pairwise blend, not an arithmetic mean: later members dominate.
    /// Kept verbatim for compatibility with historical aggregated output.
    fn fold(&mut self, speed: f64) {
        self.average = (self.average + speed) / 2.0;
        self.low = self.low.min(speed);
        self.high = self.high.max(speed);
        self.close = speed;
    }

    fn seal(self, end: DateTime<Utc>) -> Bucket {
        Bucket {
            end,
            average: self.average,
            open: self.open,
            close: self.close,
            low: self.low,
            high: self.high,
        }
    }
}

/// Downsamples an ordered measurement sequence into fixed-width buckets
/// with the default stepwise gap policy.
///
/// The input must be non-decreasing in timestamp. The engine neither sorts
/// nor validates ordering; output is unspecified for unsorted input.
pub fn aggregate(measurements: &[Measurement], period: Period) -> Vec<Bucket> {
    aggregate_with_policy(measurements, period, GapPolicy::default())
}

/// Validates a caller-supplied period name, then aggregates. The name is
/// rejected before any data is scanned.
pub fn aggregate_named(
    measurements: &[Measurement],
    period: &str,
) -> Result<Vec<Bucket>, AggregationError> {
    let period = Period::from_str(period)?;
    Ok(aggregate(measurements, period))
}

pub fn aggregate_with_policy(
    measurements: &[Measurement],
    period: Period,
    gaps: GapPolicy,
) -> Vec<Bucket> {
    let Some(first) = measurements.first() else {
        return Vec::new();
    };

    let duration = Duration::milliseconds(period.duration_ms());
    let mut period_end = period.align(first.timestamp) + duration;
    let mut stats = RunningStats::seed(first.speed_mbps);
    let mut sealed = Vec::new();

    for m in &measurements[1..] {
        if m.timestamp < period_end {
            stats.fold(m.speed_mbps);
            continue;
        }
        match gaps {
            GapPolicy::Stepwise => loop {
                // Seal, advance one step, reseed from the measurement that
                // triggered the advance, re-test. A gap wider than one
                // period emits one carry bucket per step.
                sealed.push(stats.seal(period_end));
                period_end += duration;
                stats = RunningStats::seed(m.speed_mbps);
                if m.timestamp < period_end {
                    break;
                }
            },
            GapPolicy::JumpToContaining => {
                sealed.push(stats.seal(period_end));
                let behind_ms = (m.timestamp - period_end).num_milliseconds();
                let steps = behind_ms.div_euclid(period.duration_ms()) + 1;
                period_end += Duration::milliseconds(steps * period.duration_ms());
                stats = RunningStats::seed(m.speed_mbps);
            }
        }
    }

    // The trailing open bucket is always emitted, even when partial.
    sealed.push(stats.seal(period_end));
    sealed
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn m(ts: &str, speed: f64) -> Measurement {
        Measurement::new(ts.parse().expect("test timestamp"), speed)
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn empty_input_yields_no_buckets() {
        for period in [Period::Hour, Period::Day, Period::Week] {
            assert!(aggregate(&[], period).is_empty());
        }
    }

    #[test]
    fn points_within_one_window_emit_one_bucket() {
        let data = vec![
            m("2024-01-01T00:05:00Z", 10.0),
            m("2024-01-01T00:20:00Z", 12.0),
            m("2024-01-01T00:40:00Z", 11.0),
        ];
        let buckets = aggregate(&data, Period::Hour);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].end, utc(2024, 1, 1, 1, 0, 0));
    }

    #[test]
    fn open_close_low_high_track_members() {
        let data = vec![
            m("2024-01-01T00:01:00Z", 3.0),
            m("2024-01-01T00:02:00Z", 5.0),
            m("2024-01-01T00:03:00Z", 1.0),
            m("2024-01-01T00:04:00Z", 5.0),
        ];
        let buckets = aggregate(&data, Period::Hour);
        assert_eq!(buckets.len(), 1);
        let bucket = &buckets[0];
        assert_eq!(bucket.open, 3.0);
        assert_eq!(bucket.close, 5.0);
        assert_eq!(bucket.low, 1.0);
        assert_eq!(bucket.high, 5.0);
    }

    #[test]
    fn average_is_pairwise_blend() {
        let data = vec![
            m("2024-01-01T00:01:00Z", 2.0),
            m("2024-01-01T00:02:00Z", 4.0),
            m("2024-01-01T00:03:00Z", 6.0),
        ];
        let buckets = aggregate(&data, Period::Hour);
        assert_eq!(buckets.len(), 1);
        // (((2+4)/2)+6)/2, not the arithmetic mean 4.0.
        assert_eq!(buckets[0].average, 4.5);
    }

    #[test]
    fn hour_gap_emits_stepwise_carry_buckets() {
        let data = vec![
            m("2024-01-01T00:10:00Z", 10.0),
            m("2024-01-01T02:10:00Z", 20.0),
        ];
        let buckets = aggregate(&data, Period::Hour);
        assert_eq!(buckets.len(), 3);

        assert_eq!(buckets[0].end, utc(2024, 1, 1, 1, 0, 0));
        assert_eq!(buckets[0].open, 10.0);
        assert_eq!(buckets[0].close, 10.0);
        assert_eq!(buckets[0].average, 10.0);

        // Degenerate carry bucket: no real member, stats are the triggering
        // measurement's speed across the board.
        assert_eq!(buckets[1].end, utc(2024, 1, 1, 2, 0, 0));
        assert_eq!(buckets[1].open, 20.0);
        assert_eq!(buckets[1].close, 20.0);
        assert_eq!(buckets[1].low, 20.0);
        assert_eq!(buckets[1].high, 20.0);
        assert_eq!(buckets[1].average, 20.0);

        assert_eq!(buckets[2].end, utc(2024, 1, 1, 3, 0, 0));
        assert_eq!(buckets[2].average, 20.0);
    }

    #[test]
    fn jump_policy_skips_gap_windows() {
        let data = vec![
            m("2024-01-01T00:10:00Z", 10.0),
            m("2024-01-01T02:10:00Z", 20.0),
        ];
        let buckets = aggregate_with_policy(&data, Period::Hour, GapPolicy::JumpToContaining);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].end, utc(2024, 1, 1, 1, 0, 0));
        assert_eq!(buckets[0].average, 10.0);
        assert_eq!(buckets[1].end, utc(2024, 1, 1, 3, 0, 0));
        assert_eq!(buckets[1].average, 20.0);
    }

    #[test]
    fn measurement_exactly_at_boundary_starts_next_bucket() {
        let data = vec![
            m("2024-01-01T00:10:00Z", 10.0),
            m("2024-01-01T01:00:00Z", 20.0),
        ];
        let buckets = aggregate(&data, Period::Hour);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].end, utc(2024, 1, 1, 1, 0, 0));
        assert_eq!(buckets[0].close, 10.0);
        assert_eq!(buckets[1].end, utc(2024, 1, 1, 2, 0, 0));
        assert_eq!(buckets[1].open, 20.0);
    }

    #[test]
    fn first_week_bucket_aligns_to_sunday() {
        // 2024-01-03 is a Wednesday; the containing week opened on Sunday
        // 2023-12-31, so the bucket seals the following Sunday midnight.
        let data = vec![m("2024-01-03T09:30:00Z", 25.0)];
        let buckets = aggregate(&data, Period::Week);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].end, utc(2024, 1, 7, 0, 0, 0));
    }

    #[test]
    fn day_boundaries_stride_from_first_midnight() {
        let data = vec![
            m("2024-03-01T08:00:00Z", 50.0),
            m("2024-03-02T08:00:00Z", 60.0),
        ];
        let buckets = aggregate(&data, Period::Day);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].end, utc(2024, 3, 2, 0, 0, 0));
        assert_eq!(buckets[1].end, utc(2024, 3, 3, 0, 0, 0));
    }

    #[test]
    fn aggregation_is_deterministic() {
        let data = vec![
            m("2024-01-01T00:10:00Z", 10.0),
            m("2024-01-01T00:40:00Z", 14.0),
            m("2024-01-01T02:10:00Z", 20.0),
            m("2024-01-01T05:59:59Z", 7.5),
        ];
        let first = aggregate(&data, Period::Hour);
        let second = aggregate(&data, Period::Hour);
        assert_eq!(first, second);
    }

    #[test]
    fn buckets_serialize_with_wire_keys() {
        let data = vec![
            m("2024-01-01T00:01:00Z", 3.0),
            m("2024-01-01T00:02:00Z", 5.0),
        ];
        let value = serde_json::to_value(aggregate(&data, Period::Hour)).expect("serialize");
        assert_eq!(
            value,
            serde_json::json!([{
                "Date": "2024-01-01T01:00:00Z",
                "SpeedMbps": 4.0,
                "Open": 3.0,
                "Close": 5.0,
                "Low": 3.0,
                "High": 5.0,
            }])
        );
    }

    #[test]
    fn unrecognized_period_name_is_rejected() {
        assert!(matches!(
            "month".parse::<Period>(),
            Err(AggregationError::InvalidPeriod(_))
        ));
        assert!(aggregate_named(&[], "month").is_err());
        let data = vec![m("2024-01-01T00:10:00Z", 10.0)];
        assert!(aggregate_named(&data, "Hour").is_err());
        assert!(aggregate_named(&data, "hour").is_ok());
    }
}

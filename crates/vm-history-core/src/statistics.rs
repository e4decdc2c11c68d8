//! # History Statistics
//!
//! Aggregations over recorded events: counts per type, outcome ratios,
//! average durations and per-day buckets.
//!
//! All functions are pure and operate on events already fetched from an
//! [`EventStore`](crate::history::EventStore).

use crate::history::{Event, EventStatus, EventType};
use crate::{ParseError, Timestamp};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Reporting window for summaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsPeriod {
    /// Since midnight today (UTC)
    Day,
    /// Last 7 days
    Week,
    /// Last 30 days
    Month,
    /// Last 365 days
    Year,
}

impl StatsPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
        }
    }

    /// First instant covered by the period ending at `now`
    pub fn start_from(&self, now: Timestamp) -> Timestamp {
        match self {
            Self::Day => now.start_of_day(),
            Self::Week => now.subtract_duration(Duration::from_secs(7 * SECONDS_PER_DAY)),
            Self::Month => now.subtract_duration(Duration::from_secs(30 * SECONDS_PER_DAY)),
            Self::Year => now.subtract_duration(Duration::from_secs(365 * SECONDS_PER_DAY)),
        }
    }
}

impl fmt::Display for StatsPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatsPeriod {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "year" => Ok(Self::Year),
            _ => Err(ParseError::UnknownVariant {
                field: "period".to_string(),
                actual: s.to_string(),
            }),
        }
    }
}

/// Outcome distribution of a set of events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuccessRatio {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub pending: usize,
    pub in_progress: usize,
    /// Percentage of events that succeeded (0-100)
    pub success_ratio: f64,
    /// Percentage of events that failed (0-100)
    pub failed_ratio: f64,
}

/// Event count and outcomes for one calendar day (UTC)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStats {
    pub date: NaiveDate,
    pub count: usize,
    pub success_ratio: SuccessRatio,
}

/// Number of events per type
pub fn counts_by_type(events: &[Event]) -> BTreeMap<EventType, usize> {
    let mut counts = BTreeMap::new();
    for event in events {
        *counts.entry(event.event_type).or_insert(0) += 1;
    }
    counts
}

/// Outcome counts and percentages
pub fn success_ratio<'a>(events: impl IntoIterator<Item = &'a Event>) -> SuccessRatio {
    let mut ratio = SuccessRatio::default();
    for event in events {
        ratio.total += 1;
        match event.status {
            EventStatus::Success => ratio.success += 1,
            EventStatus::Failed => ratio.failed += 1,
            EventStatus::Pending => ratio.pending += 1,
            EventStatus::InProgress => ratio.in_progress += 1,
        }
    }

    if ratio.total > 0 {
        ratio.success_ratio = ratio.success as f64 / ratio.total as f64 * 100.0;
        ratio.failed_ratio = ratio.failed as f64 / ratio.total as f64 * 100.0;
    }
    ratio
}

/// Mean duration per event type, counting successful events only
pub fn average_durations(events: &[Event]) -> BTreeMap<EventType, f64> {
    let mut sums: BTreeMap<EventType, (f64, usize)> = BTreeMap::new();
    for (event_type, duration) in successful_durations(events) {
        let entry = sums.entry(event_type).or_insert((0.0, 0));
        entry.0 += duration;
        entry.1 += 1;
    }

    sums.into_iter()
        .map(|(event_type, (sum, n))| (event_type, sum / n as f64))
        .collect()
}

/// Mean duration of successful events of one type
pub fn average_duration_for(events: &[Event], event_type: EventType) -> Option<f64> {
    let durations: Vec<f64> = successful_durations(events)
        .filter(|(t, _)| *t == event_type)
        .map(|(_, d)| d)
        .collect();

    if durations.is_empty() {
        None
    } else {
        Some(durations.iter().sum::<f64>() / durations.len() as f64)
    }
}

/// One bucket per calendar day from `start` to `end`, both inclusive
///
/// Days without events are reported with a zero count.
pub fn daily_stats(events: &[Event], start: Timestamp, end: Timestamp) -> Vec<DailyStats> {
    let mut buckets: BTreeMap<NaiveDate, Vec<&Event>> = BTreeMap::new();
    for event in events {
        if event.timestamp >= start.start_of_day() && event.timestamp <= end {
            buckets.entry(event.timestamp.date()).or_default().push(event);
        }
    }

    let mut days = Vec::new();
    let mut day = start.date();
    let last = end.date();
    while day <= last {
        let bucket = buckets.remove(&day).unwrap_or_default();
        days.push(DailyStats {
            date: day,
            count: bucket.len(),
            success_ratio: success_ratio(bucket),
        });
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }
    days
}

fn successful_durations(events: &[Event]) -> impl Iterator<Item = (EventType, f64)> + '_ {
    events
        .iter()
        .filter(|event| event.status == EventStatus::Success)
        .filter_map(|event| event.duration.map(|d| (event.event_type, d)))
}

#[cfg(test)]
#[path = "statistics_tests.rs"]
mod tests;

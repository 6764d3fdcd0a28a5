//! Point-in-time statistics produced by a flush
//!
//! A [`Snapshot`] is derived from the aggregator's running accumulator and
//! never mutates it. When nothing has been folded yet every statistic is
//! `None`; consumers never see NaN.

use crate::types::Seed;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A statistic value together with the seed of the trial that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeededValue {
    /// The statistic
    pub value: f64,
    /// Seed of the trial that produced `value`
    pub seed: Seed,
}

impl SeededValue {
    /// Pair a value with its seed
    pub fn new(value: f64, seed: Seed) -> Self {
        Self { value, seed }
    }
}

/// Summary of one metric across all folded trials
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryStat {
    /// Number of samples folded into this metric
    pub count: u64,
    /// Arithmetic mean
    pub mean: Option<f64>,
    /// Population standard deviation
    pub stddev: Option<f64>,
    /// Smallest value; ties attribute the first-seen seed
    pub min: Option<SeededValue>,
    /// Largest value; ties attribute the first-seen seed
    pub max: Option<SeededValue>,
    /// 25th percentile, nearest rank
    pub p25: Option<SeededValue>,
    /// Median, nearest rank
    pub p50: Option<SeededValue>,
    /// 75th percentile, nearest rank
    pub p75: Option<SeededValue>,
}

impl SummaryStat {
    /// The summary of a metric with no samples
    pub fn empty() -> Self {
        Self::default()
    }

    /// No samples were folded
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Immutable statistics view returned by a flush
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Number of results folded when the flush was processed
    pub count: u64,
    /// Wall time since the start time supplied with the flush
    pub elapsed_ms: u64,
    /// Summary of each trial's primary value
    pub primary: SummaryStat,
    /// Summaries of the named per-trial metrics
    pub metrics: BTreeMap<String, SummaryStat>,
}

impl Snapshot {
    /// Snapshot of an accumulator with no results
    pub fn empty(elapsed_ms: u64) -> Self {
        Self {
            elapsed_ms,
            ..Self::default()
        }
    }

    /// Compare two snapshots ignoring the elapsed time field
    pub fn same_statistics(&self, other: &Snapshot) -> bool {
        self.count == other.count && self.primary == other.primary && self.metrics == other.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_snapshot_has_no_nan() {
        let snapshot = Snapshot::empty(5);
        assert_eq!(snapshot.count, 0);
        assert!(snapshot.primary.mean.is_none());
        assert!(snapshot.primary.min.is_none());
        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json["primary"]["mean"].is_null());
    }

    #[test]
    fn test_same_statistics_ignores_elapsed() {
        assert!(Snapshot::empty(1).same_statistics(&Snapshot::empty(900)));
    }
}

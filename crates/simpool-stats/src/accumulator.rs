//! Running statistics over trial results
//!
//! Every folded sample is retained, so order statistics are exact. Count and
//! extremes are maintained incrementally; mean, variance and percentiles are
//! derived at snapshot time from the samples sorted by value, which makes
//! them bitwise identical for any arrival order of the same results.
//!
//! Seed attribution is deterministic: among equal values the sample that
//! arrived first owns the seed.

use crate::codec::{CodecError, TrialResult};
use simpool_core::{SeededValue, Seed, Snapshot, SummaryStat};
use std::cmp::Ordering;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Sample {
    value: f64,
    /// Position of the owning trial in arrival order
    arrival: usize,
}

impl Sample {
    fn cmp_value_then_arrival(&self, other: &Sample) -> Ordering {
        self.value
            .total_cmp(&other.value)
            .then(self.arrival.cmp(&other.arrival))
    }
}

/// Retained samples and running extremes of one metric
#[derive(Debug, Clone, Default)]
pub struct MetricAccumulator {
    samples: Vec<Sample>,
    min: Option<Sample>,
    max: Option<Sample>,
}

impl MetricAccumulator {
    /// Samples folded so far
    pub fn count(&self) -> u64 {
        self.samples.len() as u64
    }

    fn push(&mut self, value: f64, arrival: usize) {
        let sample = Sample { value, arrival };
        // Strict comparisons: an equal later value never displaces the first seen
        if self
            .min
            .map_or(true, |min| value.total_cmp(&min.value).is_lt())
        {
            self.min = Some(sample);
        }
        if self
            .max
            .map_or(true, |max| value.total_cmp(&max.value).is_gt())
        {
            self.max = Some(sample);
        }
        self.samples.push(sample);
    }

    /// Derive the summary of this metric; `seeds` is indexed by arrival
    pub fn summarize(&self, seeds: &[Seed]) -> SummaryStat {
        let n = self.samples.len();
        if n == 0 {
            return SummaryStat::empty();
        }

        let mut sorted = self.samples.clone();
        sorted.sort_by(Sample::cmp_value_then_arrival);

        let sum: f64 = sorted.iter().map(|s| s.value).sum();
        let mean = sum / n as f64;
        let variance = sorted
            .iter()
            .map(|s| {
                let d = s.value - mean;
                d * d
            })
            .sum::<f64>()
            / n as f64;

        let seeded = |sample: Sample| {
            SeededValue::new(sample.value, seeds[sample.arrival].clone())
        };

        SummaryStat {
            count: n as u64,
            mean: Some(mean),
            stddev: Some(variance.sqrt()),
            min: self.min.map(seeded),
            max: self.max.map(seeded),
            p25: Some(seeded(percentile(&sorted, 0.25))),
            p50: Some(seeded(percentile(&sorted, 0.50))),
            p75: Some(seeded(percentile(&sorted, 0.75))),
        }
    }
}

/// Nearest-rank percentile over value-sorted samples, attributed to the
/// first-seen sample holding the selected value
fn percentile(sorted: &[Sample], q: f64) -> Sample {
    let n = sorted.len();
    let rank = (q * n as f64).ceil() as usize;
    let picked = sorted[rank.clamp(1, n) - 1];
    let first = sorted.partition_point(|s| s.value.total_cmp(&picked.value).is_lt());
    sorted[first]
}

/// Accumulator owned by one aggregator for one run
#[derive(Debug, Clone, Default)]
pub struct RunningAccumulator {
    /// Seed of each folded trial, in arrival order
    seeds: Vec<Seed>,
    primary: MetricAccumulator,
    metrics: BTreeMap<String, MetricAccumulator>,
}

impl RunningAccumulator {
    /// Empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of folded trials
    pub fn count(&self) -> u64 {
        self.seeds.len() as u64
    }

    /// Fold one trial. The trial is validated in full first, so a rejected
    /// trial leaves the accumulator untouched.
    pub fn add(&mut self, trial: TrialResult) -> Result<(), CodecError> {
        trial.validate()?;

        let arrival = self.seeds.len();
        self.primary.push(trial.value, arrival);
        for (name, value) in trial.metrics {
            self.metrics.entry(name).or_default().push(value, arrival);
        }
        self.seeds.push(trial.seed);
        Ok(())
    }

    /// Decode and fold one encoded trial
    pub fn add_blob(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        let trial = TrialResult::decode(bytes)?;
        self.add(trial)
    }

    /// Derive a snapshot; the accumulator is not modified
    pub fn snapshot(&self, elapsed_ms: u64) -> Snapshot {
        Snapshot {
            count: self.count(),
            elapsed_ms,
            primary: self.primary.summarize(&self.seeds),
            metrics: self
                .metrics
                .iter()
                .map(|(name, metric)| (name.clone(), metric.summarize(&self.seeds)))
                .collect(),
        }
    }

    /// Drop every folded trial
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

//! simpool aggregation engine
//!
//! Accumulate-then-snapshot statistics over trial results: count, mean,
//! standard deviation, min/max and quartiles, each attributed to the seed of
//! the trial that produced it.
//!
//! ```rust,ignore
//! use simpool_stats::{RunningAccumulator, TrialResult};
//!
//! let mut acc = RunningAccumulator::new();
//! acc.add(TrialResult::new("7".into(), 12.5))?;
//! let snapshot = acc.snapshot(0);
//! assert_eq!(snapshot.count, 1);
//! ```

pub mod accumulator;
pub mod aggregator;
pub mod codec;

pub use accumulator::{MetricAccumulator, RunningAccumulator};
pub use aggregator::StatsAggregator;
pub use codec::{CodecError, TrialResult};

//! Reference aggregation module backed by [`RunningAccumulator`]

use crate::accumulator::RunningAccumulator;
use serde_json::json;
use simpool_core::{
    AggregationModule, Clock, Configuration, InitInfo, ModuleError, ResultBlob, Snapshot,
    SystemClock,
};
use std::sync::Arc;

/// Folds bincode [`crate::TrialResult`] blobs into a [`RunningAccumulator`]
pub struct StatsAggregator {
    accumulator: Option<RunningAccumulator>,
    clock: Arc<dyn Clock>,
}

impl StatsAggregator {
    /// Aggregator measuring elapsed time with the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an aggregator with an injected clock for elapsed-time reporting
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            accumulator: None,
            clock,
        }
    }

    /// Trials folded since the last initialize
    pub fn count(&self) -> u64 {
        self.accumulator.as_ref().map_or(0, RunningAccumulator::count)
    }

    fn accumulator(&self) -> Result<&RunningAccumulator, ModuleError> {
        self.accumulator
            .as_ref()
            .ok_or_else(|| ModuleError::new("aggregator not initialized"))
    }
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl AggregationModule for StatsAggregator {
    fn initialize_aggregator(&mut self, config: &Configuration) -> Result<InitInfo, ModuleError> {
        if config.is_blank() {
            return Err(ModuleError::new("empty configuration"));
        }
        if self.count() > 0 {
            tracing::debug!(discarded = self.count(), "resetting accumulator");
        }
        self.accumulator = Some(RunningAccumulator::new());
        Ok(InitInfo::new(json!({ "retention": "full" })))
    }

    fn aggregate(&mut self, blob: &ResultBlob) -> Result<(), ModuleError> {
        let accumulator = self
            .accumulator
            .as_mut()
            .ok_or_else(|| ModuleError::new("aggregator not initialized"))?;
        accumulator
            .add_blob(blob.as_bytes())
            .map_err(|e| ModuleError::new(e.to_string()))
    }

    fn flush(&self, start_time_ms: i64) -> Result<Snapshot, ModuleError> {
        let accumulator = self.accumulator()?;
        let elapsed_ms = self.clock.now_ms().saturating_sub(start_time_ms).max(0) as u64;
        Ok(accumulator.snapshot(elapsed_ms))
    }
}

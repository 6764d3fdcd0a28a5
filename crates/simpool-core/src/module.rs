//! Pluggable simulation capability
//!
//! The simulation engine is an external collaborator. Anything implementing
//! [`SimulationModule`] can back a worker unit and anything implementing
//! [`AggregationModule`] can back the aggregator unit; a [`ModuleFactory`]
//! loads one fresh instance per unit, inside that unit's own thread.

use crate::errors::ModuleError;
use crate::ids::UnitId;
use crate::snapshot::Snapshot;
use crate::types::{Clock, Configuration, InitInfo, Job, ResultBlob};
use std::sync::Arc;

/// Module hosted by a worker unit
pub trait SimulationModule: Send {
    /// Apply the run configuration. An error makes the unit unusable for the run.
    fn initialize(&mut self, config: &Configuration) -> Result<InitInfo, ModuleError>;

    /// Run one iteration deterministically from the job's seed
    fn run(&mut self, job: &Job) -> Result<Vec<u8>, ModuleError>;
}

/// Module hosted by the aggregator unit
pub trait AggregationModule: Send {
    /// Reset the accumulator and apply the run configuration
    fn initialize_aggregator(&mut self, config: &Configuration) -> Result<InitInfo, ModuleError>;

    /// Fold one result. Must leave the accumulator untouched on error.
    fn aggregate(&mut self, blob: &ResultBlob) -> Result<(), ModuleError>;

    /// Derive a snapshot without mutating the accumulator
    fn flush(&self, start_time_ms: i64) -> Result<Snapshot, ModuleError>;
}

/// Loads module instances for units
pub trait ModuleFactory: Send + Sync + 'static {
    /// Load the simulation module for a worker unit
    fn load_simulation(&self, unit: UnitId) -> Result<Box<dyn SimulationModule>, ModuleError>;

    /// Load the aggregation module for the aggregator unit.
    ///
    /// `clock` is the pool's clock; run start times passed to
    /// [`AggregationModule::flush`] are read from it, so elapsed time must be
    /// measured against it too.
    fn load_aggregator(
        &self,
        clock: Arc<dyn Clock>,
    ) -> Result<Box<dyn AggregationModule>, ModuleError>;
}

//! simpool core
//!
//! Shared vocabulary for the simpool workspace:
//! - the data model (configuration, seeds, jobs, result blobs, snapshots)
//! - the error taxonomy every unit-level failure is converted into
//! - the typed request/response protocol between the pool and its units
//! - the pluggable module traits a simulation engine implements
//!
//! The crate has no async runtime dependency; the runtime lives in
//! `simpool-runtime`.

pub mod errors;
pub mod ids;
pub mod module;
pub mod protocol;
pub mod seed;
pub mod snapshot;
pub mod types;

pub use errors::{ErrorKind, ModuleError, PoolError, Result};
pub use ids::{JobId, RequestId, RunId, UnitId};
pub use module::{AggregationModule, ModuleFactory, SimulationModule};
pub use protocol::{Envelope, UnitEvent, UnitRequest, UnitResponse};
pub use seed::{derive_jobs, derive_seed, explicit_jobs, random_base_seed};
pub use snapshot::{SeededValue, Snapshot, SummaryStat};
pub use types::{Clock, Configuration, InitInfo, Job, ResultBlob, Seed, SystemClock};

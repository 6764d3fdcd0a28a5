//! Simpool runtime
//!
//! Runs batches of simulation iterations across a pool of worker units and
//! feeds their results to a single aggregator unit.
//!
//! # Architecture
//!
//! - **Units** are dedicated OS threads, each hosting one module instance.
//!   A unit handles one request at a time, in arrival order.
//! - The **coordinator** is a tokio task that owns all scheduling state and
//!   correlates unit responses with outstanding requests.
//! - [`Pool`] is the clonable caller handle; [`RunHandle`] tracks one run.
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use simpool_core::ModuleFactory;
//! # async fn demo(factory: Arc<dyn ModuleFactory>) -> Result<(), Box<dyn std::error::Error>> {
//! use simpool_runtime::{Pool, PoolConfig, RunRequest};
//!
//! let pool = Pool::new(PoolConfig::default(), factory)?;
//! let mut run = pool.start_run(RunRequest::new("{}", 1000)).await?;
//! let summary = run.wait().await?;
//! println!("{} completed", summary.completed);
//! # Ok(())
//! # }
//! ```

mod config;
mod coordinator;
mod events;
mod pool;
mod run;
mod unit;

pub use config::{CancelMode, ConfigError, PoolConfig, RunRequest};
pub use events::PoolEvent;
pub use pool::{Pool, RunHandle};
pub use run::{JobFailure, JobState, PoolStatus, Progress, RunStatus, RunSummary, UnitState};

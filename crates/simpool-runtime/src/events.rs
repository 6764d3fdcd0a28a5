//! Notifications broadcast by the pool

use crate::run::{JobFailure, Progress, RunSummary};
use serde::{Deserialize, Serialize};
use simpool_core::{PoolError, RunId, UnitId};
use tokio::sync::broadcast;

/// Event emitted by the pool coordinator.
///
/// Subscribe before calling `start_run` to observe unit exclusions that
/// happen during initialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PoolEvent {
    /// A unit's module finished loading
    UnitReady {
        /// The unit that loaded
        unit: UnitId,
    },
    /// A unit failed to initialize or went away and no longer serves the run
    UnitExcluded {
        /// Run the unit was excluded from
        run: RunId,
        /// The excluded unit
        unit: UnitId,
        /// Why it was excluded
        error: PoolError,
    },
    /// Dispatch began
    RunStarted {
        /// The run
        run: RunId,
        /// Units that initialized successfully
        active_units: usize,
        /// Jobs in the run
        total: u64,
    },
    /// A job failed; the run continues
    JobFailed {
        /// The run
        run: RunId,
        /// Which job failed and why
        failure: JobFailure,
    },
    /// A job settled
    Progress {
        /// The run
        run: RunId,
        /// Accounting after the change
        progress: Progress,
    },
    /// Final flush done; the run is over
    RunCompleted {
        /// Final report
        summary: RunSummary,
    },
    /// The run could not finish
    RunFailed {
        /// The run
        run: RunId,
        /// Why it failed
        error: PoolError,
    },
}

impl PoolEvent {
    /// Run the event belongs to; `None` for pool-level events
    pub fn run(&self) -> Option<RunId> {
        match self {
            Self::UnitReady { .. } => None,
            Self::UnitExcluded { run, .. }
            | Self::RunStarted { run, .. }
            | Self::JobFailed { run, .. }
            | Self::Progress { run, .. }
            | Self::RunFailed { run, .. } => Some(*run),
            Self::RunCompleted { summary } => Some(summary.run),
        }
    }
}

/// Send an event, ignoring the absence of subscribers
pub(crate) fn emit(events: &broadcast::Sender<PoolEvent>, event: PoolEvent) {
    let _ = events.send(event);
}

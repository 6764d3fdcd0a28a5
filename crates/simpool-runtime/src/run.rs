//! Run, job and unit state as seen by callers

use serde::{Deserialize, Serialize};
use simpool_core::{JobId, PoolError, RunId, Seed, Snapshot, UnitId};

/// Lifecycle of one execution unit, as tracked by the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitState {
    /// Slot exists but no unit has been spawned yet
    Uninitialized,
    /// Module loading or initializing for the current run
    Loading,
    /// Initialized and idle
    Ready,
    /// Executing exactly one job
    Busy,
    /// Stopped by the pool
    Terminated,
    /// Load or initialization failed; terminal for this unit
    Failed(String),
}

impl UnitState {
    /// Whether the slot needs a fresh unit before it can serve a run
    pub fn needs_respawn(&self) -> bool {
        matches!(
            self,
            Self::Uninitialized | Self::Terminated | Self::Failed(_)
        )
    }
}

/// Lifecycle of one job within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Waiting for a unit
    Pending,
    /// Sent to the unit
    Assigned(UnitId),
    /// Result produced and forwarded to the aggregator
    Aggregating,
    /// Folded by the aggregator
    Completed,
    /// The module or the aggregator rejected it
    Failed,
    /// Never dispatched because the run was cancelled
    Cancelled,
    /// Result dropped because the run was cancelled with discard
    Discarded,
}

impl JobState {
    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Assigned(_))
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Assigned(_), Pending)
                | (Assigned(_), Aggregating)
                | (Assigned(_), Failed)
                | (Assigned(_), Discarded)
                | (Aggregating, Completed)
                | (Aggregating, Failed)
        )
    }

    /// No further transitions are possible
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Discarded
        )
    }
}

/// A job that did not produce an aggregated result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    /// The failed job
    pub job: JobId,
    /// Its seed, for reproducing the failure
    pub seed: Seed,
    /// Unit that ran the job, if it was dispatched
    pub unit: Option<UnitId>,
    /// Why the job failed
    pub error: PoolError,
}

/// Job accounting of a run in progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Results folded by the aggregator
    pub completed: u64,
    /// Jobs that failed to run or to aggregate
    pub failed: u64,
    /// Jobs never dispatched because of a cancel
    pub cancelled: u64,
    /// In-flight results dropped by a discarding cancel
    pub discarded: u64,
    /// Jobs in the run
    pub total: u64,
}

impl Progress {
    /// Jobs that reached a terminal state
    pub fn settled(&self) -> u64 {
        self.completed + self.failed + self.cancelled + self.discarded
    }
}

/// Final report of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// The run
    pub run: RunId,
    /// Base seed jobs were derived from; `None` for explicit seeds
    pub base_seed: Option<u64>,
    /// Jobs requested
    pub target: u64,
    /// Results folded by the aggregator
    pub completed: u64,
    /// Every job that failed, with its seed
    pub failed: Vec<JobFailure>,
    /// Jobs never dispatched because of a cancel
    pub cancelled: u64,
    /// In-flight results dropped by a discarding cancel
    pub discarded: u64,
    /// Units excluded from the run because they failed to initialize
    pub excluded_units: Vec<(UnitId, PoolError)>,
    /// Final flush; `None` if the aggregator could not produce it
    pub snapshot: Option<Snapshot>,
}

impl RunSummary {
    /// Number of failed jobs
    pub fn failed_count(&self) -> u64 {
        self.failed.len() as u64
    }

    /// Indices of the jobs that failed
    pub fn failed_jobs(&self) -> Vec<JobId> {
        self.failed.iter().map(|f| f.job).collect()
    }

    /// Every job is accounted for exactly once
    pub fn is_fully_accounted(&self) -> bool {
        self.completed + self.failed_count() + self.cancelled + self.discarded == self.target
    }
}

/// Published state of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Units and aggregator are initializing with the run configuration
    Initializing,
    /// Jobs are being dispatched
    Running(Progress),
    /// Dispatch stopped; waiting for in-flight jobs
    Cancelling(Progress),
    /// All jobs settled; final flush in progress
    Finalizing(Progress),
    /// Finished with a final report
    Completed(RunSummary),
    /// Could not finish
    Failed(PoolError),
}

impl RunStatus {
    /// Completed or failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Failed(_))
    }

    /// Job accounting while the run is live
    pub fn progress(&self) -> Option<Progress> {
        match self {
            Self::Running(p) | Self::Cancelling(p) | Self::Finalizing(p) => Some(*p),
            _ => None,
        }
    }
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Configured worker slots
    pub worker_count: usize,
    /// State of each worker slot's unit
    pub units: Vec<(UnitId, UnitState)>,
    /// State of the aggregator unit
    pub aggregator: UnitState,
    /// Run in progress, if any
    pub active_run: Option<RunId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_transitions() {
        let unit = UnitId::new(0);
        assert!(JobState::Pending.can_transition_to(JobState::Assigned(unit)));
        assert!(JobState::Assigned(unit).can_transition_to(JobState::Aggregating));
        assert!(JobState::Aggregating.can_transition_to(JobState::Completed));
        assert!(!JobState::Completed.can_transition_to(JobState::Completed));
        assert!(!JobState::Pending.can_transition_to(JobState::Completed));
        assert!(!JobState::Cancelled.can_transition_to(JobState::Assigned(unit)));
    }

    #[test]
    fn test_unit_respawn_states() {
        assert!(UnitState::Failed("x".into()).needs_respawn());
        assert!(UnitState::Uninitialized.needs_respawn());
        assert!(!UnitState::Ready.needs_respawn());
        assert!(!UnitState::Busy.needs_respawn());
    }

    #[test]
    fn test_progress_settled() {
        let progress = Progress {
            completed: 3,
            failed: 1,
            cancelled: 2,
            discarded: 0,
            total: 6,
        };
        assert_eq!(progress.settled(), 6);
    }
}

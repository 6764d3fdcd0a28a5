//! Typed request/response protocol between the pool and its units
//!
//! Worker units and the aggregator unit speak the same protocol:
//!
//! | Request      | Success response        | Failure response  |
//! |--------------|-------------------------|-------------------|
//! | `Initialize` | `Initialized { info }`  | `Failed { error }`|
//! | `Run`        | `Done { job, blob }`    | `Failed { error }`|
//! | `Add`        | `Added`                 | `Failed { error }`|
//! | `Flush`      | `Result { snapshot }`   | `Failed { error }`|
//!
//! Requests travel in an [`Envelope`] carrying a [`RequestId`]; the unit
//! answers each envelope exactly once with a [`UnitEvent::Response`]
//! carrying the same id. A unit also emits an unsolicited
//! [`UnitEvent::Ready`] once its module has loaded.

use crate::errors::PoolError;
use crate::ids::{JobId, RequestId, UnitId};
use crate::snapshot::Snapshot;
use crate::types::{Configuration, InitInfo, Job, ResultBlob};
use serde::{Deserialize, Serialize};

/// Request understood by a unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UnitRequest {
    /// Initialize the hosted module with the run configuration
    Initialize {
        /// Configuration shared by every unit of the run
        config: Configuration,
    },
    /// Run one iteration (worker units only)
    Run {
        /// The iteration to run
        job: Job,
    },
    /// Fold one result blob (aggregator unit only)
    Add {
        /// Job that produced the blob
        job: JobId,
        /// Output of the job
        blob: ResultBlob,
    },
    /// Produce a snapshot (aggregator unit only)
    Flush {
        /// Pool clock time the elapsed time is measured from
        start_time_ms: i64,
    },
    /// Stop the unit. Not answered.
    Terminate,
}

impl UnitRequest {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initialize { .. } => "initialize",
            Self::Run { .. } => "run",
            Self::Add { .. } => "add",
            Self::Flush { .. } => "flush",
            Self::Terminate => "terminate",
        }
    }
}

/// A request tagged with its correlation id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id echoed in the response
    pub id: RequestId,
    /// The request itself
    pub request: UnitRequest,
}

impl Envelope {
    /// Tag `request` with `id`
    pub fn new(id: RequestId, request: UnitRequest) -> Self {
        Self { id, request }
    }
}

/// Response to one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UnitResponse {
    /// The module accepted the configuration
    Initialized {
        /// What the module reported
        info: InitInfo,
    },
    /// A worker finished an iteration
    Done {
        /// The job that ran
        job: JobId,
        /// Its output
        blob: ResultBlob,
    },
    /// The aggregator folded a result
    Added,
    /// The aggregator produced a snapshot
    Result {
        /// Statistics at the time of the flush
        snapshot: Snapshot,
    },
    /// The request failed
    Failed {
        /// Why it failed
        error: PoolError,
    },
}

impl UnitResponse {
    /// Failure response carrying `error`
    pub fn failed(error: PoolError) -> Self {
        Self::Failed { error }
    }

    /// Whether this is [`UnitResponse::Failed`]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Message flowing from a unit into the pool's inbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UnitEvent {
    /// The unit's module finished loading; queued requests are now served
    Ready {
        /// The unit that loaded
        unit: UnitId,
    },
    /// The unit's module failed to load. Queued and later requests are
    /// answered with `Failed { LoadFailure }` until the unit is terminated.
    LoadFailed {
        /// The unit that failed
        unit: UnitId,
        /// Why loading failed
        error: PoolError,
    },
    /// Answer to the request with the given id
    Response {
        /// The answering unit
        unit: UnitId,
        /// Id of the request being answered
        request: RequestId,
        /// The answer
        response: UnitResponse,
    },
    /// The unit's thread stopped
    Exited {
        /// The unit that stopped
        unit: UnitId,
    },
}

impl UnitEvent {
    /// Unit the event came from
    pub fn unit(&self) -> UnitId {
        match self {
            Self::Ready { unit }
            | Self::LoadFailed { unit, .. }
            | Self::Response { unit, .. }
            | Self::Exited { unit } => *unit,
        }
    }
}

//! Identifiers for runs, units, jobs and protocol requests

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of one batch run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    /// Generate a fresh random run id
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", &self.0.simple().to_string()[..8])
    }
}

/// Identity of an execution unit. Never reused within one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitId(u32);

impl UnitId {
    /// Id reserved for the aggregator unit
    pub const AGGREGATOR: UnitId = UnitId(u32::MAX);

    /// Id reserved for ephemeral single-seed sampling units
    pub const SAMPLER: UnitId = UnitId(u32::MAX - 1);

    /// Worker unit id; the pool hands these out in increasing order
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Numeric value of the id
    pub fn raw(&self) -> u32 {
        self.0
    }

    /// Whether this is [`UnitId::AGGREGATOR`]
    pub fn is_aggregator(&self) -> bool {
        *self == Self::AGGREGATOR
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_aggregator() {
            write!(f, "aggregator")
        } else if *self == Self::SAMPLER {
            write!(f, "sampler")
        } else {
            write!(f, "unit-{}", self.0)
        }
    }
}

/// Iteration index of a job within its run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(u64);

impl JobId {
    /// Job for iteration `index`
    pub fn new(index: u64) -> Self {
        Self(index)
    }

    /// Zero-based iteration index
    pub fn index(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

/// Correlation id of one request sent to a unit.
///
/// Each request produces exactly one response carrying the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(u64);

impl RequestId {
    /// Wrap a raw correlation number
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Numeric value of the id
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

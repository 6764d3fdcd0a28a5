//! Error taxonomy shared by units, the aggregation engine and the pool
//!
//! Every unit-level failure is converted into a `PoolError` before it reaches
//! the coordinator, so errors are `Clone` and serializable and can travel
//! inside protocol responses and pool events.

use serde::{Deserialize, Serialize};

/// Unified error type for all simpool operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum PoolError {
    /// A module failed to load or rejected its configuration.
    /// Fatal for the unit, which is excluded from the run.
    #[error("Load failure: {reason}")]
    LoadFailure {
        /// Why loading or initialization failed
        reason: String,
    },

    /// A single iteration failed. Fatal for the job only.
    #[error("Run failure: {reason}")]
    RunFailure {
        /// Why the iteration failed
        reason: String,
    },

    /// The aggregator could not fold a result blob
    #[error("Malformed result: {reason}")]
    MalformedResult {
        /// Why the blob was rejected
        reason: String,
    },

    /// An operation was invoked on a unit or pool not in the required state
    #[error("Invalid state: {reason}")]
    InvalidState {
        /// Description of the state violation
        reason: String,
    },

    /// A resize or reconfiguration was rejected because a run is active
    #[error("Busy: {reason}")]
    Busy {
        /// What is currently occupying the pool
        reason: String,
    },

    /// No worker unit initialized successfully for a run
    #[error("No usable units: {reason}")]
    NoUsableUnits {
        /// Summary of the unit failures
        reason: String,
    },

    /// The aggregation module failed to produce a snapshot
    #[error("Flush failure: {reason}")]
    FlushFailure {
        /// Why the snapshot could not be produced
        reason: String,
    },

    /// The job was never executed because its run was cancelled
    #[error("Cancelled: {reason}")]
    Cancelled {
        /// Cancellation context
        reason: String,
    },

    /// A unit or the coordinator went away while a request was outstanding
    #[error("Channel closed: {reason}")]
    ChannelClosed {
        /// Which channel closed
        reason: String,
    },
}

/// Discriminant of [`PoolError`], used in events and structured logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// [`PoolError::LoadFailure`]
    LoadFailure,
    /// [`PoolError::RunFailure`]
    RunFailure,
    /// [`PoolError::MalformedResult`]
    MalformedResult,
    /// [`PoolError::InvalidState`]
    InvalidState,
    /// [`PoolError::Busy`]
    Busy,
    /// [`PoolError::NoUsableUnits`]
    NoUsableUnits,
    /// [`PoolError::FlushFailure`]
    FlushFailure,
    /// [`PoolError::Cancelled`]
    Cancelled,
    /// [`PoolError::ChannelClosed`]
    ChannelClosed,
}

impl PoolError {
    /// Create a load failure error
    pub fn load_failure(reason: impl Into<String>) -> Self {
        Self::LoadFailure {
            reason: reason.into(),
        }
    }

    /// Create a run failure error
    pub fn run_failure(reason: impl Into<String>) -> Self {
        Self::RunFailure {
            reason: reason.into(),
        }
    }

    /// Create a malformed result error
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedResult {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }

    /// Create a busy error
    pub fn busy(reason: impl Into<String>) -> Self {
        Self::Busy {
            reason: reason.into(),
        }
    }

    /// Create a no-usable-units error
    pub fn no_usable_units(reason: impl Into<String>) -> Self {
        Self::NoUsableUnits {
            reason: reason.into(),
        }
    }

    /// Create a flush failure error
    pub fn flush_failure(reason: impl Into<String>) -> Self {
        Self::FlushFailure {
            reason: reason.into(),
        }
    }

    /// Create a cancelled error
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Create a channel closed error
    pub fn channel_closed(reason: impl Into<String>) -> Self {
        Self::ChannelClosed {
            reason: reason.into(),
        }
    }

    /// The discriminant of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::LoadFailure { .. } => ErrorKind::LoadFailure,
            Self::RunFailure { .. } => ErrorKind::RunFailure,
            Self::MalformedResult { .. } => ErrorKind::MalformedResult,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::Busy { .. } => ErrorKind::Busy,
            Self::NoUsableUnits { .. } => ErrorKind::NoUsableUnits,
            Self::FlushFailure { .. } => ErrorKind::FlushFailure,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::ChannelClosed { .. } => ErrorKind::ChannelClosed,
        }
    }

    /// Whether this failure makes the reporting unit unusable for the run
    pub fn is_unit_fatal(&self) -> bool {
        matches!(self, Self::LoadFailure { .. })
    }

    /// The human-readable reason carried by this error
    pub fn reason(&self) -> &str {
        match self {
            Self::LoadFailure { reason }
            | Self::RunFailure { reason }
            | Self::MalformedResult { reason }
            | Self::InvalidState { reason }
            | Self::Busy { reason }
            | Self::NoUsableUnits { reason }
            | Self::FlushFailure { reason }
            | Self::Cancelled { reason }
            | Self::ChannelClosed { reason } => reason,
        }
    }
}

/// Standard Result type for simpool operations
pub type Result<T> = std::result::Result<T, PoolError>;

/// Failure reported by a pluggable module.
///
/// Modules only report a message; the hosting unit decides which
/// [`PoolError`] variant the failure becomes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ModuleError {
    /// Message reported by the module
    pub message: String,
}

impl ModuleError {
    /// Create a module error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for ModuleError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for ModuleError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PoolError::run_failure("bad seed");
        assert_eq!(err.to_string(), "Run failure: bad seed");
        assert_eq!(err.kind(), ErrorKind::RunFailure);
        assert_eq!(err.reason(), "bad seed");
    }

    #[test]
    fn test_only_load_failures_are_unit_fatal() {
        assert!(PoolError::load_failure("x").is_unit_fatal());
        assert!(!PoolError::run_failure("x").is_unit_fatal());
        assert!(!PoolError::malformed("x").is_unit_fatal());
        assert!(!PoolError::invalid_state("x").is_unit_fatal());
    }

    #[test]
    fn test_error_serde() {
        let err = PoolError::busy("run in progress");
        let json = serde_json::to_string(&err).unwrap();
        let back: PoolError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }
}

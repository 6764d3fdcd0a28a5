//! Core data model: configuration, seeds, jobs and result blobs

use crate::ids::JobId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Opaque simulation configuration shared verbatim by every unit of a run.
///
/// Cloning is cheap; the text is never interpreted by the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration(Arc<str>);

impl Configuration {
    /// Wrap configuration text
    pub fn new(text: impl Into<Arc<str>>) -> Self {
        Self(text.into())
    }

    /// The configuration text as given
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Empty or whitespace only
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<&str> for Configuration {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<String> for Configuration {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

/// Opaque seed string identifying one trial
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Seed(String);

impl Seed {
    /// Seed from arbitrary text
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// The seed text
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Interpret the seed as a decimal `u64`, the form produced by seed derivation
    pub fn as_u64(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl From<u64> for Seed {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for Seed {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl fmt::Display for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One simulation iteration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Iteration index within the run
    pub id: JobId,
    /// Seed the module runs this iteration with
    pub seed: Seed,
}

impl Job {
    /// Job for iteration `id` with `seed`
    pub fn new(id: JobId, seed: Seed) -> Self {
        Self { id, seed }
    }
}

/// Opaque binary output of one completed iteration.
///
/// Moved from worker to pool to aggregator; never mutated.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultBlob(#[serde(with = "serde_bytes")] Vec<u8>);

impl ResultBlob {
    /// Wrap module output
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Raw payload
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the module returned no bytes
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ResultBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResultBlob({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for ResultBlob {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// Information a module reports after a successful initialize
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InitInfo {
    /// Module-defined details, passed through untouched
    pub details: serde_json::Value,
}

impl InitInfo {
    /// Report `details` from initialize
    pub fn new(details: serde_json::Value) -> Self {
        Self { details }
    }
}

/// Wall-clock source injected into components that report elapsed time
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_ms(&self) -> i64;
}

/// [`Clock`] backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_roundtrip_u64() {
        let seed = Seed::from(42u64);
        assert_eq!(seed.as_str(), "42");
        assert_eq!(seed.as_u64(), Some(42));
        assert_eq!(Seed::new("not-a-number").as_u64(), None);
    }

    #[test]
    fn test_blank_configuration() {
        assert!(Configuration::from("  \n").is_blank());
        assert!(!Configuration::from("iterations=10").is_blank());
    }

    #[test]
    fn test_blob_debug_hides_payload() {
        let blob = ResultBlob::new(vec![1, 2, 3]);
        assert_eq!(format!("{blob:?}"), "ResultBlob(3 bytes)");
    }
}

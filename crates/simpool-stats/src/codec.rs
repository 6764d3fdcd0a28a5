//! Wire format of one trial's result blob
//!
//! Simulation modules that want to use [`crate::StatsAggregator`] encode
//! their output as a bincode [`TrialResult`].

use serde::{Deserialize, Serialize};
use simpool_core::{ResultBlob, Seed};
use std::collections::BTreeMap;

/// Errors decoding or validating a trial result
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    /// Bytes are not a bincode trial result
    #[error("cannot decode trial result: {0}")]
    Decode(String),

    /// Serialization failed
    #[error("cannot encode trial result: {0}")]
    Encode(String),

    /// A value is NaN or infinite
    #[error("non-finite value {value} for {metric}")]
    NonFinite {
        /// `value` for the primary value, otherwise the metric name
        metric: String,
        /// The offending value
        value: f64,
    },
}

/// Output of one trial: the seed that produced it, a primary value and
/// any number of named secondary metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    /// Seed the trial ran with
    pub seed: Seed,
    /// Primary value
    pub value: f64,
    /// Named secondary metrics
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl TrialResult {
    /// Result with no secondary metrics
    pub fn new(seed: Seed, value: f64) -> Self {
        Self {
            seed,
            value,
            metrics: BTreeMap::new(),
        }
    }

    /// Add or replace a secondary metric
    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    /// Reject NaN and infinite values anywhere in the result
    pub fn validate(&self) -> Result<(), CodecError> {
        if !self.value.is_finite() {
            return Err(CodecError::NonFinite {
                metric: "value".to_string(),
                value: self.value,
            });
        }
        for (name, value) in &self.metrics {
            if !value.is_finite() {
                return Err(CodecError::NonFinite {
                    metric: name.clone(),
                    value: *value,
                });
            }
        }
        Ok(())
    }

    /// Encode as bincode
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Encode into a [`ResultBlob`]
    pub fn to_blob(&self) -> Result<ResultBlob, CodecError> {
        self.encode().map(ResultBlob::new)
    }

    /// Decode and validate a blob
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let trial: TrialResult =
            bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))?;
        trial.validate()?;
        Ok(trial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_decode_rejects_garbage() {
        assert_matches!(TrialResult::decode(&[0xff, 0x01]), Err(CodecError::Decode(_)));
        assert_matches!(TrialResult::decode(&[]), Err(CodecError::Decode(_)));
    }

    #[test]
    fn test_decode_rejects_non_finite_metric() {
        let bytes = TrialResult::new(Seed::from(1u64), 2.0)
            .with_metric("dps", f64::NAN)
            .encode()
            .unwrap();
        assert_matches!(
            TrialResult::decode(&bytes),
            Err(CodecError::NonFinite { metric, .. }) if metric == "dps"
        );
    }

    #[test]
    fn test_decode_preserves_metrics() {
        let trial = TrialResult::new(Seed::from("abc"), 10.5).with_metric("crits", 3.0);
        let decoded = TrialResult::decode(&trial.encode().unwrap()).unwrap();
        assert_eq!(decoded.metrics.get("crits"), Some(&3.0));
        assert_eq!(decoded.seed.as_str(), "abc");
    }
}

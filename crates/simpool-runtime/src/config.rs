//! Pool configuration and run requests

use serde::{Deserialize, Serialize};
use simpool_core::{derive_jobs, explicit_jobs, random_base_seed, Configuration, Job, Seed};
use std::path::Path;

/// Errors loading or validating a [`PoolConfig`]
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid TOML for [`PoolConfig`]
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// A setting is out of range
    #[error("invalid value for {key}: {message}")]
    Invalid {
        /// Name of the setting
        key: String,
        /// What is wrong with it
        message: String,
    },
}

impl ConfigError {
    fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Pool sizing and channel capacities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker units
    pub worker_count: usize,
    /// Upper bound applied to every resize
    pub max_workers: usize,
    /// Capacity of the caller-to-coordinator command channel
    pub command_buffer_size: usize,
    /// Capacity of the pool event broadcast channel
    pub event_buffer_size: usize,
    /// Prefix for unit thread names
    pub unit_name_prefix: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 3,
            max_workers: 30,
            command_buffer_size: 64,
            event_buffer_size: 1024,
            unit_name_prefix: "simpool-unit".to_string(),
        }
    }
}

impl PoolConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: PoolConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Override fields from `SIMPOOL_*` environment variables
    pub fn merge_with_env(&mut self) -> Result<(), ConfigError> {
        self.merge_with_vars(std::env::vars())
    }

    /// Override fields from `SIMPOOL_*` key/value pairs
    pub fn merge_with_vars<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(field) = key.strip_prefix("SIMPOOL_") else {
                continue;
            };
            let parse = |value: &str| {
                value
                    .parse::<usize>()
                    .map_err(|e| ConfigError::invalid(&key, e.to_string()))
            };
            match field {
                "WORKER_COUNT" => self.worker_count = parse(&value)?,
                "MAX_WORKERS" => self.max_workers = parse(&value)?,
                "COMMAND_BUFFER_SIZE" => self.command_buffer_size = parse(&value)?,
                "EVENT_BUFFER_SIZE" => self.event_buffer_size = parse(&value)?,
                "UNIT_NAME_PREFIX" => self.unit_name_prefix = value,
                _ => {}
            }
        }
        self.validate()
    }

    /// Check channel capacities and worker limits
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command_buffer_size == 0 {
            return Err(ConfigError::invalid("command_buffer_size", "must be > 0"));
        }
        if self.event_buffer_size == 0 {
            return Err(ConfigError::invalid("event_buffer_size", "must be > 0"));
        }
        if self.max_workers == 0 {
            return Err(ConfigError::invalid("max_workers", "must be > 0"));
        }
        Ok(())
    }

    /// Clamp a requested worker count to `max_workers`
    pub fn clamp_workers(&self, requested: usize) -> usize {
        requested.min(self.max_workers)
    }
}

/// How a cancelled run treats results still in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelMode {
    /// Forward in-flight results to the aggregator
    Drain,
    /// Drop in-flight results as they arrive
    Discard,
}

#[derive(Debug, Clone, PartialEq)]
enum JobSource {
    Derived { count: u64 },
    Explicit(Vec<Seed>),
}

/// A batch of iterations under one configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    config: Configuration,
    source: JobSource,
    base_seed: Option<u64>,
}

impl RunRequest {
    /// Run `target_iterations` jobs with seeds derived from a base seed
    pub fn new(config: impl Into<Configuration>, target_iterations: u64) -> Self {
        Self {
            config: config.into(),
            source: JobSource::Derived {
                count: target_iterations,
            },
            base_seed: None,
        }
    }

    /// Run exactly the given seeds, one job each
    pub fn with_seeds(config: impl Into<Configuration>, seeds: Vec<Seed>) -> Self {
        Self {
            config: config.into(),
            source: JobSource::Explicit(seeds),
            base_seed: None,
        }
    }

    /// Fix the base seed used for derivation. Ignored for explicit seeds.
    pub fn with_base_seed(mut self, base_seed: u64) -> Self {
        self.base_seed = Some(base_seed);
        self
    }

    /// Configuration every unit is initialized with
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Number of jobs the run will contain
    pub fn target(&self) -> u64 {
        match &self.source {
            JobSource::Derived { count } => *count,
            JobSource::Explicit(seeds) => seeds.len() as u64,
        }
    }

    /// Materialize the job list, drawing a base seed if none was given.
    /// Returns the base seed actually used, if seeds were derived.
    pub(crate) fn into_jobs(self) -> (Configuration, Option<u64>, Vec<Job>) {
        match self.source {
            JobSource::Derived { count } => {
                let base_seed = self.base_seed.unwrap_or_else(random_base_seed);
                (self.config, Some(base_seed), derive_jobs(base_seed, count))
            }
            JobSource::Explicit(seeds) => (self.config, None, explicit_jobs(seeds)),
        }
    }
}

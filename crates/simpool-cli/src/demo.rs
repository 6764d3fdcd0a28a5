//! Dice-rolling demo simulation
//!
//! Each iteration rolls `dice` dice with `sides` faces and reports the total.
//! Metrics carry the highest single die and whether the total reached
//! `target`.

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;
use simpool_core::{
    AggregationModule, Clock, Configuration, InitInfo, Job, ModuleError, ModuleFactory, SimulationModule,
    UnitId,
};
use simpool_stats::{StatsAggregator, TrialResult};
use std::sync::Arc;

/// Parsed demo configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiceConfig {
    /// Dice rolled per iteration
    pub dice: u32,
    /// Faces per die
    pub sides: u32,
    /// Total counted as a hit
    #[serde(default)]
    pub target: Option<u32>,
}

impl DiceConfig {
    /// Parse and validate JSON configuration text
    pub fn parse(config: &Configuration) -> Result<Self, ModuleError> {
        let parsed: DiceConfig = serde_json::from_str(config.as_str())
            .map_err(|e| ModuleError::new(format!("invalid dice config: {e}")))?;
        if parsed.dice == 0 || parsed.sides == 0 {
            return Err(ModuleError::new("dice and sides must be positive"));
        }
        Ok(parsed)
    }
}

/// Worker-side dice module
#[derive(Default)]
pub struct DiceSimulation {
    config: Option<DiceConfig>,
}

impl SimulationModule for DiceSimulation {
    fn initialize(&mut self, config: &Configuration) -> Result<InitInfo, ModuleError> {
        let parsed = DiceConfig::parse(config)?;
        let info = InitInfo::new(serde_json::json!({
            "dice": parsed.dice,
            "sides": parsed.sides,
        }));
        self.config = Some(parsed);
        Ok(info)
    }

    fn run(&mut self, job: &Job) -> Result<Vec<u8>, ModuleError> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| ModuleError::new("not initialized"))?;
        let seed = job
            .seed
            .as_u64()
            .ok_or_else(|| ModuleError::new(format!("seed {} is not numeric", job.seed)))?;

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut total = 0u64;
        let mut highest = 0u32;
        for _ in 0..config.dice {
            let roll = rng.gen_range(1..=config.sides);
            total += u64::from(roll);
            highest = highest.max(roll);
        }

        let mut trial =
            TrialResult::new(job.seed.clone(), total as f64).with_metric("highest_die", f64::from(highest));
        if let Some(target) = config.target {
            let hit = if total >= u64::from(target) { 1.0 } else { 0.0 };
            trial = trial.with_metric("hit_target", hit);
        }
        trial.encode().map_err(|e| ModuleError::new(e.to_string()))
    }
}

/// Loads [`DiceSimulation`] units and a [`StatsAggregator`]
pub struct DemoFactory;

impl ModuleFactory for DemoFactory {
    fn load_simulation(&self, unit: UnitId) -> Result<Box<dyn SimulationModule>, ModuleError> {
        tracing::trace!(%unit, "loading dice simulation");
        Ok(Box::<DiceSimulation>::default())
    }

    fn load_aggregator(&self, clock: Arc<dyn Clock>) -> Result<Box<dyn AggregationModule>, ModuleError> {
        Ok(Box::new(StatsAggregator::with_clock(clock)))
    }
}

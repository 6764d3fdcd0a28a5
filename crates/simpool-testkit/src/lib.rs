//! Simpool testing infrastructure
//!
//! Scripted simulation modules whose behavior per unit and per job is set up
//! front, a [`RunGate`] for holding jobs in flight and a [`ManualClock`] for
//! pinning elapsed time.
//!
//! ```rust,no_run
//! use simpool_testkit::ScriptedFactory;
//!
//! let factory = ScriptedFactory::new().fail_job(2).malformed_job(4);
//! ```
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use parking_lot::{Condvar, Mutex};
use simpool_core::{
    AggregationModule, Clock, Configuration, InitInfo, Job, JobId, ModuleError, ModuleFactory,
    SimulationModule, UnitId,
};
use simpool_stats::{StatsAggregator, TrialResult};
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

type ValueFn = Arc<dyn Fn(&Job) -> f64 + Send + Sync>;

/// Blocks jobs until opened
#[derive(Default)]
pub struct RunGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

#[derive(Default)]
struct GateState {
    open: bool,
    entered: usize,
}

impl RunGate {
    /// A closed gate, shared between the test and the modules
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Called by a module: count the arrival, then block until open
    pub fn pass(&self) {
        let mut state = self.state.lock();
        state.entered += 1;
        self.changed.notify_all();
        while !state.open {
            self.changed.wait(&mut state);
        }
    }

    /// Release every held job and let later ones through
    pub fn open(&self) {
        self.state.lock().open = true;
        self.changed.notify_all();
    }

    /// Jobs that reached the gate so far
    pub fn entered(&self) -> usize {
        self.state.lock().entered
    }

    /// Block until `count` jobs reached the gate. Returns false on timeout.
    pub fn wait_for_entered(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.entered < count {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return state.entered >= count;
            }
        }
        true
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    /// Clock reading `now_ms`
    pub fn at(now_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            now_ms: AtomicI64::new(now_ms),
        })
    }

    /// Move the clock forward
    pub fn advance(&self, ms: i64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

#[derive(Default, Clone)]
struct Script {
    fail_load: HashSet<UnitId>,
    fail_initialize: HashSet<UnitId>,
    fail_jobs: HashSet<u64>,
    panic_jobs: HashSet<u64>,
    malformed_jobs: HashSet<u64>,
    reject_config: Option<String>,
    fail_aggregator_load: bool,
}

/// Factory for scripted simulation modules and a real [`StatsAggregator`]
#[derive(Clone)]
pub struct ScriptedFactory {
    script: Arc<Script>,
    value: ValueFn,
    /// Gate and the first job index it holds
    gate: Option<(Arc<RunGate>, u64)>,
    log: Arc<Mutex<Vec<(UnitId, JobId)>>>,
}

impl Default for ScriptedFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedFactory {
    /// Every job succeeds with value `index + 1`
    pub fn new() -> Self {
        Self {
            script: Arc::new(Script::default()),
            value: Arc::new(|job: &Job| (job.id.index() + 1) as f64),
            gate: None,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn script(mut self, edit: impl FnOnce(&mut Script)) -> Self {
        edit(Arc::make_mut(&mut self.script));
        self
    }

    /// Compute each job's primary value with `value`
    pub fn with_values(mut self, value: impl Fn(&Job) -> f64 + Send + Sync + 'static) -> Self {
        self.value = Arc::new(value);
        self
    }

    /// Module load fails on `unit`
    pub fn fail_load_on(self, unit: UnitId) -> Self {
        self.script(|s| {
            s.fail_load.insert(unit);
        })
    }

    /// `initialize` fails on `unit`
    pub fn fail_initialize_on(self, unit: UnitId) -> Self {
        self.script(|s| {
            s.fail_initialize.insert(unit);
        })
    }

    /// Every module rejects configurations equal to `config`
    pub fn reject_config(self, config: &str) -> Self {
        let config = config.to_string();
        self.script(|s| s.reject_config = Some(config))
    }

    /// Job `index` returns a run error
    pub fn fail_job(self, index: u64) -> Self {
        self.script(|s| {
            s.fail_jobs.insert(index);
        })
    }

    /// Job `index` panics inside the module
    pub fn panic_job(self, index: u64) -> Self {
        self.script(|s| {
            s.panic_jobs.insert(index);
        })
    }

    /// Job returns bytes that do not decode as a trial result
    pub fn malformed_job(self, index: u64) -> Self {
        self.script(|s| {
            s.malformed_jobs.insert(index);
        })
    }

    /// The aggregation module fails to load
    pub fn fail_aggregator_load(self) -> Self {
        self.script(|s| s.fail_aggregator_load = true)
    }

    /// Hold every job at `gate` until it opens
    pub fn with_gate(self, gate: Arc<RunGate>) -> Self {
        self.with_gate_from(gate, 0)
    }

    /// Hold jobs with index `first` and above at `gate`; earlier jobs run freely
    pub fn with_gate_from(mut self, gate: Arc<RunGate>, first: u64) -> Self {
        self.gate = Some((gate, first));
        self
    }

    /// Jobs executed so far, with the unit that ran each
    pub fn executed(&self) -> Vec<(UnitId, JobId)> {
        self.log.lock().clone()
    }

    /// Share as the pool's module factory
    pub fn into_factory(self) -> Arc<dyn ModuleFactory> {
        Arc::new(self)
    }
}

impl ModuleFactory for ScriptedFactory {
    fn load_simulation(&self, unit: UnitId) -> Result<Box<dyn SimulationModule>, ModuleError> {
        if self.script.fail_load.contains(&unit) {
            return Err(ModuleError::new(format!("scripted load failure on {unit}")));
        }
        Ok(Box::new(ScriptedModule {
            unit,
            factory: self.clone(),
            initialized: false,
        }))
    }

    fn load_aggregator(&self, clock: Arc<dyn Clock>) -> Result<Box<dyn AggregationModule>, ModuleError> {
        if self.script.fail_aggregator_load {
            return Err(ModuleError::new("scripted aggregator load failure"));
        }
        Ok(Box::new(StatsAggregator::with_clock(clock)))
    }
}

struct ScriptedModule {
    unit: UnitId,
    factory: ScriptedFactory,
    initialized: bool,
}

impl SimulationModule for ScriptedModule {
    fn initialize(&mut self, config: &Configuration) -> Result<InitInfo, ModuleError> {
        let script = &self.factory.script;
        if script.fail_initialize.contains(&self.unit) {
            return Err(ModuleError::new(format!(
                "scripted initialize failure on {}",
                self.unit
            )));
        }
        if script.reject_config.as_deref() == Some(config.as_str()) {
            return Err(ModuleError::new("configuration rejected"));
        }
        self.initialized = true;
        Ok(InitInfo::default())
    }

    fn run(&mut self, job: &Job) -> Result<Vec<u8>, ModuleError> {
        assert!(self.initialized, "run before initialize");
        let index = job.id.index();
        if let Some((gate, first)) = &self.factory.gate {
            if index >= *first {
                gate.pass();
            }
        }
        self.factory.log.lock().push((self.unit, job.id));

        let script = &self.factory.script;
        if script.panic_jobs.contains(&index) {
            panic!("scripted panic on {}", job.id);
        }
        if script.fail_jobs.contains(&index) {
            return Err(ModuleError::new(format!("scripted failure on {}", job.id)));
        }
        if script.malformed_jobs.contains(&index) {
            return Ok(vec![0xff; 3]);
        }
        let value = (self.factory.value)(job);
        TrialResult::new(job.seed.clone(), value)
            .with_metric("double", value * 2.0)
            .encode()
            .map_err(|e| ModuleError::new(e.to_string()))
    }
}

//! Caller-facing pool handle
//!
//! [`Pool`] is a cheap clonable front for the coordinator task. Every
//! operation is a command plus a oneshot reply, so calls from several tasks
//! are serialized by the coordinator.

use crate::config::{CancelMode, ConfigError, PoolConfig, RunRequest};
use crate::coordinator::{Command, Coordinator};
use crate::events::PoolEvent;
use crate::run::{PoolStatus, RunStatus, RunSummary};
use crate::unit::spawn_worker;
use simpool_core::{
    Clock, Configuration, Job, JobId, ModuleFactory, PoolError, RequestId, Result, ResultBlob,
    RunId, Seed, Snapshot, SystemClock, UnitEvent, UnitId, UnitRequest, UnitResponse,
};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

/// Handle to a running execution pool
#[derive(Clone)]
pub struct Pool {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<PoolEvent>,
    factory: Arc<dyn ModuleFactory>,
    unit_name_prefix: Arc<str>,
}

impl Pool {
    /// Start a pool with `config.worker_count` worker slots.
    ///
    /// Must be called from within a tokio runtime. Units are spawned lazily
    /// when the first run starts.
    pub fn new(config: PoolConfig, factory: Arc<dyn ModuleFactory>) -> std::result::Result<Self, ConfigError> {
        Self::with_clock(config, factory, Arc::new(SystemClock))
    }

    /// Start a pool that stamps runs with `clock`
    pub fn with_clock(
        config: PoolConfig,
        factory: Arc<dyn ModuleFactory>,
        clock: Arc<dyn Clock>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let (commands, command_rx) = mpsc::channel(config.command_buffer_size);
        let (events, _) = broadcast::channel(config.event_buffer_size);
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let unit_name_prefix: Arc<str> = Arc::from(config.unit_name_prefix.as_str());

        let coordinator = Coordinator::new(config, factory.clone(), clock, events.clone(), inbox);
        tokio::spawn(coordinator.run(command_rx, inbox_rx));

        Ok(Self {
            commands,
            events,
            factory,
            unit_name_prefix,
        })
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| PoolError::channel_closed("the pool has shut down"))?;
        response
            .await
            .map_err(|_| PoolError::channel_closed("the pool dropped the request"))
    }

    /// Resize the pool. Returns the count actually applied after clamping.
    ///
    /// Fails with [`PoolError::Busy`] while a run is active.
    pub async fn set_worker_count(&self, count: usize) -> Result<usize> {
        self.request(|reply| Command::SetWorkerCount { count, reply })
            .await?
    }

    /// Start a run. Resolves once units and aggregator are initialized and
    /// dispatch has begun.
    pub async fn start_run(&self, request: RunRequest) -> Result<RunHandle> {
        self.request(|reply| Command::StartRun { request, reply })
            .await?
    }

    /// Snapshot the aggregator's current statistics.
    ///
    /// `start_time_ms` is the caller's notion of when the run began; the
    /// snapshot reports time elapsed since then.
    pub async fn flush(&self, start_time_ms: i64) -> Result<Snapshot> {
        self.request(|reply| Command::Flush {
            start_time_ms,
            reply,
        })
        .await?
    }

    /// Stop dispatching new jobs for the active run
    pub async fn cancel(&self, mode: CancelMode) -> Result<()> {
        self.request(|reply| Command::Cancel { mode, reply }).await?
    }

    /// Current worker, aggregator and run state
    pub async fn status(&self) -> Result<PoolStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Receive pool events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Run a single iteration on a throwaway unit, outside any run.
    ///
    /// The unit does not count against the pool's worker slots and is torn
    /// down afterwards.
    pub async fn sample(&self, config: impl Into<Configuration>, seed: impl Into<Seed>) -> Result<ResultBlob> {
        let config = config.into();
        let job = Job::new(JobId::new(0), seed.into());
        let (inbox, mut events) = mpsc::unbounded_channel();
        let unit = spawn_worker(
            UnitId::SAMPLER,
            self.factory.clone(),
            inbox,
            &self.unit_name_prefix,
        )?;
        tracing::debug!(seed = %job.seed, "sampling one iteration");

        let init = RequestId::new(1);
        let run = RequestId::new(2);
        unit.send(init, UnitRequest::Initialize { config })?;
        unit.send(run, UnitRequest::Run { job })?;

        while let Some(event) = events.recv().await {
            let UnitEvent::Response {
                request, response, ..
            } = event
            else {
                continue;
            };
            match response {
                UnitResponse::Failed { error } => return Err(error),
                UnitResponse::Done { blob, .. } if request == run => return Ok(blob),
                _ => {}
            }
        }
        Err(PoolError::channel_closed("the sampling unit exited"))
    }

    /// Terminate every unit and stop the coordinator. An active run ends
    /// with [`RunStatus::Failed`].
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// Caller's view of a started run
#[derive(Debug, Clone)]
pub struct RunHandle {
    id: RunId,
    base_seed: Option<u64>,
    target: u64,
    started_at_ms: i64,
    status: watch::Receiver<RunStatus>,
}

impl RunHandle {
    pub(crate) fn new(
        id: RunId,
        base_seed: Option<u64>,
        target: u64,
        started_at_ms: i64,
        status: watch::Receiver<RunStatus>,
    ) -> Self {
        Self {
            id,
            base_seed,
            target,
            started_at_ms,
            status,
        }
    }

    /// Id of the run
    pub fn id(&self) -> RunId {
        self.id
    }

    /// Base seed the job seeds were derived from; `None` for explicit seeds
    pub fn base_seed(&self) -> Option<u64> {
        self.base_seed
    }

    /// Number of jobs in the run
    pub fn target(&self) -> u64 {
        self.target
    }

    /// Pool clock time when the run was accepted; pass to [`Pool::flush`]
    pub fn started_at_ms(&self) -> i64 {
        self.started_at_ms
    }

    /// Latest published status
    pub fn status(&self) -> RunStatus {
        self.status.borrow().clone()
    }

    /// Wait for the run to finish
    pub async fn wait(&mut self) -> Result<RunSummary> {
        loop {
            match &*self.status.borrow_and_update() {
                RunStatus::Completed(summary) => return Ok(summary.clone()),
                RunStatus::Failed(error) => return Err(error.clone()),
                _ => {}
            }
            self.status
                .changed()
                .await
                .map_err(|_| PoolError::channel_closed("the pool stopped before the run finished"))?;
        }
    }
}

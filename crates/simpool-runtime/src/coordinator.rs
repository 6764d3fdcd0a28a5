//! Pool coordinator
//!
//! A single tokio task owns every piece of mutable scheduling state: worker
//! slots, the job queue, per-job state and the table of outstanding unit
//! requests. Callers reach it through the [`Command`] channel; units reach it
//! through the inbox. Handlers never await, so all state mutations are
//! serialized by construction.
//!
//! # Resize policy
//!
//! `SetWorkerCount` is rejected with [`PoolError::Busy`] while a run is
//! active. A run always completes on the topology it started with.

use crate::config::{CancelMode, PoolConfig, RunRequest};
use crate::events::{emit, PoolEvent};
use crate::pool::RunHandle;
use crate::run::{JobFailure, JobState, PoolStatus, Progress, RunStatus, RunSummary, UnitState};
use crate::unit::{spawn_aggregator, spawn_worker, Inbox, UnitHandle};
use simpool_core::{
    Clock, Job, JobId, ModuleFactory, PoolError, RequestId, Result, RunId,
    Snapshot, UnitEvent, UnitId, UnitRequest, UnitResponse,
};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

/// Caller request to the coordinator
pub(crate) enum Command {
    SetWorkerCount {
        count: usize,
        reply: oneshot::Sender<Result<usize>>,
    },
    StartRun {
        request: RunRequest,
        reply: oneshot::Sender<Result<RunHandle>>,
    },
    Flush {
        start_time_ms: i64,
        reply: oneshot::Sender<Result<Snapshot>>,
    },
    Cancel {
        mode: CancelMode,
        reply: oneshot::Sender<Result<()>>,
    },
    Status {
        reply: oneshot::Sender<PoolStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Continuation of an outstanding unit request
enum Pending {
    WorkerInit { run: RunId, unit: UnitId },
    AggregatorInit { run: RunId },
    Job { run: RunId, unit: UnitId, job: JobId },
    Add { run: RunId, job: JobId },
    Flush { reply: oneshot::Sender<Result<Snapshot>> },
    FinalFlush { run: RunId },
}

/// Outstanding requests keyed by correlation id; each resolves exactly once
#[derive(Default)]
struct RequestTable {
    next: u64,
    pending: HashMap<RequestId, Pending>,
}

impl RequestTable {
    fn register(&mut self, pending: Pending) -> RequestId {
        // 0 is reserved for unanswered Terminate requests
        self.next += 1;
        let id = RequestId::new(self.next);
        self.pending.insert(id, pending);
        id
    }

    fn resolve(&mut self, id: RequestId) -> Option<Pending> {
        self.pending.remove(&id)
    }

    /// Drop every outstanding request matching `predicate`
    fn drain_where(&mut self, predicate: impl Fn(&Pending) -> bool) -> Vec<Pending> {
        let ids: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, pending)| predicate(pending))
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect()
    }
}

struct WorkerSlot {
    id: UnitId,
    state: UnitState,
    handle: Option<UnitHandle>,
}

impl WorkerSlot {
    fn uninitialized(id: UnitId) -> Self {
        Self {
            id,
            state: UnitState::Uninitialized,
            handle: None,
        }
    }

    fn terminate(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.terminate();
        }
        self.state = UnitState::Terminated;
    }
}

enum Phase {
    Initializing {
        awaiting_units: usize,
        aggregator: Option<Result<()>>,
        reply: Option<oneshot::Sender<Result<RunHandle>>>,
    },
    Dispatching,
    Finalizing,
}

struct ActiveRun {
    id: RunId,
    base_seed: Option<u64>,
    started_at_ms: i64,
    phase: Phase,
    jobs: Vec<Job>,
    states: Vec<JobState>,
    queue: VecDeque<usize>,
    /// Job index currently held by each busy unit
    assigned: HashMap<UnitId, usize>,
    in_flight_adds: usize,
    active_units: BTreeSet<UnitId>,
    excluded: Vec<(UnitId, PoolError)>,
    completed: u64,
    failed: Vec<JobFailure>,
    cancelled: u64,
    discarded: u64,
    cancel: Option<CancelMode>,
    status: watch::Sender<RunStatus>,
}

impl ActiveRun {
    fn target(&self) -> u64 {
        self.jobs.len() as u64
    }

    fn progress(&self) -> Progress {
        Progress {
            completed: self.completed,
            failed: self.failed.len() as u64,
            cancelled: self.cancelled,
            discarded: self.discarded,
            total: self.target(),
        }
    }

    /// Move a job to `next`, refusing illegal transitions so no job is ever
    /// counted twice
    fn transition(&mut self, index: usize, next: JobState) -> bool {
        let Some(current) = self.states.get(index).copied() else {
            tracing::error!(run = %self.id, index, "transition for unknown job");
            return false;
        };
        if !current.can_transition_to(next) {
            tracing::error!(run = %self.id, index, ?current, ?next, "illegal job transition");
            return false;
        }
        self.states[index] = next;
        true
    }

    fn record_failure(&mut self, index: usize, unit: Option<UnitId>, error: PoolError) -> Option<JobFailure> {
        if !self.transition(index, JobState::Failed) {
            return None;
        }
        let failure = JobFailure {
            job: self.jobs[index].id,
            seed: self.jobs[index].seed.clone(),
            unit,
            error,
        };
        tracing::warn!(run = %self.id, job = %failure.job, seed = %failure.seed, error = %failure.error, "job failed");
        self.failed.push(failure.clone());
        Some(failure)
    }

    fn publish_progress(&self, events: &broadcast::Sender<PoolEvent>) {
        let progress = self.progress();
        let status = match (&self.phase, self.cancel) {
            (Phase::Finalizing, _) => RunStatus::Finalizing(progress),
            (_, Some(_)) => RunStatus::Cancelling(progress),
            _ => RunStatus::Running(progress),
        };
        self.status.send_replace(status);
        emit(
            events,
            PoolEvent::Progress {
                run: self.id,
                progress,
            },
        );
    }

    fn summary(&self, snapshot: Option<Snapshot>) -> RunSummary {
        RunSummary {
            run: self.id,
            base_seed: self.base_seed,
            target: self.target(),
            completed: self.completed,
            failed: self.failed.clone(),
            cancelled: self.cancelled,
            discarded: self.discarded,
            excluded_units: self.excluded.clone(),
            snapshot,
        }
    }

    fn handle(&self) -> RunHandle {
        RunHandle::new(
            self.id,
            self.base_seed,
            self.target(),
            self.started_at_ms,
            self.status.subscribe(),
        )
    }
}

pub(crate) struct Coordinator {
    config: PoolConfig,
    factory: Arc<dyn ModuleFactory>,
    clock: Arc<dyn Clock>,
    slots: Vec<WorkerSlot>,
    aggregator: Option<UnitHandle>,
    aggregator_state: UnitState,
    /// Replaced aggregators whose exit is still to be reported
    retired_aggregators: usize,
    next_unit: u32,
    requests: RequestTable,
    run: Option<ActiveRun>,
    events: broadcast::Sender<PoolEvent>,
    inbox: Inbox,
}

impl Coordinator {
    pub(crate) fn new(
        config: PoolConfig,
        factory: Arc<dyn ModuleFactory>,
        clock: Arc<dyn Clock>,
        events: broadcast::Sender<PoolEvent>,
        inbox: Inbox,
    ) -> Self {
        let mut coordinator = Self {
            config,
            factory,
            clock,
            slots: Vec::new(),
            aggregator: None,
            aggregator_state: UnitState::Uninitialized,
            retired_aggregators: 0,
            next_unit: 0,
            requests: RequestTable::default(),
            run: None,
            events,
            inbox,
        };
        let initial = coordinator.config.clamp_workers(coordinator.config.worker_count);
        coordinator.resize(initial);
        coordinator
    }

    /// Main loop. Unit events are drained before caller commands so a flush
    /// observes every result already received.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut inbox: mpsc::UnboundedReceiver<UnitEvent>,
    ) {
        tracing::info!(workers = self.slots.len(), "pool coordinator started");
        loop {
            tokio::select! {
                biased;
                Some(event) = inbox.recv() => self.handle_event(event),
                command = commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).is_break() {
                            break;
                        }
                    }
                    None => {
                        self.shutdown();
                        break;
                    }
                },
            }
        }
        tracing::info!("pool coordinator stopped");
    }

    /// Apply one caller command; breaks once the pool has shut down
    fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::SetWorkerCount { count, reply } => {
                let _ = reply.send(self.set_worker_count(count));
            }
            Command::StartRun { request, reply } => self.start_run(request, reply),
            Command::Flush {
                start_time_ms,
                reply,
            } => self.flush(start_time_ms, reply),
            Command::Cancel { mode, reply } => {
                let _ = reply.send(self.cancel(mode));
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn allocate_unit_id(&mut self) -> UnitId {
        let id = UnitId::new(self.next_unit);
        self.next_unit += 1;
        id
    }

    fn resize(&mut self, count: usize) {
        while self.slots.len() > count {
            if let Some(mut slot) = self.slots.pop() {
                tracing::debug!(unit = %slot.id, "terminating unit");
                slot.terminate();
            }
        }
        while self.slots.len() < count {
            let id = self.allocate_unit_id();
            self.slots.push(WorkerSlot::uninitialized(id));
        }
    }

    fn set_worker_count(&mut self, requested: usize) -> Result<usize> {
        if let Some(run) = &self.run {
            return Err(PoolError::busy(format!(
                "cannot resize while {} is active",
                run.id
            )));
        }
        let count = self.config.clamp_workers(requested);
        if count != requested {
            tracing::warn!(requested, count, "worker count clamped");
        }
        self.resize(count);
        tracing::info!(workers = count, "worker count set");
        Ok(count)
    }

    /// Make sure slot `index` hosts a live unit, spawning a fresh one if needed
    fn ensure_worker(&mut self, index: usize) -> Result<()> {
        if !self.slots[index].state.needs_respawn() && self.slots[index].handle.is_some() {
            return Ok(());
        }
        let id = if self.slots[index].state == UnitState::Uninitialized {
            self.slots[index].id
        } else {
            self.allocate_unit_id()
        };
        let handle = spawn_worker(
            id,
            self.factory.clone(),
            self.inbox.clone(),
            &self.config.unit_name_prefix,
        );
        let slot = &mut self.slots[index];
        slot.id = id;
        match handle {
            Ok(handle) => {
                slot.handle = Some(handle);
                slot.state = UnitState::Loading;
                Ok(())
            }
            Err(error) => {
                slot.handle = None;
                slot.state = UnitState::Failed(error.reason().to_string());
                Err(error)
            }
        }
    }

    fn ensure_aggregator(&mut self) -> Result<()> {
        let alive = self.aggregator.is_some()
            && !matches!(
                self.aggregator_state,
                UnitState::Failed(_) | UnitState::Terminated
            );
        if alive {
            return Ok(());
        }
        if let Some(mut retired) = self.aggregator.take() {
            retired.terminate();
            self.retired_aggregators += 1;
        }
        match spawn_aggregator(
            self.factory.clone(),
            self.clock.clone(),
            self.inbox.clone(),
            &self.config.unit_name_prefix,
        ) {
            Ok(handle) => {
                self.aggregator = Some(handle);
                self.aggregator_state = UnitState::Loading;
                Ok(())
            }
            Err(error) => {
                self.aggregator = None;
                self.aggregator_state = UnitState::Failed(error.reason().to_string());
                Err(error)
            }
        }
    }

    fn start_run(&mut self, request: RunRequest, reply: oneshot::Sender<Result<RunHandle>>) {
        if let Some(run) = &self.run {
            let _ = reply.send(Err(PoolError::busy(format!("{} is still active", run.id))));
            return;
        }
        if self.slots.is_empty() {
            let _ = reply.send(Err(PoolError::no_usable_units("the pool has no worker units")));
            return;
        }

        let (config, base_seed, jobs) = request.into_jobs();
        let run_id = RunId::new_random();
        let mut excluded = Vec::new();

        for index in 0..self.slots.len() {
            if let Err(error) = self.ensure_worker(index) {
                excluded.push((self.slots[index].id, error));
            }
        }

        let mut awaiting_units = 0;
        for slot in self.slots.iter_mut() {
            let Some(handle) = slot.handle.as_ref() else {
                continue;
            };
            let request_id = self.requests.register(Pending::WorkerInit {
                run: run_id,
                unit: slot.id,
            });
            let request = UnitRequest::Initialize {
                config: config.clone(),
            };
            match handle.send(request_id, request) {
                Ok(()) => {
                    slot.state = UnitState::Loading;
                    awaiting_units += 1;
                }
                Err(error) => {
                    self.requests.resolve(request_id);
                    slot.handle = None;
                    slot.state = UnitState::Failed(error.reason().to_string());
                    excluded.push((slot.id, error));
                }
            }
        }

        let aggregator = match self.ensure_aggregator() {
            Ok(()) => {
                let request_id = self
                    .requests
                    .register(Pending::AggregatorInit { run: run_id });
                let sent = self.aggregator.as_ref().map(|handle| {
                    handle.send(
                        request_id,
                        UnitRequest::Initialize {
                            config: config.clone(),
                        },
                    )
                });
                match sent {
                    Some(Ok(())) => None,
                    Some(Err(error)) => {
                        self.requests.resolve(request_id);
                        Some(Err(error))
                    }
                    None => {
                        self.requests.resolve(request_id);
                        Some(Err(PoolError::invalid_state("aggregator missing")))
                    }
                }
            }
            Err(error) => Some(Err(error)),
        };

        let queue = (0..jobs.len()).collect();
        let states = vec![JobState::Pending; jobs.len()];
        let (status, _) = watch::channel(RunStatus::Initializing);
        tracing::info!(
            run = %run_id,
            target = jobs.len(),
            units = self.slots.len(),
            base_seed = ?base_seed,
            "starting run"
        );

        for (unit, error) in &excluded {
            tracing::warn!(run = %run_id, %unit, %error, "unit excluded from run");
            emit(
                &self.events,
                PoolEvent::UnitExcluded {
                    run: run_id,
                    unit: *unit,
                    error: error.clone(),
                },
            );
        }

        self.run = Some(ActiveRun {
            id: run_id,
            base_seed,
            started_at_ms: self.clock.now_ms(),
            phase: Phase::Initializing {
                awaiting_units,
                aggregator,
                reply: Some(reply),
            },
            jobs,
            states,
            queue,
            assigned: HashMap::new(),
            in_flight_adds: 0,
            active_units: BTreeSet::new(),
            excluded,
            completed: 0,
            failed: Vec::new(),
            cancelled: 0,
            discarded: 0,
            cancel: None,
            status,
        });
        self.maybe_finish_initialization();
    }

    fn maybe_finish_initialization(&mut self) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        let Phase::Initializing {
            awaiting_units,
            aggregator,
            reply,
        } = &mut run.phase
        else {
            return;
        };
        if *awaiting_units > 0 {
            return;
        }
        let Some(aggregator) = aggregator.clone() else {
            return;
        };
        let reply = reply.take();

        let fatal = match aggregator {
            Err(error) => Some(PoolError::load_failure(format!(
                "aggregator failed to initialize: {}",
                error.reason()
            ))),
            Ok(()) if run.active_units.is_empty() => {
                let reasons: Vec<String> = run
                    .excluded
                    .iter()
                    .map(|(unit, error)| format!("{unit}: {}", error.reason()))
                    .collect();
                Some(PoolError::no_usable_units(format!(
                    "no worker unit initialized ({})",
                    reasons.join("; ")
                )))
            }
            Ok(()) => None,
        };

        if let Some(error) = fatal {
            self.fail_run(error, reply);
            return;
        }

        run.phase = Phase::Dispatching;
        tracing::info!(
            run = %run.id,
            active_units = run.active_units.len(),
            excluded = run.excluded.len(),
            "run initialized"
        );
        emit(
            &self.events,
            PoolEvent::RunStarted {
                run: run.id,
                active_units: run.active_units.len(),
                total: run.target(),
            },
        );
        run.publish_progress(&self.events);
        if let Some(reply) = reply {
            let _ = reply.send(Ok(run.handle()));
        }

        self.dispatch();
        self.check_completion();
    }

    fn fail_run(&mut self, error: PoolError, reply: Option<oneshot::Sender<Result<RunHandle>>>) {
        let Some(run) = self.run.take() else {
            return;
        };
        tracing::warn!(run = %run.id, %error, "run failed");
        run.status.send_replace(RunStatus::Failed(error.clone()));
        emit(
            &self.events,
            PoolEvent::RunFailed {
                run: run.id,
                error: error.clone(),
            },
        );
        if let Some(reply) = reply {
            let _ = reply.send(Err(error));
        }
    }

    /// Greedily hand the next pending job to every ready unit
    fn dispatch(&mut self) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        if !matches!(run.phase, Phase::Dispatching) || run.cancel.is_some() {
            return;
        }

        for slot in self.slots.iter_mut() {
            if run.queue.is_empty() {
                break;
            }
            if slot.state != UnitState::Ready || !run.active_units.contains(&slot.id) {
                continue;
            }
            let Some(handle) = slot.handle.as_ref() else {
                continue;
            };
            let Some(index) = run.queue.pop_front() else {
                break;
            };
            let job = run.jobs[index].clone();
            let request_id = self.requests.register(Pending::Job {
                run: run.id,
                unit: slot.id,
                job: job.id,
            });
            tracing::debug!(run = %run.id, unit = %slot.id, job = %job.id, seed = %job.seed, "dispatching job");
            match handle.send(request_id, UnitRequest::Run { job }) {
                Ok(()) => {
                    run.transition(index, JobState::Assigned(slot.id));
                    run.assigned.insert(slot.id, index);
                    slot.state = UnitState::Busy;
                }
                Err(error) => {
                    // The job never started; put it back for another unit
                    self.requests.resolve(request_id);
                    run.queue.push_front(index);
                    slot.handle = None;
                    slot.state = UnitState::Failed(error.reason().to_string());
                    run.active_units.remove(&slot.id);
                    tracing::warn!(run = %run.id, unit = %slot.id, %error, "unit lost during dispatch");
                    run.excluded.push((slot.id, error.clone()));
                    emit(
                        &self.events,
                        PoolEvent::UnitExcluded {
                            run: run.id,
                            unit: slot.id,
                            error,
                        },
                    );
                }
            }
        }
    }

    /// Finalize the run once every job has settled
    fn check_completion(&mut self) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        if !matches!(run.phase, Phase::Dispatching) {
            return;
        }

        if run.active_units.is_empty() && run.assigned.is_empty() && !run.queue.is_empty() {
            while let Some(index) = run.queue.pop_front() {
                if let Some(failure) = run.record_failure(
                    index,
                    None,
                    PoolError::no_usable_units("no worker unit remains in the run"),
                ) {
                    emit(
                        &self.events,
                        PoolEvent::JobFailed {
                            run: run.id,
                            failure,
                        },
                    );
                }
            }
        }

        if !run.queue.is_empty() || !run.assigned.is_empty() || run.in_flight_adds > 0 {
            return;
        }

        run.phase = Phase::Finalizing;
        run.publish_progress(&self.events);
        let run_id = run.id;
        let start_time_ms = run.started_at_ms;
        tracing::debug!(run = %run_id, "all jobs settled; final flush");

        let request_id = self.requests.register(Pending::FinalFlush { run: run_id });
        let sent = match self.aggregator.as_ref() {
            Some(handle) => handle.send(request_id, UnitRequest::Flush { start_time_ms }),
            None => Err(PoolError::invalid_state("aggregator missing")),
        };
        if let Err(error) = sent {
            self.requests.resolve(request_id);
            self.finish_run(run_id, Err(error));
        }
    }

    fn finish_run(&mut self, run_id: RunId, snapshot: Result<Snapshot>) {
        if self.run.as_ref().map(|run| run.id) != Some(run_id) {
            return;
        }
        let Some(run) = self.run.take() else {
            return;
        };
        let snapshot = match snapshot {
            Ok(snapshot) => Some(snapshot),
            Err(error) => {
                tracing::warn!(run = %run.id, %error, "final flush failed");
                None
            }
        };
        let summary = run.summary(snapshot);
        debug_assert!(summary.is_fully_accounted());
        tracing::info!(
            run = %run.id,
            completed = summary.completed,
            failed = summary.failed_count(),
            cancelled = summary.cancelled,
            discarded = summary.discarded,
            "run completed"
        );
        run.status.send_replace(RunStatus::Completed(summary.clone()));
        emit(&self.events, PoolEvent::RunCompleted { summary });
    }

    fn flush(&mut self, start_time_ms: i64, reply: oneshot::Sender<Result<Snapshot>>) {
        let Some(handle) = self.aggregator.as_ref() else {
            let _ = reply.send(Err(PoolError::invalid_state(
                "the aggregator has not been initialized",
            )));
            return;
        };
        let request_id = self.requests.register(Pending::Flush { reply });
        if let Err(error) = handle.send(request_id, UnitRequest::Flush { start_time_ms }) {
            if let Some(Pending::Flush { reply }) = self.requests.resolve(request_id) {
                let _ = reply.send(Err(error));
            }
        }
    }

    fn cancel(&mut self, mode: CancelMode) -> Result<()> {
        let Some(run) = self.run.as_mut() else {
            return Err(PoolError::invalid_state("no run is active"));
        };
        if matches!(run.phase, Phase::Finalizing) {
            return Ok(());
        }
        // Discard is sticky once requested
        run.cancel = match (run.cancel, mode) {
            (Some(CancelMode::Discard), _) | (_, CancelMode::Discard) => Some(CancelMode::Discard),
            _ => Some(CancelMode::Drain),
        };
        while let Some(index) = run.queue.pop_front() {
            if run.transition(index, JobState::Cancelled) {
                run.cancelled += 1;
            }
        }
        tracing::info!(run = %run.id, ?mode, in_flight = run.assigned.len(), "run cancelled");
        if !matches!(run.phase, Phase::Initializing { .. }) {
            run.publish_progress(&self.events);
        }
        self.check_completion();
        Ok(())
    }

    fn status(&self) -> PoolStatus {
        PoolStatus {
            worker_count: self.slots.len(),
            units: self
                .slots
                .iter()
                .map(|slot| (slot.id, slot.state.clone()))
                .collect(),
            aggregator: self.aggregator_state.clone(),
            active_run: self.run.as_ref().map(|run| run.id),
        }
    }

    fn shutdown(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.terminate();
        }
        if let Some(mut handle) = self.aggregator.take() {
            handle.terminate();
        }
        self.aggregator_state = UnitState::Terminated;
        if self.run.is_some() {
            self.fail_run(PoolError::cancelled("the pool shut down"), None);
        }
        for pending in self.requests.drain_where(|_| true) {
            if let Pending::Flush { reply } = pending {
                let _ = reply.send(Err(PoolError::channel_closed("the pool shut down")));
            }
        }
    }

    fn slot_mut(&mut self, unit: UnitId) -> Option<&mut WorkerSlot> {
        self.slots.iter_mut().find(|slot| slot.id == unit)
    }

    fn handle_event(&mut self, event: UnitEvent) {
        match event {
            UnitEvent::Ready { unit } => {
                tracing::debug!(%unit, "unit ready");
                if unit.is_aggregator() {
                    if self.aggregator_state == UnitState::Loading {
                        self.aggregator_state = UnitState::Ready;
                    }
                } else if self.slot_mut(unit).is_none() {
                    return;
                }
                emit(&self.events, PoolEvent::UnitReady { unit });
            }
            UnitEvent::LoadFailed { unit, error } => {
                tracing::warn!(%unit, %error, "unit failed to load");
                let reason = error.reason().to_string();
                if unit.is_aggregator() {
                    self.aggregator_state = UnitState::Failed(reason);
                } else if let Some(slot) = self.slot_mut(unit) {
                    slot.state = UnitState::Failed(reason);
                }
            }
            UnitEvent::Exited { unit } => self.on_unit_exited(unit),
            UnitEvent::Response {
                unit,
                request,
                response,
            } => {
                let Some(pending) = self.requests.resolve(request) else {
                    tracing::warn!(%unit, %request, "response to unknown request");
                    return;
                };
                self.on_response(pending, response);
            }
        }
    }

    fn on_response(&mut self, pending: Pending, response: UnitResponse) {
        match pending {
            Pending::WorkerInit { run, unit } => self.on_worker_initialized(run, unit, response),
            Pending::AggregatorInit { run } => self.on_aggregator_initialized(run, response),
            Pending::Job { run, unit, job } => self.on_job_finished(run, unit, job, response),
            Pending::Add { run, job } => self.on_added(run, job, response),
            Pending::Flush { reply } => {
                let _ = reply.send(expect_snapshot(response));
            }
            Pending::FinalFlush { run } => self.finish_run(run, expect_snapshot(response)),
        }
    }

    fn on_worker_initialized(&mut self, run_id: RunId, unit: UnitId, response: UnitResponse) {
        let outcome = match response {
            UnitResponse::Initialized { .. } => Ok(()),
            UnitResponse::Failed { error } => Err(error),
            other => Err(PoolError::invalid_state(format!(
                "unexpected response to initialize: {other:?}"
            ))),
        };

        if let Some(slot) = self.slots.iter_mut().find(|slot| slot.id == unit) {
            match &outcome {
                Ok(()) => slot.state = UnitState::Ready,
                Err(error) => {
                    slot.terminate();
                    slot.state = UnitState::Failed(error.reason().to_string());
                }
            }
        }

        let Some(run) = self.run.as_mut().filter(|run| run.id == run_id) else {
            return;
        };
        match outcome {
            Ok(()) => {
                tracing::debug!(run = %run.id, %unit, "unit initialized");
                run.active_units.insert(unit);
            }
            Err(error) => {
                tracing::warn!(run = %run.id, %unit, %error, "unit excluded from run");
                run.excluded.push((unit, error.clone()));
                emit(
                    &self.events,
                    PoolEvent::UnitExcluded {
                        run: run.id,
                        unit,
                        error,
                    },
                );
            }
        }
        if let Phase::Initializing { awaiting_units, .. } = &mut run.phase {
            *awaiting_units = awaiting_units.saturating_sub(1);
        }
        self.maybe_finish_initialization();
    }

    fn on_aggregator_initialized(&mut self, run_id: RunId, response: UnitResponse) {
        let outcome = match response {
            UnitResponse::Initialized { .. } => {
                self.aggregator_state = UnitState::Ready;
                Ok(())
            }
            UnitResponse::Failed { error } => {
                // A rejected configuration leaves the aggregator loaded but empty
                if !matches!(self.aggregator_state, UnitState::Failed(_)) {
                    self.aggregator_state = UnitState::Uninitialized;
                }
                Err(error)
            }
            other => Err(PoolError::invalid_state(format!(
                "unexpected response to initialize: {other:?}"
            ))),
        };
        let Some(run) = self.run.as_mut().filter(|run| run.id == run_id) else {
            return;
        };
        if let Phase::Initializing { aggregator, .. } = &mut run.phase {
            *aggregator = Some(outcome);
        }
        self.maybe_finish_initialization();
    }

    fn on_job_finished(&mut self, run_id: RunId, unit: UnitId, job: JobId, response: UnitResponse) {
        let Some(run) = self.run.as_mut().filter(|run| run.id == run_id) else {
            tracing::warn!(run = %run_id, %unit, %job, "result for a run that is no longer active");
            return;
        };
        let index = job.index() as usize;
        run.assigned.remove(&unit);

        let mut exclude_unit = None;
        match response {
            UnitResponse::Done { blob, .. } => {
                if run.cancel == Some(CancelMode::Discard) {
                    if run.transition(index, JobState::Discarded) {
                        run.discarded += 1;
                    }
                } else if run.transition(index, JobState::Aggregating) {
                    let request_id = self.requests.register(Pending::Add { run: run.id, job });
                    let sent = match self.aggregator.as_ref() {
                        Some(handle) => handle.send(request_id, UnitRequest::Add { job, blob }),
                        None => Err(PoolError::invalid_state("aggregator missing")),
                    };
                    match sent {
                        Ok(()) => run.in_flight_adds += 1,
                        Err(error) => {
                            self.requests.resolve(request_id);
                            if let Some(failure) = run.record_failure(index, Some(unit), error) {
                                emit(&self.events, PoolEvent::JobFailed { run: run.id, failure });
                            }
                        }
                    }
                }
            }
            UnitResponse::Failed { error } => {
                if error.is_unit_fatal() || matches!(error, PoolError::InvalidState { .. }) {
                    exclude_unit = Some(error.clone());
                }
                if let Some(failure) = run.record_failure(index, Some(unit), error) {
                    emit(&self.events, PoolEvent::JobFailed { run: run.id, failure });
                }
            }
            other => {
                let error = PoolError::invalid_state(format!("unexpected response to run: {other:?}"));
                if let Some(failure) = run.record_failure(index, Some(unit), error) {
                    emit(&self.events, PoolEvent::JobFailed { run: run.id, failure });
                }
            }
        }

        let excluded_reason = exclude_unit.clone();
        if let Some(error) = exclude_unit {
            run.active_units.remove(&unit);
            run.excluded.push((unit, error.clone()));
            emit(
                &self.events,
                PoolEvent::UnitExcluded {
                    run: run.id,
                    unit,
                    error,
                },
            );
        }
        run.publish_progress(&self.events);

        if let Some(slot) = self.slots.iter_mut().find(|slot| slot.id == unit) {
            if let Some(error) = &excluded_reason {
                // A unit that lost its module state is replaced at the next run
                slot.terminate();
                slot.state = UnitState::Failed(error.reason().to_string());
            } else if slot.state == UnitState::Busy {
                slot.state = UnitState::Ready;
            }
        }
        self.dispatch();
        self.check_completion();
    }

    fn on_added(&mut self, run_id: RunId, job: JobId, response: UnitResponse) {
        let Some(run) = self.run.as_mut().filter(|run| run.id == run_id) else {
            return;
        };
        let index = job.index() as usize;
        run.in_flight_adds = run.in_flight_adds.saturating_sub(1);
        match response {
            UnitResponse::Added => {
                if run.transition(index, JobState::Completed) {
                    run.completed += 1;
                }
            }
            UnitResponse::Failed { error } => {
                if let Some(failure) = run.record_failure(index, None, error) {
                    emit(&self.events, PoolEvent::JobFailed { run: run.id, failure });
                }
            }
            other => {
                let error = PoolError::invalid_state(format!("unexpected response to add: {other:?}"));
                if let Some(failure) = run.record_failure(index, None, error) {
                    emit(&self.events, PoolEvent::JobFailed { run: run.id, failure });
                }
            }
        }
        run.publish_progress(&self.events);
        self.check_completion();
    }

    /// A unit thread stopped. Requests it still owed can never be answered.
    fn on_unit_exited(&mut self, unit: UnitId) {
        tracing::debug!(%unit, "unit exited");
        if unit.is_aggregator() && self.retired_aggregators > 0 {
            self.retired_aggregators -= 1;
            return;
        }
        let orphaned = self.requests.drain_where(|pending| match pending {
            Pending::WorkerInit { unit: u, .. } | Pending::Job { unit: u, .. } => *u == unit,
            Pending::AggregatorInit { .. }
            | Pending::Add { .. }
            | Pending::Flush { .. }
            | Pending::FinalFlush { .. } => unit.is_aggregator(),
        });
        if unit.is_aggregator() {
            self.aggregator_state = UnitState::Terminated;
            self.aggregator = None;
        } else if let Some(slot) = self.slot_mut(unit) {
            slot.handle = None;
            if !matches!(slot.state, UnitState::Failed(_)) {
                slot.state = UnitState::Terminated;
            }
        }
        let error = PoolError::channel_closed(format!("{unit} exited"));
        for pending in orphaned {
            let response = UnitResponse::failed(error.clone());
            self.on_response(pending, response);
        }
        if !unit.is_aggregator() {
            if let Some(run) = self.run.as_mut() {
                run.active_units.remove(&unit);
            }
            self.check_completion();
        }
    }
}

fn expect_snapshot(response: UnitResponse) -> Result<Snapshot> {
    match response {
        UnitResponse::Result { snapshot } => Ok(snapshot),
        UnitResponse::Failed { error } => Err(error),
        other => Err(PoolError::invalid_state(format!(
            "unexpected response to flush: {other:?}"
        ))),
    }
}

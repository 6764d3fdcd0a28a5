//! Execution units
//!
//! Each unit is a dedicated OS thread hosting one module instance. The only
//! way in is the unit's request channel and the only way out is the pool's
//! inbox; units share no state with each other or with the pool.
//!
//! A unit loads its module first and announces [`UnitEvent::Ready`]. Requests
//! that arrive earlier wait in the channel. If loading fails, the unit
//! announces [`UnitEvent::LoadFailed`] and answers every request with that
//! load failure until it is terminated, so nothing is dropped silently.
//!
//! Module calls run under `catch_unwind`: a panicking module becomes a typed
//! failure response instead of taking the thread down.

use simpool_core::{
    AggregationModule, Clock, Envelope, JobId, ModuleError, ModuleFactory, PoolError, RequestId, Result,
    ResultBlob, SimulationModule, UnitEvent, UnitId, UnitRequest, UnitResponse,
};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;

/// Sender side of the pool's inbox
pub(crate) type Inbox = mpsc::UnboundedSender<UnitEvent>;

/// Owning handle to a running unit. Dropping it terminates the unit.
#[derive(Debug)]
pub(crate) struct UnitHandle {
    id: UnitId,
    requests: mpsc::UnboundedSender<Envelope>,
    thread: Option<thread::JoinHandle<()>>,
}

impl UnitHandle {
    /// Queue a request. Fails only if the unit's thread is gone.
    pub fn send(&self, request_id: RequestId, request: UnitRequest) -> Result<()> {
        self.requests
            .send(Envelope::new(request_id, request))
            .map_err(|_| PoolError::channel_closed(format!("{} is no longer running", self.id)))
    }

    /// Ask the unit to stop after its current request
    pub fn terminate(&mut self) {
        let _ = self
            .requests
            .send(Envelope::new(RequestId::new(0), UnitRequest::Terminate));
        // Detach: a unit busy with a long iteration exits once it finishes
        self.thread.take();
    }
}

impl Drop for UnitHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Spawn a worker unit hosting a simulation module
pub(crate) fn spawn_worker(
    id: UnitId,
    factory: Arc<dyn ModuleFactory>,
    inbox: Inbox,
    name_prefix: &str,
) -> Result<UnitHandle> {
    spawn_unit(id, format!("{name_prefix}-{}", id.raw()), inbox, move || {
        guarded("module load", || factory.load_simulation(id))
            .map(|module| WorkerHost::new(id, module))
            .map_err(PoolError::load_failure)
    })
}

/// Spawn the aggregator unit
pub(crate) fn spawn_aggregator(
    factory: Arc<dyn ModuleFactory>,
    clock: Arc<dyn Clock>,
    inbox: Inbox,
    name_prefix: &str,
) -> Result<UnitHandle> {
    spawn_unit(
        UnitId::AGGREGATOR,
        format!("{name_prefix}-aggregator"),
        inbox,
        move || {
            guarded("aggregator load", || factory.load_aggregator(clock))
                .map(AggregatorHost::new)
                .map_err(PoolError::load_failure)
        },
    )
}

fn spawn_unit<H, L>(id: UnitId, name: String, inbox: Inbox, load: L) -> Result<UnitHandle>
where
    H: UnitHost,
    L: FnOnce() -> Result<H> + Send + 'static,
{
    let (requests, receiver) = mpsc::unbounded_channel();
    let thread = thread::Builder::new()
        .name(name)
        .spawn(move || unit_main(id, load, receiver, inbox))
        .map_err(|e| PoolError::load_failure(format!("failed to spawn thread for {id}: {e}")))?;
    Ok(UnitHandle {
        id,
        requests,
        thread: Some(thread),
    })
}

fn unit_main<H, L>(
    unit: UnitId,
    load: L,
    mut requests: mpsc::UnboundedReceiver<Envelope>,
    inbox: Inbox,
) where
    H: UnitHost,
    L: FnOnce() -> Result<H>,
{
    let mut host = match load() {
        Ok(host) => {
            tracing::debug!(%unit, "module loaded");
            let _ = inbox.send(UnitEvent::Ready { unit });
            host
        }
        Err(error) => {
            tracing::warn!(%unit, %error, "module failed to load");
            let _ = inbox.send(UnitEvent::LoadFailed {
                unit,
                error: error.clone(),
            });
            while let Some(envelope) = requests.blocking_recv() {
                if matches!(envelope.request, UnitRequest::Terminate) {
                    break;
                }
                let response = UnitResponse::failed(error.clone());
                if respond(&inbox, unit, envelope.id, response).is_err() {
                    break;
                }
            }
            let _ = inbox.send(UnitEvent::Exited { unit });
            return;
        }
    };

    while let Some(envelope) = requests.blocking_recv() {
        if matches!(envelope.request, UnitRequest::Terminate) {
            break;
        }
        tracing::trace!(%unit, request = envelope.request.name(), id = %envelope.id, "handling request");
        let response = host.handle(envelope.request);
        if respond(&inbox, unit, envelope.id, response).is_err() {
            // Pool is gone
            break;
        }
    }
    tracing::debug!(%unit, "unit stopped");
    let _ = inbox.send(UnitEvent::Exited { unit });
}

fn respond(
    inbox: &Inbox,
    unit: UnitId,
    request: RequestId,
    response: UnitResponse,
) -> std::result::Result<(), ()> {
    inbox
        .send(UnitEvent::Response {
            unit,
            request,
            response,
        })
        .map_err(|_| ())
}

/// Run a module call, turning panics into failure messages
fn guarded<T>(
    what: &str,
    call: impl FnOnce() -> std::result::Result<T, ModuleError>,
) -> std::result::Result<T, String> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result.map_err(|e| e.message),
        Err(payload) => Err(format!("{what} panicked: {}", panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Request handling inside a unit thread
trait UnitHost {
    fn handle(&mut self, request: UnitRequest) -> UnitResponse;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum WorkerPhase {
    Loaded,
    Initialized,
    Failed(String),
}

struct WorkerHost {
    unit: UnitId,
    module: Box<dyn SimulationModule>,
    phase: WorkerPhase,
}

impl WorkerHost {
    fn new(unit: UnitId, module: Box<dyn SimulationModule>) -> Self {
        Self {
            unit,
            module,
            phase: WorkerPhase::Loaded,
        }
    }
}

impl UnitHost for WorkerHost {
    fn handle(&mut self, request: UnitRequest) -> UnitResponse {
        if let WorkerPhase::Failed(reason) = &self.phase {
            return UnitResponse::failed(PoolError::invalid_state(format!(
                "{} failed to initialize: {reason}",
                self.unit
            )));
        }

        match request {
            UnitRequest::Initialize { config } => {
                match guarded("initialize", || self.module.initialize(&config)) {
                    Ok(info) => {
                        self.phase = WorkerPhase::Initialized;
                        UnitResponse::Initialized { info }
                    }
                    Err(reason) => {
                        self.phase = WorkerPhase::Failed(reason.clone());
                        UnitResponse::failed(PoolError::load_failure(reason))
                    }
                }
            }
            UnitRequest::Run { job } => {
                if self.phase != WorkerPhase::Initialized {
                    return UnitResponse::failed(PoolError::invalid_state(format!(
                        "{} received {} before initialize",
                        self.unit, job.id
                    )));
                }
                // A failed iteration leaves the unit ready for the next job
                match guarded("run", || self.module.run(&job)) {
                    Ok(bytes) => UnitResponse::Done {
                        job: job.id,
                        blob: ResultBlob::new(bytes),
                    },
                    Err(reason) => UnitResponse::failed(PoolError::run_failure(format!(
                        "{} (seed {}): {reason}",
                        job.id, job.seed
                    ))),
                }
            }
            other => UnitResponse::failed(PoolError::invalid_state(format!(
                "worker units do not handle {}",
                other.name()
            ))),
        }
    }
}

struct AggregatorHost {
    module: Box<dyn AggregationModule>,
    initialized: bool,
}

impl AggregatorHost {
    fn new(module: Box<dyn AggregationModule>) -> Self {
        Self {
            module,
            initialized: false,
        }
    }

    fn add(&mut self, job: JobId, blob: &ResultBlob) -> UnitResponse {
        match guarded("aggregate", || self.module.aggregate(blob)) {
            Ok(()) => UnitResponse::Added,
            Err(reason) => UnitResponse::failed(PoolError::malformed(format!("{job}: {reason}"))),
        }
    }
}

impl UnitHost for AggregatorHost {
    fn handle(&mut self, request: UnitRequest) -> UnitResponse {
        let name = request.name();
        match request {
            UnitRequest::Initialize { config } => {
                match guarded("initialize", || self.module.initialize_aggregator(&config)) {
                    Ok(info) => {
                        self.initialized = true;
                        UnitResponse::Initialized { info }
                    }
                    Err(reason) => {
                        self.initialized = false;
                        UnitResponse::failed(PoolError::load_failure(reason))
                    }
                }
            }
            UnitRequest::Add { .. } | UnitRequest::Flush { .. } if !self.initialized => {
                UnitResponse::failed(PoolError::invalid_state(format!(
                    "aggregator received {name} before initialize"
                )))
            }
            UnitRequest::Add { job, blob } => self.add(job, &blob),
            UnitRequest::Flush { start_time_ms } => {
                match guarded("flush", || self.module.flush(start_time_ms)) {
                    Ok(snapshot) => UnitResponse::Result { snapshot },
                    Err(reason) => UnitResponse::failed(PoolError::flush_failure(reason)),
                }
            }
            _ => UnitResponse::failed(PoolError::invalid_state(format!(
                "the aggregator does not handle {name}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simpool_core::{Configuration, InitInfo, Job, Seed, Snapshot, SystemClock};
    use std::time::Duration;

    struct EchoModule;

    impl SimulationModule for EchoModule {
        fn initialize(&mut self, config: &Configuration) -> std::result::Result<InitInfo, ModuleError> {
            if config.as_str() == "reject" {
                return Err(ModuleError::new("rejected"));
            }
            Ok(InitInfo::default())
        }

        fn run(&mut self, job: &Job) -> std::result::Result<Vec<u8>, ModuleError> {
            match job.seed.as_str() {
                "panic" => panic!("boom"),
                "fail" => Err(ModuleError::new("bad seed")),
                seed => Ok(seed.as_bytes().to_vec()),
            }
        }
    }

    struct CountingAggregator(u64);

    impl AggregationModule for CountingAggregator {
        fn initialize_aggregator(
            &mut self,
            _config: &Configuration,
        ) -> std::result::Result<InitInfo, ModuleError> {
            self.0 = 0;
            Ok(InitInfo::default())
        }

        fn aggregate(&mut self, blob: &ResultBlob) -> std::result::Result<(), ModuleError> {
            if blob.is_empty() {
                return Err(ModuleError::new("empty blob"));
            }
            self.0 += 1;
            Ok(())
        }

        fn flush(&self, _start_time_ms: i64) -> std::result::Result<Snapshot, ModuleError> {
            Ok(Snapshot {
                count: self.0,
                ..Snapshot::default()
            })
        }
    }

    struct Factory {
        fail_load: bool,
    }

    impl ModuleFactory for Factory {
        fn load_simulation(
            &self,
            _unit: UnitId,
        ) -> std::result::Result<Box<dyn SimulationModule>, ModuleError> {
            if self.fail_load {
                return Err(ModuleError::new("no module"));
            }
            Ok(Box::new(EchoModule))
        }

        fn load_aggregator(
            &self,
            _clock: Arc<dyn Clock>,
        ) -> std::result::Result<Box<dyn AggregationModule>, ModuleError> {
            Ok(Box::new(CountingAggregator(0)))
        }
    }

    fn job(seed: &str) -> UnitRequest {
        UnitRequest::Run {
            job: Job::new(JobId::new(0), Seed::from(seed)),
        }
    }

    async fn next(inbox: &mut mpsc::UnboundedReceiver<UnitEvent>) -> UnitEvent {
        tokio::time::timeout(Duration::from_secs(5), inbox.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn response(inbox: &mut mpsc::UnboundedReceiver<UnitEvent>) -> (RequestId, UnitResponse) {
        loop {
            if let UnitEvent::Response {
                request, response, ..
            } = next(inbox).await
            {
                return (request, response);
            }
        }
    }

    #[tokio::test]
    async fn test_requests_before_ready_are_queued() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let factory = Arc::new(Factory { fail_load: false });
        let unit = spawn_worker(UnitId::new(0), factory, tx, "test").unwrap();
        unit.send(
            RequestId::new(1),
            UnitRequest::Initialize {
                config: Configuration::from("cfg"),
            },
        )
        .unwrap();
        unit.send(RequestId::new(2), job("7")).unwrap();

        assert_eq!(next(&mut rx).await, UnitEvent::Ready { unit: UnitId::new(0) });
        let (id, init) = response(&mut rx).await;
        assert_eq!(id, RequestId::new(1));
        assert!(matches!(init, UnitResponse::Initialized { .. }));
        let (id, done) = response(&mut rx).await;
        assert_eq!(id, RequestId::new(2));
        assert!(matches!(done, UnitResponse::Done { blob, .. } if blob.as_bytes() == b"7"));
    }

    #[tokio::test]
    async fn test_run_before_initialize_is_invalid_state() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let unit = spawn_worker(UnitId::new(1), Arc::new(Factory { fail_load: false }), tx, "test")
            .unwrap();
        unit.send(RequestId::new(1), job("1")).unwrap();
        let (_, resp) = response(&mut rx).await;
        assert!(matches!(resp, UnitResponse::Failed { error: PoolError::InvalidState { .. } }));
    }

    #[tokio::test]
    async fn test_run_failures_keep_unit_usable() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let unit = spawn_worker(UnitId::new(2), Arc::new(Factory { fail_load: false }), tx, "test")
            .unwrap();
        unit.send(
            RequestId::new(1),
            UnitRequest::Initialize {
                config: Configuration::from("cfg"),
            },
        )
        .unwrap();
        unit.send(RequestId::new(2), job("fail")).unwrap();
        unit.send(RequestId::new(3), job("panic")).unwrap();
        unit.send(RequestId::new(4), job("ok")).unwrap();

        let _ = response(&mut rx).await;
        let (_, failed) = response(&mut rx).await;
        assert!(matches!(failed, UnitResponse::Failed { error: PoolError::RunFailure { .. } }));
        let (_, panicked) = response(&mut rx).await;
        assert!(
            matches!(panicked, UnitResponse::Failed { error: PoolError::RunFailure { reason } } if reason.contains("panicked"))
        );
        let (_, done) = response(&mut rx).await;
        assert!(matches!(done, UnitResponse::Done { .. }));
    }

    #[tokio::test]
    async fn test_initialize_failure_is_terminal() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let unit = spawn_worker(UnitId::new(3), Arc::new(Factory { fail_load: false }), tx, "test")
            .unwrap();
        unit.send(
            RequestId::new(1),
            UnitRequest::Initialize {
                config: Configuration::from("reject"),
            },
        )
        .unwrap();
        unit.send(
            RequestId::new(2),
            UnitRequest::Initialize {
                config: Configuration::from("cfg"),
            },
        )
        .unwrap();
        let (_, first) = response(&mut rx).await;
        assert!(matches!(first, UnitResponse::Failed { error: PoolError::LoadFailure { .. } }));
        let (_, second) = response(&mut rx).await;
        assert!(matches!(second, UnitResponse::Failed { error: PoolError::InvalidState { .. } }));
    }

    #[tokio::test]
    async fn test_load_failure_answers_queued_requests() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let unit = spawn_worker(UnitId::new(4), Arc::new(Factory { fail_load: true }), tx, "test")
            .unwrap();
        unit.send(
            RequestId::new(1),
            UnitRequest::Initialize {
                config: Configuration::from("cfg"),
            },
        )
        .unwrap();

        assert!(matches!(next(&mut rx).await, UnitEvent::LoadFailed { .. }));
        let (id, resp) = response(&mut rx).await;
        assert_eq!(id, RequestId::new(1));
        assert!(matches!(resp, UnitResponse::Failed { error: PoolError::LoadFailure { .. } }));

        drop(unit);
        assert_eq!(next(&mut rx).await, UnitEvent::Exited { unit: UnitId::new(4) });
    }

    #[tokio::test]
    async fn test_aggregator_protocol() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let agg = spawn_aggregator(
            Arc::new(Factory { fail_load: false }),
            Arc::new(SystemClock),
            tx,
            "test",
        ).unwrap();
        agg.send(
            RequestId::new(1),
            UnitRequest::Add {
                job: JobId::new(0),
                blob: ResultBlob::new(vec![1]),
            },
        )
        .unwrap();
        agg.send(
            RequestId::new(2),
            UnitRequest::Initialize {
                config: Configuration::from("cfg"),
            },
        )
        .unwrap();
        agg.send(
            RequestId::new(3),
            UnitRequest::Add {
                job: JobId::new(1),
                blob: ResultBlob::new(vec![]),
            },
        )
        .unwrap();
        agg.send(
            RequestId::new(4),
            UnitRequest::Add {
                job: JobId::new(2),
                blob: ResultBlob::new(vec![9]),
            },
        )
        .unwrap();
        agg.send(RequestId::new(5), UnitRequest::Flush { start_time_ms: 0 })
            .unwrap();

        let (_, early) = response(&mut rx).await;
        assert!(matches!(early, UnitResponse::Failed { error: PoolError::InvalidState { .. } }));
        let (_, init) = response(&mut rx).await;
        assert!(matches!(init, UnitResponse::Initialized { .. }));
        let (_, malformed) = response(&mut rx).await;
        assert!(matches!(malformed, UnitResponse::Failed { error: PoolError::MalformedResult { .. } }));
        let (_, added) = response(&mut rx).await;
        assert_eq!(added, UnitResponse::Added);
        let (_, flushed) = response(&mut rx).await;
        assert!(matches!(flushed, UnitResponse::Result { snapshot } if snapshot.count == 1));
    }
}

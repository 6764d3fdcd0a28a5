//! End-to-end pool behavior with scripted modules

use assert_matches::assert_matches;
use simpool_core::{derive_seed, ErrorKind, JobId, PoolError, UnitId};
use simpool_runtime::{CancelMode, Pool, PoolConfig, PoolEvent, RunRequest, RunSummary, UnitState};
use simpool_stats::TrialResult;
use simpool_testkit::{ManualClock, RunGate, ScriptedFactory};
use std::time::Duration;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

fn pool_with(workers: usize, factory: ScriptedFactory) -> Pool {
    let config = PoolConfig {
        worker_count: workers,
        ..PoolConfig::default()
    };
    Pool::new(config, factory.into_factory()).unwrap()
}

async fn run_to_end(pool: &Pool, request: RunRequest) -> RunSummary {
    let mut handle = timeout(WAIT, pool.start_run(request)).await.unwrap().unwrap();
    let summary = timeout(WAIT, handle.wait()).await.unwrap().unwrap();
    assert!(summary.is_fully_accounted(), "{summary:?}");
    summary
}

#[tokio::test(flavor = "multi_thread")]
async fn test_run_aggregates_every_job() {
    let pool = pool_with(2, ScriptedFactory::new());
    let summary = run_to_end(&pool, RunRequest::new("cfg", 5).with_base_seed(7)).await;

    assert_eq!(summary.completed, 5);
    assert_eq!(summary.base_seed, Some(7));
    let snapshot = summary.snapshot.unwrap();
    assert_eq!(snapshot.count, 5);
    let min = snapshot.primary.min.unwrap();
    let max = snapshot.primary.max.unwrap();
    assert_eq!(min.value, 1.0);
    assert_eq!(min.seed, derive_seed(7, 0));
    assert_eq!(max.value, 5.0);
    assert_eq!(max.seed, derive_seed(7, 4));
    assert_eq!(snapshot.primary.mean, Some(3.0));
    assert_eq!(snapshot.metrics["double"].count, 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_results_independent_of_worker_count() {
    let values = |job: &simpool_core::Job| (job.seed.as_u64().unwrap() % 997) as f64;
    let one = pool_with(1, ScriptedFactory::new().with_values(values));
    let many = pool_with(4, ScriptedFactory::new().with_values(values));

    let a = run_to_end(&one, RunRequest::new("cfg", 40).with_base_seed(99)).await;
    let b = run_to_end(&many, RunRequest::new("cfg", 40).with_base_seed(99)).await;
    assert!(a.snapshot.unwrap().same_statistics(&b.snapshot.unwrap()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_explicit_seeds() {
    let pool = pool_with(2, ScriptedFactory::new());
    let request = RunRequest::with_seeds("cfg", vec!["a".into(), "b".into(), "c".into()]);
    let summary = run_to_end(&pool, request).await;
    assert_eq!(summary.base_seed, None);
    assert_eq!(summary.completed, 3);
    assert_eq!(summary.snapshot.unwrap().primary.max.unwrap().seed.as_str(), "c");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_initialization_excludes_unit() {
    let factory = ScriptedFactory::new().fail_initialize_on(UnitId::new(1));
    let pool = pool_with(3, factory.clone());
    let mut events = pool.subscribe();

    let summary = run_to_end(&pool, RunRequest::new("cfg", 9)).await;
    assert_eq!(summary.completed, 9);
    assert_eq!(summary.excluded_units.len(), 1);
    assert_eq!(summary.excluded_units[0].0, UnitId::new(1));
    assert!(factory
        .executed()
        .iter()
        .all(|(unit, _)| *unit != UnitId::new(1)));

    let mut saw_exclusion = false;
    while let Ok(event) = events.try_recv() {
        if let PoolEvent::UnitExcluded { unit, error, .. } = event {
            assert_eq!(unit, UnitId::new(1));
            assert_eq!(error.kind(), ErrorKind::LoadFailure);
            saw_exclusion = true;
        }
    }
    assert!(saw_exclusion);

    // The failed slot gets a fresh unit for the next run
    let summary = run_to_end(&pool, RunRequest::new("cfg", 3)).await;
    assert!(summary.excluded_units.is_empty());
    let status = pool.status().await.unwrap();
    assert_eq!(status.worker_count, 3);
    assert!(status.units.iter().all(|(_, state)| *state == UnitState::Ready));
    assert!(status.units.iter().all(|(unit, _)| *unit != UnitId::new(1)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_load_failure_excludes_unit() {
    let factory = ScriptedFactory::new().fail_load_on(UnitId::new(0));
    let pool = pool_with(2, factory);
    let summary = run_to_end(&pool, RunRequest::new("cfg", 4)).await;
    assert_eq!(summary.completed, 4);
    assert_eq!(summary.excluded_units[0].0, UnitId::new(0));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_no_usable_units_fails_fast() {
    let factory = ScriptedFactory::new()
        .fail_initialize_on(UnitId::new(0))
        .fail_initialize_on(UnitId::new(1));
    let pool = pool_with(2, factory);
    let err = timeout(WAIT, pool.start_run(RunRequest::new("cfg", 5)))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoUsableUnits);
    assert!(pool.status().await.unwrap().active_run.is_none());

    let rejecting = pool_with(2, ScriptedFactory::new().reject_config("bad"));
    let err = rejecting.start_run(RunRequest::new("bad", 5)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoUsableUnits);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_aggregator_load_failure_fails_run() {
    let pool = pool_with(2, ScriptedFactory::new().fail_aggregator_load());
    let err = pool.start_run(RunRequest::new("cfg", 5)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LoadFailure);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resize_to_zero_and_back() {
    let pool = pool_with(3, ScriptedFactory::new());
    assert_eq!(pool.set_worker_count(0).await.unwrap(), 0);
    let err = pool.start_run(RunRequest::new("cfg", 2)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoUsableUnits);

    assert_eq!(pool.set_worker_count(2).await.unwrap(), 2);
    let summary = run_to_end(&pool, RunRequest::new("cfg", 4)).await;
    assert_eq!(summary.completed, 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resize_is_clamped() {
    let config = PoolConfig {
        worker_count: 1,
        max_workers: 4,
        ..PoolConfig::default()
    };
    let pool = Pool::new(config, ScriptedFactory::new().into_factory()).unwrap();
    assert_eq!(pool.set_worker_count(64).await.unwrap(), 4);
    assert_eq!(pool.status().await.unwrap().worker_count, 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_job_failures_do_not_block_run() {
    let pool = pool_with(2, ScriptedFactory::new().fail_job(2).panic_job(4));
    let summary = run_to_end(&pool, RunRequest::new("cfg", 6)).await;
    assert_eq!(summary.completed, 4);
    let mut failed = summary.failed_jobs();
    failed.sort();
    assert_eq!(failed, vec![JobId::new(2), JobId::new(4)]);
    assert!(summary
        .failed
        .iter()
        .all(|f| f.error.kind() == ErrorKind::RunFailure && f.unit.is_some()));
    assert_eq!(summary.snapshot.unwrap().count, 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_result_counts_as_failed() {
    let pool = pool_with(2, ScriptedFactory::new().malformed_job(1));
    let summary = run_to_end(&pool, RunRequest::new("cfg", 4)).await;
    assert_eq!(summary.completed, 3);
    assert_eq!(summary.failed_jobs(), vec![JobId::new(1)]);
    assert_eq!(summary.failed[0].error.kind(), ErrorKind::MalformedResult);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_flush_semantics() {
    let pool = pool_with(2, ScriptedFactory::new());
    let err = pool.flush(0).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let summary = run_to_end(&pool, RunRequest::new("cfg", 0)).await;
    assert_eq!(summary.snapshot.unwrap().count, 0);
    let empty = pool.flush(0).await.unwrap();
    assert_eq!(empty.count, 0);
    assert!(empty.primary.is_empty());

    run_to_end(&pool, RunRequest::new("cfg", 6)).await;
    let first = pool.flush(0).await.unwrap();
    let second = pool.flush(0).await.unwrap();
    assert_eq!(first.count, 6);
    assert!(first.same_statistics(&second));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_elapsed_time_follows_pool_clock() {
    let clock = ManualClock::at(1_000);
    let config = PoolConfig {
        worker_count: 2,
        ..PoolConfig::default()
    };
    let pool = Pool::with_clock(config, ScriptedFactory::new().into_factory(), clock.clone()).unwrap();

    let mut handle = pool.start_run(RunRequest::new("cfg", 3)).await.unwrap();
    assert_eq!(handle.started_at_ms(), 1_000);
    let summary = timeout(WAIT, handle.wait()).await.unwrap().unwrap();
    assert_eq!(summary.snapshot.unwrap().elapsed_ms, 0);

    assert_eq!(pool.flush(400).await.unwrap().elapsed_ms, 600);
    clock.advance(250);
    assert_eq!(pool.flush(handle.started_at_ms()).await.unwrap().elapsed_ms, 250);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_flush_mid_run_sees_folded_results() {
    let gate = RunGate::new();
    let pool = pool_with(2, ScriptedFactory::new().with_gate_from(gate.clone(), 4));
    let mut handle = pool.start_run(RunRequest::new("cfg", 10)).await.unwrap();

    // Jobs 0..4 finish before either worker picks up a gated job, and their
    // results reach the aggregator ahead of any later flush.
    let waiter = gate.clone();
    assert!(tokio::task::spawn_blocking(move || waiter.wait_for_entered(2, WAIT))
        .await
        .unwrap());
    let mut last = 0;
    for _ in 0..3 {
        let snapshot = pool.flush(handle.started_at_ms()).await.unwrap();
        assert_eq!(snapshot.count, 4);
        assert!(snapshot.count >= last);
        assert_eq!(snapshot.primary.max.unwrap().value, 4.0);
        last = snapshot.count;
    }

    gate.open();
    let summary = timeout(WAIT, handle.wait()).await.unwrap().unwrap();
    assert_eq!(summary.completed, 10);
    let after = pool.flush(handle.started_at_ms()).await.unwrap();
    assert_eq!(after.count, 10);
    assert!(after.count >= last);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_drain_keeps_in_flight_results() {
    let gate = RunGate::new();
    let pool = pool_with(2, ScriptedFactory::new().with_gate(gate.clone()));
    let mut handle = pool.start_run(RunRequest::new("cfg", 10)).await.unwrap();

    let waiter = gate.clone();
    assert!(tokio::task::spawn_blocking(move || waiter.wait_for_entered(2, WAIT))
        .await
        .unwrap());
    let err = pool.set_worker_count(5).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);
    let err = pool.start_run(RunRequest::new("cfg", 1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);

    pool.cancel(CancelMode::Drain).await.unwrap();
    gate.open();
    let summary = timeout(WAIT, handle.wait()).await.unwrap().unwrap();
    assert!(summary.is_fully_accounted());
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.cancelled, 8);
    assert_eq!(summary.snapshot.unwrap().count, 2);
    assert_eq!(gate.entered(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_discard_drops_in_flight_results() {
    let gate = RunGate::new();
    let pool = pool_with(2, ScriptedFactory::new().with_gate(gate.clone()));
    let mut handle = pool.start_run(RunRequest::new("cfg", 10)).await.unwrap();

    let waiter = gate.clone();
    assert!(tokio::task::spawn_blocking(move || waiter.wait_for_entered(2, WAIT))
        .await
        .unwrap());
    pool.cancel(CancelMode::Discard).await.unwrap();
    gate.open();
    let summary = timeout(WAIT, handle.wait()).await.unwrap().unwrap();
    assert!(summary.is_fully_accounted());
    assert_eq!(summary.completed, 0);
    assert_eq!(summary.discarded, 2);
    assert_eq!(summary.cancelled, 8);
    assert_eq!(summary.snapshot.unwrap().count, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_without_run_is_invalid() {
    let pool = pool_with(1, ScriptedFactory::new());
    let err = pool.cancel(CancelMode::Drain).await.unwrap_err();
    assert_matches!(err, PoolError::InvalidState { .. });
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sample_runs_one_iteration() {
    let pool = pool_with(2, ScriptedFactory::new());
    let blob = pool.sample("cfg", "1234").await.unwrap();
    let trial = TrialResult::decode(blob.as_bytes()).unwrap();
    assert_eq!(trial.seed.as_str(), "1234");
    assert_eq!(trial.value, 1.0);

    let rejecting = pool_with(1, ScriptedFactory::new().reject_config("bad"));
    let err = rejecting.sample("bad", "1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LoadFailure);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_closes_pool() {
    let pool = pool_with(2, ScriptedFactory::new());
    run_to_end(&pool, RunRequest::new("cfg", 2)).await;
    pool.shutdown().await.unwrap();
    let err = pool.status().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChannelClosed);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_fails_active_run() {
    let gate = RunGate::new();
    let pool = pool_with(1, ScriptedFactory::new().with_gate(gate.clone()));
    let mut handle = pool.start_run(RunRequest::new("cfg", 4)).await.unwrap();

    let waiter = gate.clone();
    assert!(tokio::task::spawn_blocking(move || waiter.wait_for_entered(1, WAIT))
        .await
        .unwrap());
    timeout(WAIT, pool.shutdown()).await.unwrap().unwrap();
    gate.open();

    let err = timeout(WAIT, handle.wait()).await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    let err = pool.start_run(RunRequest::new("cfg", 1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChannelClosed);
}

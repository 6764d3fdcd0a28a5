//! Command-line driver for simpool
//!
//! Runs batches of the dice demo simulation on an execution pool and prints
//! statistics snapshots as JSON.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use simpool_core::Seed;
use simpool_runtime::{Pool, PoolConfig, PoolEvent, RunHandle, RunRequest, RunSummary};
use simpool_stats::TrialResult;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

mod demo;

#[derive(Parser)]
#[command(name = "simpool")]
#[command(about = "Run seeded simulation batches on a parallel execution pool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Pool config file path (TOML); `SIMPOOL_*` variables override it
    #[arg(short = 'p', long, global = true)]
    pool_config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a batch of iterations and report aggregated statistics
    Run {
        /// Simulation configuration file (JSON)
        config: PathBuf,

        /// Number of iterations
        #[arg(short = 'n', long, default_value = "1000")]
        iterations: u64,

        /// Worker units; defaults to the pool config
        #[arg(short, long)]
        workers: Option<usize>,

        /// Base seed for deriving per-iteration seeds
        #[arg(short, long)]
        seed: Option<u64>,

        /// Print an intermediate snapshot at this interval
        #[arg(long, default_value = "1000")]
        flush_interval_ms: u64,
    },

    /// Run a single iteration with an explicit seed
    Sample {
        /// Simulation configuration file (JSON)
        config: PathBuf,

        /// Seed for the iteration
        #[arg(short, long)]
        seed: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_writer(std::io::stderr)
        .init();

    let pool_config = load_pool_config(cli.pool_config.as_deref())?;

    match cli.command {
        Commands::Run {
            config,
            iterations,
            workers,
            seed,
            flush_interval_ms,
        } => {
            let mut pool_config = pool_config;
            if let Some(workers) = workers {
                pool_config.worker_count = workers;
            }
            let sim_config = read_sim_config(&config)?;
            let mut request = RunRequest::new(sim_config, iterations);
            if let Some(seed) = seed {
                request = request.with_base_seed(seed);
            }
            let pool = Pool::new(pool_config, Arc::new(demo::DemoFactory))?;
            let summary = run_batch(&pool, request, Duration::from_millis(flush_interval_ms)).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            pool.shutdown().await?;
        }

        Commands::Sample { config, seed } => {
            let sim_config = read_sim_config(&config)?;
            let pool = Pool::new(pool_config, Arc::new(demo::DemoFactory))?;
            let blob = pool.sample(sim_config, Seed::new(seed)).await?;
            let trial = TrialResult::decode(blob.as_bytes())?;
            println!("{}", serde_json::to_string_pretty(&trial)?);
            pool.shutdown().await?;
        }
    }

    Ok(())
}

fn load_pool_config(path: Option<&Path>) -> Result<PoolConfig> {
    let mut config = match path {
        Some(path) => PoolConfig::load(path)
            .with_context(|| format!("loading pool config from {}", path.display()))?,
        None => PoolConfig::default(),
    };
    config.merge_with_env()?;
    Ok(config)
}

fn read_sim_config(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("reading simulation config from {}", path.display()))
}

/// Drive a run to completion, printing a snapshot every `interval`
async fn run_batch(pool: &Pool, request: RunRequest, interval: Duration) -> Result<RunSummary> {
    tokio::spawn(log_events(pool.subscribe()));

    let mut handle: RunHandle = pool.start_run(request).await?;
    tracing::info!(
        run = %handle.id(),
        target = handle.target(),
        base_seed = ?handle.base_seed(),
        "run started"
    );

    let started_at_ms = handle.started_at_ms();
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            summary = handle.wait() => return Ok(summary?),
            _ = ticker.tick() => {
                let snapshot = pool.flush(started_at_ms).await?;
                println!("{}", serde_json::to_string(&snapshot)?);
            }
        }
    }
}

/// Log pool events until the pool closes the channel. Returns how many were
/// logged; events dropped while lagging are skipped with a warning.
async fn log_events(mut events: broadcast::Receiver<PoolEvent>) -> usize {
    let mut logged = 0;
    loop {
        match events.recv().await {
            Ok(event) => {
                log_event(&event);
                logged += 1;
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event log lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
    logged
}

fn log_event(event: &PoolEvent) {
    match event {
        PoolEvent::UnitExcluded { unit, error, .. } => {
            tracing::warn!(%unit, %error, "unit excluded");
        }
        PoolEvent::JobFailed { failure, .. } => {
            tracing::warn!(job = %failure.job, seed = %failure.seed, error = %failure.error, "iteration failed");
        }
        PoolEvent::Progress { progress, .. } => {
            tracing::debug!(settled = progress.settled(), total = progress.total, "progress");
        }
        PoolEvent::RunFailed { error, .. } => tracing::error!(%error, "run failed"),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simpool_core::UnitId;

    #[test]
    fn test_pool_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.toml");
        std::fs::write(&path, "worker_count = 5\n").unwrap();
        let config = load_pool_config(Some(&path)).unwrap();
        assert_eq!(config.worker_count, 5);
    }

    #[test]
    fn test_missing_sim_config_names_path() {
        let err = read_sim_config(Path::new("/nonexistent/sim.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/sim.json"));
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from(["simpool", "run", "sim.json", "-n", "50", "-w", "4", "--seed", "9"])
            .unwrap();
        match cli.command {
            Commands::Run {
                iterations,
                workers,
                seed,
                ..
            } => {
                assert_eq!(iterations, 50);
                assert_eq!(workers, Some(4));
                assert_eq!(seed, Some(9));
            }
            Commands::Sample { .. } => panic!("expected run"),
        }
    }

    #[tokio::test]
    async fn test_event_log_survives_lag() {
        let (events, rx) = broadcast::channel(2);
        for i in 0..5 {
            events.send(PoolEvent::UnitReady { unit: UnitId::new(i) }).unwrap();
        }
        drop(events);
        // Three events were overwritten; the two newest are still logged.
        assert_eq!(log_events(rx).await, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_demo_batch_runs() {
        let pool = Pool::new(
            PoolConfig {
                worker_count: 2,
                ..PoolConfig::default()
            },
            Arc::new(demo::DemoFactory),
        )
        .unwrap();
        let request = RunRequest::new(r#"{"dice": 2, "sides": 6}"#, 20).with_base_seed(1);
        let summary = run_batch(&pool, request, Duration::from_secs(60)).await.unwrap();
        assert_eq!(summary.completed, 20);
        let snapshot = summary.snapshot.unwrap();
        assert_eq!(snapshot.count, 20);
        assert!(snapshot.metrics.contains_key("highest_die"));
    }
}

//! testpilot -- end-to-end test run orchestration.
//!
//! This crate schedules test suites against environments, drives each run
//! through a queue-backed phase pipeline with one active run per
//! environment, executes cron jobs and notifies subscribers.

pub mod api;
pub mod config;
pub mod jobs;
pub mod lease;
pub mod model;
pub mod notify;
pub mod ops;
pub mod pipeline;
pub mod queue;
pub mod scheduler;
pub mod storage;
pub mod worker;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::RunnerConfig;
use crate::jobs::CronExecutor;
use crate::notify::WebhookNotifier;
use crate::pipeline::{CommandStages, Pipeline};
use crate::queue::Transport;
use crate::scheduler::{Fanout, Scheduler};
use crate::storage::Pool;
use crate::worker::Worker;

/// Open the database configured in `config`.
pub fn open_store(config: &RunnerConfig) -> Result<Pool> {
    tracing::info!(path = %config.database.path.display(), "Initializing database");
    storage::open_pool(&config.database.path, config.database.pool_size)
}

/// Wire a worker with the command-based stages and webhook notifier.
pub fn build_worker(config: &RunnerConfig, pool: Pool, transport: Transport) -> Result<Worker> {
    let stages = Arc::new(CommandStages::new(pool.clone(), config));
    let notifier = Arc::new(WebhookNotifier::new(&config.notification)?);
    let pipeline = Pipeline::new(pool.clone(), transport.clone(), stages, notifier, config);
    Ok(Worker::new(
        transport.clone(),
        pipeline,
        CronExecutor::new(pool.clone(), config),
        Fanout::new(pool, transport),
        config.queue.poll_interval(),
        config.queue.retry_delay(),
    ))
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
        }
        trigger.cancel();
    });
    token
}

/// Run only the worker pool until Ctrl-C.
pub async fn run_workers(config: RunnerConfig) -> Result<()> {
    let pool = open_store(&config)?;
    let transport = Transport::new(pool.clone(), &config.queue);
    let worker = Arc::new(build_worker(&config, pool, transport)?);

    let shutdown = shutdown_on_ctrl_c();
    worker::run_worker_pool(worker, config.worker.count, shutdown).await;
    Ok(())
}

/// Start the daemon: API server, scheduler loop and worker pool.
pub async fn serve(config: RunnerConfig) -> Result<()> {
    // 1. Initialize Storage
    let pool = open_store(&config)?;
    let transport = Transport::new(pool.clone(), &config.queue);
    let shutdown = shutdown_on_ctrl_c();

    // 2. Start Scheduler Engine (background task)
    let scheduler = Scheduler::new(pool.clone());
    let scheduler_task = tokio::spawn(scheduler::run_scheduler_loop(
        scheduler.clone(),
        transport.clone(),
        std::time::Duration::from_secs(config.cron.tick_secs.max(1)),
        shutdown.clone(),
    ));

    // 3. Start Workers
    let worker = Arc::new(build_worker(&config, pool.clone(), transport.clone())?);
    let worker_task = tokio::spawn(worker::run_worker_pool(
        worker,
        config.worker.count,
        shutdown.clone(),
    ));

    // 4. Start API Server
    let state = api::state::AppState {
        ops: ops::Ops::new(pool, transport),
        scheduler,
    };
    let app = api::router(state);
    let addr: std::net::SocketAddr = config
        .api
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.api.bind))?;

    tracing::info!(%addr, "testpilot listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let api_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { api_shutdown.cancelled().await })
        .await?;

    shutdown.cancel();
    scheduler_task.await.context("scheduler task failed")?;
    worker_task.await.context("worker pool failed")?;
    Ok(())
}

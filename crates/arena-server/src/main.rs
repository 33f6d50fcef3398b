//! RL-Arena control plane server.
//!
//! Boots the storage and coordination stores, verifies the match executor
//! is reachable, then runs the long-lived services: notifier hub, build
//! monitor, and matchmaking engine. The REST surface and the socket
//! upgrade layer attach to these services in the API collaborator.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use arena_coord::bus::MatchmakingBus;
use arena_coord::lock::LockManager;
use arena_coord::ratelimit::{MemoryRateLimiter, SharedRateLimiter};
use arena_coord::CoordDatabase;
use arena_core::config::ArenaConfig;

use arena_server::build::{BuildConfig, BuildDispatcher, BuildMonitor};
use arena_server::executor::{ExecutorClient, HttpExecutorClient};
use arena_server::matches::MatchService;
use arena_server::matchmaking::{Enqueuer, MatchmakingConfig, MatchmakingEngine};
use arena_server::notifier::Hub;
use arena_server::orchestrator::HttpOrchestrator;
use arena_server::storage::Database;

#[derive(Parser, Debug)]
#[command(name = "arena-server")]
#[command(version, about = "RL-Arena control plane")]
struct Args {
    /// Row-store database file path (overrides DATABASE_URL)
    #[arg(long, env = "ARENA_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Coordination-store database file path (overrides COORD_URL)
    #[arg(long, env = "ARENA_COORD_DB_PATH")]
    coord_db_path: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long, default_value = "info", env = "ARENA_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation)
    #[arg(long, env = "ARENA_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_filter = format!("arena_server={0},arena_coord={0},arena_core={0}", args.log_level);
    arena_core::tracing_init::init_tracing(&log_filter, args.log_json);

    let config = ArenaConfig::from_env();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        env = %config.env,
        port = config.port,
        "Starting arena-server"
    );

    // Missing row store is fatal at startup.
    let db_path = args
        .db_path
        .clone()
        .or_else(|| {
            if config.database_url.is_empty() {
                None
            } else {
                Some(PathBuf::from(&config.database_url))
            }
        })
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL (or --db-path) is required"))?;
    let db = Database::open(&db_path).await?;

    // Coordination store: shared file when configured, private in-memory
    // store in single-replica mode.
    let coord_path = args
        .coord_db_path
        .clone()
        .or_else(|| config.coord_url.clone().map(PathBuf::from));
    let shared_coord = coord_path.is_some();
    let coord = match &coord_path {
        Some(path) => {
            info!(path = %path.display(), "Opening shared coordination store");
            CoordDatabase::open(path).await?
        }
        None => {
            info!("No coordination store configured, running single-replica");
            CoordDatabase::open_in_memory().await?
        }
    };

    // The executor must answer before we start pairing agents.
    let executor = Arc::new(HttpExecutorClient::new(config.executor_url.as_str())?);
    executor
        .health_check()
        .await
        .map_err(|e| anyhow::anyhow!("match executor at {} is unreachable: {e}", config.executor_url))?;
    info!(executor_url = %config.executor_url, "Match executor is healthy");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let (hub, hub_task) = Hub::spawn(256, shutdown_rx.clone());
    let bus = MatchmakingBus::new(256);
    let locks = LockManager::new(&coord);
    let enqueuer = Enqueuer::new(db.clone(), bus.clone());

    // Rate limiting: shared variant over the coordination store when one is
    // configured, in-process buckets otherwise. Both fail open at the API
    // layer.
    if shared_coord {
        let limiter = SharedRateLimiter::new(&coord);
        let mut sweep_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_secs(600));
            timer.tick().await;
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = limiter.sweep_expired().await {
                            tracing::warn!(error = %e, "rate bucket sweep failed");
                        }
                    }
                    _ = sweep_shutdown.changed() => return,
                }
            }
        });
        info!("Shared rate limiter active");
    } else {
        let limiter = MemoryRateLimiter::new(Duration::from_secs(600));
        limiter.spawn_sweeper(shutdown_rx.clone());
        info!("In-process rate limiter active");
    }

    let orchestrator = Arc::new(HttpOrchestrator::new(
        config.orchestrator_url.as_str(),
        config.orchestrator_namespace.as_str(),
    )?);
    let dispatcher = Arc::new(BuildDispatcher::new(
        db.clone(),
        Arc::clone(&orchestrator),
        BuildConfig {
            namespace: config.orchestrator_namespace.clone(),
            registry_url: config.registry_url.clone(),
            registry_secret: config.registry_secret.clone(),
            local_cluster: config.local_cluster,
        },
    ));

    let monitor = Arc::new(BuildMonitor::new(
        db.clone(),
        Arc::clone(&orchestrator),
        Arc::clone(&dispatcher),
        hub.clone(),
        enqueuer.clone(),
    ));
    let monitor_task = monitor.start(shutdown_rx.clone());

    let match_service = Arc::new(MatchService::new(
        db.clone(),
        Arc::clone(&executor),
        bus.clone(),
        hub.clone(),
    ));
    let engine = Arc::new(MatchmakingEngine::new(
        db.clone(),
        bus.clone(),
        locks,
        match_service,
        MatchmakingConfig {
            interval: config.matchmaking_interval,
            cooldown: config.match_cooldown,
            daily_limit: config.daily_match_limit,
            ..MatchmakingConfig::default()
        },
    ));
    let engine_tasks = Arc::clone(&engine).start(shutdown_rx.clone());

    info!("arena-server ready");

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    // Signal every long-lived task and wait for them to drain.
    let _ = shutdown_tx.send(true);
    let _ = monitor_task.await;
    for task in engine_tasks {
        let _ = task.await;
    }
    let _ = hub_task.await;

    db.close().await;
    coord.close().await;

    info!("arena-server stopped");
    Ok(())
}

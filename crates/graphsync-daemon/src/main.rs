//! GraphSync Daemon - Background synchronization service
//!
//! Keeps every configured container's record graph in step with its
//! provider:
//! - One full round at startup
//! - Incremental rounds every `sync.incremental_interval_secs`
//! - Full rounds (with deletion sweep) every `sync.full_interval_secs`
//! - Graceful shutdown on SIGTERM/SIGINT
//!
//! # Architecture
//!
//! Each connector gets one `ReconciliationEngine` wrapped around a
//! throttled lister; all engines share the SQLite store, the container
//! guard and a `CancellationToken` that is triggered on receipt of SIGTERM
//! or SIGINT. The `SyncScheduler` fans rounds out over the containers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use graphsync_cache::{DatabasePool, SqliteGraphStore};
use graphsync_connector::{
    AdaptiveRateLimiter, LocalDirectoryLister, RateLimitConfig, RetryPolicy, ThrottledLister,
    LOCAL_CONNECTOR,
};
use graphsync_core::config::Config;
use graphsync_core::domain::{ConnectorName, ContainerRef, PassKind};
use graphsync_core::ports::IGraphSyncStore;
use graphsync_sync::{ContainerGuard, ContainerOutcome, ReconciliationEngine, SyncScheduler};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "graphsyncd", version, about = "Incremental record-graph synchronization daemon")]
struct Args {
    /// Use alternate config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run a single round and exit
    #[arg(long)]
    once: bool,

    /// With --once, run a full round instead of an incremental one
    #[arg(long)]
    full: bool,
}

// ============================================================================
// DaemonService
// ============================================================================

/// Orchestrates scheduled sync rounds
struct DaemonService {
    config: Config,
    scheduler: SyncScheduler,
    containers: Vec<ContainerRef>,
    /// Token for signalling graceful shutdown to all passes
    shutdown: CancellationToken,
}

impl DaemonService {
    /// Opens the store and builds one engine per connector
    async fn new(config: Config, shutdown: CancellationToken) -> Result<Self> {
        let db_path = &config.store.database_path;
        let db_pool = DatabasePool::new(db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
        info!(database = %db_path.display(), "Opened database");

        let store: Arc<dyn IGraphSyncStore> =
            Arc::new(SqliteGraphStore::new(db_pool.pool().clone()));
        let (scheduler, containers) = build_scheduler(&config, store, shutdown.clone())?;

        Ok(Self {
            config,
            scheduler,
            containers,
            shutdown,
        })
    }

    /// Runs one round and returns whether every container succeeded
    async fn run_round(&self, kind: PassKind) -> bool {
        let outcomes = self.scheduler.run_round(&self.containers, kind).await;
        outcomes.iter().for_each(log_outcome);
        outcomes.iter().all(ContainerOutcome::is_success)
    }

    /// Main loop: a full round now, then both intervals until shutdown
    async fn run(&self) -> Result<()> {
        if self.containers.is_empty() {
            warn!("No containers configured; nothing to synchronize");
        }

        self.run_round(PassKind::Full).await;

        let mut incremental =
            tokio::time::interval(Duration::from_secs(self.config.sync.incremental_interval_secs));
        let mut full =
            tokio::time::interval(Duration::from_secs(self.config.sync.full_interval_secs));
        incremental.set_missed_tick_behavior(MissedTickBehavior::Delay);
        full.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // The first ticks fire immediately; the startup round covered them
        incremental.tick().await;
        full.tick().await;

        info!(
            incremental_interval_secs = self.config.sync.incremental_interval_secs,
            full_interval_secs = self.config.sync.full_interval_secs,
            "Starting sync loop"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received");
                    break;
                }
                _ = full.tick() => {
                    self.run_round(PassKind::Full).await;
                    incremental.reset();
                }
                _ = incremental.tick() => {
                    self.run_round(PassKind::Incremental).await;
                }
            }
        }

        info!("Sync loop terminated");
        Ok(())
    }
}

/// Registers an engine per configured connector
///
/// Only the local directory connector ships with the daemon; containers of
/// other connectors are reported as configuration failures each round.
fn build_scheduler(
    config: &Config,
    store: Arc<dyn IGraphSyncStore>,
    shutdown: CancellationToken,
) -> Result<(SyncScheduler, Vec<ContainerRef>)> {
    let limiter = Arc::new(AdaptiveRateLimiter::new(RateLimitConfig::from(
        &config.rate_limiting,
    )));
    let policy = RetryPolicy::from(&config.rate_limiting);
    let guard = ContainerGuard::new();

    let mut containers = Vec::with_capacity(config.containers.len());
    let mut local = LocalDirectoryLister::new(
        ConnectorName::new(LOCAL_CONNECTOR).context("Invalid connector name")?,
    );
    let mut actors = HashMap::new();

    for entry in &config.containers {
        let container = entry
            .container_ref()
            .with_context(|| format!("Invalid container {}/{}", entry.connector, entry.container_id))?;

        if container.connector.as_str() == LOCAL_CONNECTOR {
            let root = entry.root.clone().with_context(|| {
                format!("Container {container} needs a root directory")
            })?;
            local = local.with_root(container.clone(), root);
        } else {
            warn!(
                container = %container,
                connector = %container.connector,
                "No lister available for connector"
            );
        }

        if let Some(actor) = entry.actor() {
            actors.insert(container.clone(), actor);
        }
        containers.push(container);
    }

    let lister = ThrottledLister::new(Arc::new(local), Arc::clone(&limiter), policy);
    let mut engine = ReconciliationEngine::new(Arc::new(lister), store, &config.sync)
        .with_guard(guard)
        .with_cancellation(shutdown.child_token());
    for (container, actor) in actors {
        engine = engine.with_actor(container, actor);
    }

    let mut scheduler = SyncScheduler::from_config(&config.sync);
    scheduler.register(Arc::new(engine));
    Ok((scheduler, containers))
}

fn log_outcome(outcome: &ContainerOutcome) {
    match &outcome.result {
        Ok(report) => info!(
            container = %outcome.container,
            kind = report.kind.as_str(),
            created = report.counters.created,
            updated = report.counters.updated,
            moved = report.counters.moved,
            deleted = report.counters.deleted,
            skipped = report.counters.skipped,
            failed = report.counters.failed,
            partial = report.partial_listing,
            duration_ms = report.duration_ms,
            "Container synchronized"
        ),
        Err(e) => error!(container = %outcome.container, error = %e, "Container sync failed"),
    }
}

// ============================================================================
// Graceful shutdown signal handler
// ============================================================================

/// Waits for SIGTERM or SIGINT and triggers the cancellation token
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }

    token.cancel();
}

// ============================================================================
// Main entry point
// ============================================================================

fn init_tracing(config: &Config) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load_or_default(&config_path),
    };

    init_tracing(&config);
    info!(config_path = %config_path.display(), "GraphSync daemon starting (graphsyncd)");

    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            error!(%problem, "Invalid configuration");
        }
        anyhow::bail!("Configuration has {} error(s)", problems.len());
    }

    let shutdown_token = CancellationToken::new();
    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        shutdown_signal(signal_token).await;
    });

    let service = DaemonService::new(config, shutdown_token).await?;

    if args.once {
        let kind = if args.full {
            PassKind::Full
        } else {
            PassKind::Incremental
        };
        if !service.run_round(kind).await {
            anyhow::bail!("Some containers failed to synchronize");
        }
        return Ok(());
    }

    let result = service.run().await;
    match &result {
        Ok(()) => info!("GraphSync daemon shut down gracefully"),
        Err(e) => error!(error = %e, "GraphSync daemon exiting with error"),
    }
    result
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use graphsync_core::config::ContainerConfig;

    fn local_config(root: PathBuf) -> Config {
        Config {
            containers: vec![
                ContainerConfig {
                    org_id: "acme".into(),
                    connector: LOCAL_CONNECTOR.into(),
                    container_id: "share".into(),
                    root: Some(root),
                    actor: Some("ops@acme.test".into()),
                },
                ContainerConfig {
                    org_id: "acme".into(),
                    connector: "ftp".into(),
                    container_id: "legacy".into(),
                    root: None,
                    actor: None,
                },
            ],
            ..Default::default()
        }
    }

    async fn memory_store() -> Arc<dyn IGraphSyncStore> {
        let pool = DatabasePool::in_memory().await.unwrap();
        Arc::new(SqliteGraphStore::new(pool.pool().clone()))
    }

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from(["graphsyncd", "--once", "--full", "--config", "/tmp/c.yaml"]);
        assert!(args.once);
        assert!(args.full);
        assert_eq!(args.config, Some(PathBuf::from("/tmp/c.yaml")));
    }

    #[tokio::test]
    async fn test_build_scheduler_registers_local_connector() {
        let dir = tempfile::tempdir().unwrap();
        let config = local_config(dir.path().to_path_buf());

        let (scheduler, containers) =
            build_scheduler(&config, memory_store().await, CancellationToken::new()).unwrap();

        assert_eq!(containers.len(), 2);
        assert!(scheduler
            .engine(&ConnectorName::new(LOCAL_CONNECTOR).unwrap())
            .is_some());
        assert!(scheduler
            .engine(&ConnectorName::new("ftp").unwrap())
            .is_none());
    }

    #[tokio::test]
    async fn test_round_syncs_local_and_reports_unknown_connector() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
        let config = local_config(dir.path().to_path_buf());
        let store = memory_store().await;

        let (scheduler, containers) =
            build_scheduler(&config, Arc::clone(&store), CancellationToken::new()).unwrap();
        let outcomes = scheduler.run_round(&containers, PassKind::Full).await;

        assert!(outcomes[0].is_success());
        assert!(!outcomes[1].is_success());
        assert_eq!(store.count_records(&containers[0]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_engine_passes() {
        let dir = tempfile::tempdir().unwrap();
        let config = local_config(dir.path().to_path_buf());
        let shutdown = CancellationToken::new();

        let (scheduler, containers) =
            build_scheduler(&config, memory_store().await, shutdown.clone()).unwrap();
        shutdown.cancel();
        let outcomes = scheduler.run_round(&containers[..1], PassKind::Full).await;

        assert!(matches!(
            outcomes[0].result,
            Err(graphsync_sync::SyncError::Cancelled)
        ));
    }
}

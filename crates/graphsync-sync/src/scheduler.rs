//! Sync scheduler - bounded-concurrency rounds over many containers
//!
//! The [`SyncScheduler`] owns one [`ReconciliationEngine`] per connector and
//! runs a pass for every container of a round:
//!
//! ```text
//! containers ──chunks(pool_size)──→ group ──JoinSet──→ one task per container
//!                                     │                      │
//!                               pause between          Semaphore permit
//!                                  groups             (shared by all rounds)
//! ```
//!
//! A failing container only produces a failed [`ContainerOutcome`]; its
//! siblings keep running. Outcomes come back in input order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use graphsync_core::config::SyncConfig;
use graphsync_core::domain::{ConnectorName, ContainerRef, PassKind};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::engine::{ReconciliationEngine, SyncReport};
use crate::SyncError;

/// Result of one container's pass within a round
#[derive(Debug)]
pub struct ContainerOutcome {
    pub container: ContainerRef,
    pub result: Result<SyncReport, SyncError>,
}

impl ContainerOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Runs rounds of passes with bounded concurrency
pub struct SyncScheduler {
    engines: HashMap<ConnectorName, Arc<ReconciliationEngine>>,
    pool_size: usize,
    group_pause: Duration,
    permits: Arc<Semaphore>,
}

impl SyncScheduler {
    /// Creates a new `SyncScheduler`
    ///
    /// # Arguments
    /// * `pool_size` - Containers synced concurrently (minimum 1)
    /// * `group_pause` - Pause between consecutive groups of a round
    pub fn new(pool_size: usize, group_pause: Duration) -> Self {
        let pool_size = pool_size.max(1);
        info!(
            pool_size,
            group_pause_ms = group_pause.as_millis() as u64,
            "Creating sync scheduler"
        );
        Self {
            engines: HashMap::new(),
            pool_size,
            group_pause,
            permits: Arc::new(Semaphore::new(pool_size)),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            config.pool_size,
            Duration::from_millis(config.group_pause_ms),
        )
    }

    /// Registers the engine serving a connector, replacing any previous one
    pub fn register(&mut self, engine: Arc<ReconciliationEngine>) {
        self.engines
            .insert(engine.connector_name().clone(), engine);
    }

    pub fn engine(&self, connector: &ConnectorName) -> Option<&Arc<ReconciliationEngine>> {
        self.engines.get(connector)
    }

    /// Runs one pass of `kind` for every container
    ///
    /// Containers of unregistered connectors fail with a configuration error
    /// without being spawned.
    pub async fn run_round(
        &self,
        containers: &[ContainerRef],
        kind: PassKind,
    ) -> Vec<ContainerOutcome> {
        info!(
            kind = kind.as_str(),
            containers = containers.len(),
            "Starting sync round"
        );

        let mut outcomes = Vec::with_capacity(containers.len());
        let groups: Vec<&[ContainerRef]> = containers.chunks(self.pool_size).collect();

        for (index, group) in groups.iter().enumerate() {
            if index > 0 && !self.group_pause.is_zero() {
                tokio::time::sleep(self.group_pause).await;
            }
            outcomes.extend(self.run_group(group, kind).await);
        }

        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        if failed > 0 {
            warn!(
                kind = kind.as_str(),
                failed,
                total = outcomes.len(),
                "Sync round finished with failures"
            );
        } else {
            info!(kind = kind.as_str(), total = outcomes.len(), "Sync round finished");
        }
        outcomes
    }

    async fn run_group(&self, group: &[ContainerRef], kind: PassKind) -> Vec<ContainerOutcome> {
        let mut slots: Vec<Option<ContainerOutcome>> = Vec::with_capacity(group.len());
        let mut tasks = JoinSet::new();

        for (slot, container) in group.iter().enumerate() {
            slots.push(None);
            let Some(engine) = self.engines.get(&container.connector) else {
                slots[slot] = Some(ContainerOutcome {
                    container: container.clone(),
                    result: Err(SyncError::Configuration(format!(
                        "no engine registered for connector '{}'",
                        container.connector
                    ))),
                });
                continue;
            };

            let engine = Arc::clone(engine);
            let permits = Arc::clone(&self.permits);
            let container = container.clone();
            tasks.spawn(async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => match kind {
                        PassKind::Full => engine.run_full_sync(&container).await,
                        PassKind::Incremental => {
                            engine.run_incremental_sync(&container, None).await
                        }
                    },
                    Err(_) => Err(SyncError::Cancelled),
                };
                (slot, ContainerOutcome { container, result })
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((slot, outcome)) => slots[slot] = Some(outcome),
                Err(e) => error!(error = %e, "Sync task panicked or was aborted"),
            }
        }

        slots
            .into_iter()
            .zip(group)
            .map(|(slot, container)| {
                slot.unwrap_or_else(|| ContainerOutcome {
                    container: container.clone(),
                    result: Err(SyncError::TaskFailed(
                        "task ended without an outcome".to_string(),
                    )),
                })
            })
            .collect()
    }
}

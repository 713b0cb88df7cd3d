//! GraphSync Sync - Change-reconciliation engine
//!
//! Turns paginated provider listings into a minimal, idempotent set of
//! create / update / move / delete operations against the record graph.
//!
//! ## Modules
//!
//! - [`classifier`] - NEW / UPDATED / MOVED_OR_RENAMED / UNCHANGED decisions
//! - [`engine`] - Full and incremental passes over one container
//! - [`sweeper`] - Removal of records a full pass no longer observes
//! - [`guard`] - One running pass per container
//! - [`scheduler`] - Bounded-concurrency rounds over many containers

pub mod classifier;
pub mod engine;
pub mod guard;
pub mod scheduler;
pub mod sweeper;

pub use classifier::{ChangeClassifier, Classification, Classified};
pub use engine::{ReconciliationEngine, SyncReport};
pub use guard::{ContainerGuard, ContainerLease};
pub use scheduler::{ContainerOutcome, SyncScheduler};
pub use sweeper::DeletionSweeper;

use graphsync_core::domain::DomainError;
use graphsync_core::ports::ProviderError;
use thiserror::Error;

/// Errors that end a container's pass
#[derive(Debug, Error)]
pub enum SyncError {
    /// Invalid container, unknown connector or missing credentials
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Another pass holds the container
    #[error("A pass is already running for {0}")]
    AlreadyRunning(String),

    /// The provider failed in a way that stops the pass
    #[error("Provider error: {0:#}")]
    Provider(anyhow::Error),

    /// A store read or flush failed; the open batch was rolled back
    #[error("Storage error: {0:#}")]
    Storage(anyhow::Error),

    /// The pass was cancelled; the unflushed batch was dropped
    #[error("Pass cancelled")]
    Cancelled,

    /// The task running the pass panicked or was aborted
    #[error("Sync task failed: {0}")]
    TaskFailed(String),

    /// A domain-level error propagated from graphsync-core
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),
}

impl SyncError {
    /// Wraps a provider failure, surfacing configuration problems as such
    pub fn from_provider(err: anyhow::Error) -> Self {
        match err.downcast_ref::<ProviderError>() {
            Some(ProviderError::Configuration(msg)) => SyncError::Configuration(msg.clone()),
            _ => SyncError::Provider(err),
        }
    }

    /// Short reason recorded on a failed pass
    pub fn reason(&self) -> String {
        match self {
            SyncError::Cancelled => "cancelled".to_string(),
            other => other.to_string(),
        }
    }
}

//! Per-container re-entrancy guard
//!
//! At most one pass may run per container. [`ContainerGuard`] is a
//! concurrent set of busy containers; [`ContainerGuard::try_acquire`] hands
//! out a [`ContainerLease`] that releases the container when dropped, so the
//! release also happens when a pass errors out, is cancelled or panics.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use graphsync_core::domain::ContainerRef;
use tracing::debug;

use crate::SyncError;

/// Shared set of containers with a pass in progress
#[derive(Debug, Clone, Default)]
pub struct ContainerGuard {
    active: Arc<DashMap<ContainerRef, ()>>,
}

impl ContainerGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims a container for one pass
    ///
    /// # Errors
    /// Returns `SyncError::AlreadyRunning` if the container is claimed
    pub fn try_acquire(&self, container: &ContainerRef) -> Result<ContainerLease, SyncError> {
        match self.active.entry(container.clone()) {
            Entry::Occupied(_) => Err(SyncError::AlreadyRunning(container.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(());
                debug!(container = %container, "Container claimed");
                Ok(ContainerLease {
                    active: Arc::clone(&self.active),
                    container: container.clone(),
                })
            }
        }
    }

    /// Returns true while a pass holds the container
    pub fn is_active(&self, container: &ContainerRef) -> bool {
        self.active.contains_key(container)
    }

    /// Number of containers currently claimed
    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

/// Claim on a container, released on drop
#[derive(Debug)]
pub struct ContainerLease {
    active: Arc<DashMap<ContainerRef, ()>>,
    container: ContainerRef,
}

impl ContainerLease {
    pub fn container(&self) -> &ContainerRef {
        &self.container
    }
}

impl Drop for ContainerLease {
    fn drop(&mut self) {
        self.active.remove(&self.container);
        debug!(container = %self.container, "Container released");
    }
}

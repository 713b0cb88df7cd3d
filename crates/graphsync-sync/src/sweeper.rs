//! Deletion sweep
//!
//! After a complete full listing, every record of the container whose
//! external id was not observed is gone remotely and is deleted together
//! with its permission edges. Change feeds report deletions explicitly;
//! those go through [`DeletionSweeper::delete_explicit`].

use std::collections::HashSet;
use std::sync::Arc;

use graphsync_core::domain::{ContainerRef, ExternalId, RecordId};
use graphsync_core::ports::IGraphSyncStore;
use tracing::{debug, info};

use crate::SyncError;

/// Deletes records that no longer exist remotely
pub struct DeletionSweeper {
    store: Arc<dyn IGraphSyncStore>,
    batch_size: usize,
}

impl DeletionSweeper {
    /// Creates a sweeper deleting in transactions of `batch_size`
    pub fn new(store: Arc<dyn IGraphSyncStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    /// Deletes known records of `container` missing from `seen`
    ///
    /// Only valid after a complete listing; a partial listing would delete
    /// records that merely went unlisted.
    ///
    /// # Errors
    /// Returns `SyncError::Storage` if reading or a delete batch fails
    pub async fn run(
        &self,
        container: &ContainerRef,
        seen: &HashSet<ExternalId>,
    ) -> Result<u64, SyncError> {
        let known = self
            .store
            .list_container_records(container)
            .await
            .map_err(SyncError::Storage)?;

        let missing: Vec<RecordId> = known
            .iter()
            .filter(|r| !seen.contains(r.external_id()))
            .map(|r| {
                debug!(
                    container = %container,
                    external_id = %r.external_id(),
                    "Record no longer listed, deleting"
                );
                *r.id()
            })
            .collect();

        let deleted = self.delete_ids(&missing).await?;
        info!(
            container = %container,
            known = known.len(),
            deleted,
            "Deletion sweep finished"
        );
        Ok(deleted)
    }

    /// Deletes records named by explicit provider delete events
    ///
    /// Unknown external ids are ignored.
    ///
    /// # Errors
    /// Returns `SyncError::Storage` if a lookup or delete batch fails
    pub async fn delete_explicit(
        &self,
        container: &ContainerRef,
        external_ids: &[ExternalId],
    ) -> Result<u64, SyncError> {
        let mut ids = Vec::with_capacity(external_ids.len());
        for external_id in external_ids {
            match self
                .store
                .get_record_by_external_id(container, external_id)
                .await
                .map_err(SyncError::Storage)?
            {
                Some(record) => ids.push(*record.id()),
                None => debug!(
                    container = %container,
                    external_id = %external_id,
                    "Delete event for unknown record, ignoring"
                ),
            }
        }
        self.delete_ids(&ids).await
    }

    async fn delete_ids(&self, ids: &[RecordId]) -> Result<u64, SyncError> {
        let mut deleted = 0u64;
        for chunk in ids.chunks(self.batch_size) {
            let mut tx = self
                .store
                .begin_transaction()
                .await
                .map_err(SyncError::Storage)?;

            let mut chunk_deleted = 0u64;
            for id in chunk {
                match tx.delete_record(id).await {
                    Ok(true) => chunk_deleted += 1,
                    Ok(false) => {}
                    Err(e) => {
                        if let Err(rollback_err) = tx.rollback().await {
                            tracing::error!(error = %rollback_err, "Rollback of delete batch failed");
                        }
                        return Err(SyncError::Storage(e));
                    }
                }
            }

            tx.commit().await.map_err(SyncError::Storage)?;
            deleted += chunk_deleted;
        }
        Ok(deleted)
    }
}

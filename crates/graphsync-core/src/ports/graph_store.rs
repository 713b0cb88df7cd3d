//! Graph sync store port (driven/secondary port)
//!
//! This module defines the persistence interface the reconciliation engine
//! consumes: lookups over previously persisted records, transactional
//! batch writes of records and permission edges, and bookkeeping for
//! record groups, sync points and passes.
//!
//! Every write operation exists twice: once on [`IGraphSyncStore`], where it
//! commits on its own, and once on [`ISyncTransaction`], where it becomes
//! visible only on `commit`. A flush either fully applies or fully rolls back.

use std::collections::HashSet;

use crate::domain::newtypes::{ContainerRef, ExternalId, RecordId};
use crate::domain::pass::SyncPass;
use crate::domain::permission::Permission;
use crate::domain::record::Record;
use crate::domain::record_group::RecordGroup;
use crate::domain::sync_point::{SyncPoint, SyncPointKey};

/// A record together with its full, recomputed permission set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordWrite {
    pub record: Record,
    pub permissions: Vec<Permission>,
}

impl RecordWrite {
    pub fn new(record: Record, permissions: Vec<Permission>) -> Self {
        Self {
            record,
            permissions,
        }
    }
}

/// An open write transaction
///
/// Dropping a transaction without calling `commit` discards its writes.
#[async_trait::async_trait]
pub trait ISyncTransaction: Send {
    /// Inserts or updates records and replaces their permission edges
    async fn upsert_records_batch(&mut self, batch: &[RecordWrite]) -> anyhow::Result<()>;

    /// Deletes a record and detaches its permission edges
    ///
    /// Returns `false` if the record did not exist.
    async fn delete_record(&mut self, id: &RecordId) -> anyhow::Result<bool>;

    /// Replaces every permission edge of a record
    async fn replace_permission_edges(
        &mut self,
        id: &RecordId,
        permissions: &[Permission],
    ) -> anyhow::Result<()>;

    /// Makes all writes visible atomically
    async fn commit(self: Box<Self>) -> anyhow::Result<()>;

    /// Discards all writes
    async fn rollback(self: Box<Self>) -> anyhow::Result<()>;
}

/// Port trait for the persisted record graph
#[async_trait::async_trait]
pub trait IGraphSyncStore: Send + Sync {
    // --- Record lookups ---

    /// Retrieves a record by its internal id
    async fn get_record(&self, id: &RecordId) -> anyhow::Result<Option<Record>>;

    /// Retrieves the record with this external id in the container
    async fn get_record_by_external_id(
        &self,
        container: &ContainerRef,
        external_id: &ExternalId,
    ) -> anyhow::Result<Option<Record>>;

    /// Retrieves records in the container with this fingerprint, skipping
    /// the ids in `excluding`
    async fn get_records_by_fingerprint(
        &self,
        container: &ContainerRef,
        fingerprint: &str,
        excluding: &HashSet<RecordId>,
    ) -> anyhow::Result<Vec<Record>>;

    /// Lists every record of the container
    async fn list_container_records(&self, container: &ContainerRef)
        -> anyhow::Result<Vec<Record>>;

    /// Counts records in the container
    async fn count_records(&self, container: &ContainerRef) -> anyhow::Result<u64>;

    /// Retrieves the permission edges of a record, sorted by grantee id
    async fn get_permissions(&self, id: &RecordId) -> anyhow::Result<Vec<Permission>>;

    // --- Record writes (auto-commit) ---

    /// Inserts or updates records and replaces their permission edges
    async fn upsert_records_batch(&self, batch: &[RecordWrite]) -> anyhow::Result<()>;

    /// Deletes a record and detaches its permission edges
    async fn delete_record(&self, id: &RecordId) -> anyhow::Result<bool>;

    /// Replaces every permission edge of a record
    async fn replace_permission_edges(
        &self,
        id: &RecordId,
        permissions: &[Permission],
    ) -> anyhow::Result<()>;

    /// Opens a write transaction
    async fn begin_transaction(&self) -> anyhow::Result<Box<dyn ISyncTransaction>>;

    // --- Record groups ---

    /// Inserts or updates a record group, keyed by its container
    async fn upsert_record_group(&self, group: &RecordGroup) -> anyhow::Result<()>;

    /// Retrieves the record group of a container
    async fn get_record_group(&self, container: &ContainerRef)
        -> anyhow::Result<Option<RecordGroup>>;

    // --- Sync points ---

    /// Retrieves a sync point
    async fn get_sync_point(&self, key: &SyncPointKey) -> anyhow::Result<Option<SyncPoint>>;

    /// Saves a sync point (insert or replace)
    async fn save_sync_point(&self, key: &SyncPointKey, point: &SyncPoint) -> anyhow::Result<()>;

    // --- Passes ---

    /// Saves a pass (insert or update)
    async fn save_pass(&self, pass: &SyncPass) -> anyhow::Result<()>;

    /// Retrieves the most recently started pass of a container
    async fn get_latest_pass(&self, container: &ContainerRef) -> anyhow::Result<Option<SyncPass>>;
}

//! Shared fixtures for engine and scheduler tests
//!
//! - [`ScriptedLister`]: an in-memory provider whose tree, failures and
//!   change feed are set by the test
//! - [`FaultyStore`]: a SQLite store that can fail upcoming flushes halfway

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use graphsync_cache::{DatabasePool, SqliteGraphStore};
use graphsync_core::config::SyncConfig;
use graphsync_core::domain::{
    ConnectorName, ContainerInfo, ContainerRef, ExternalId, Permission, Principal,
    RawAclEntry, RawObjectEntry, RawPrincipal, Record, RecordGroup, RecordId, SyncPass,
    SyncPoint, SyncPointKey,
};
use graphsync_core::ports::{
    ChangePage, IGraphSyncStore, IObjectLister, ISyncTransaction, ListingPage, ProviderError,
    RecordWrite,
};
use graphsync_sync::ReconciliationEngine;
use tokio::sync::Semaphore;

pub const CONNECTOR: &str = "scripted";

pub fn container() -> ContainerRef {
    ContainerRef::parse("acme", CONNECTOR, "bucket").unwrap()
}

pub fn container_named(id: &str) -> ContainerRef {
    ContainerRef::parse("acme", CONNECTOR, id).unwrap()
}

pub fn ext(id: &str) -> ExternalId {
    ExternalId::new(id).unwrap()
}

// ============================================================================
// Entry builders
// ============================================================================

pub fn file(id: &str, name: &str, parent: Option<&str>, hash: &str) -> RawObjectEntry {
    let mut raw = RawObjectEntry::file(id, name);
    raw.parent_id = parent.map(str::to_string);
    raw.content_hash = Some(hash.to_string());
    raw.size = Some(hash.len() as u64);
    raw
}

pub fn folder(id: &str, name: &str, parent: Option<&str>) -> RawObjectEntry {
    let mut raw = RawObjectEntry::folder(id, name);
    raw.parent_id = parent.map(str::to_string);
    raw
}

pub fn owned_by(mut raw: RawObjectEntry, owner: &str) -> RawObjectEntry {
    raw.owner = Some(RawPrincipal {
        id: Some(owner.to_string()),
        email: Some(format!("{owner}@acme.test")),
    });
    raw
}

pub fn acl(grantee: &str, grantee_type: &str, role: &str) -> RawAclEntry {
    RawAclEntry {
        grantee_id: Some(grantee.to_string()),
        email: None,
        grantee_type: Some(grantee_type.to_string()),
        role: Some(role.to_string()),
    }
}

// ============================================================================
// ScriptedLister
// ============================================================================

/// Mutable script behind a [`ScriptedLister`]
#[derive(Default)]
pub struct Script {
    /// Every object of the container; children are found by `parent_id`
    pub objects: Vec<RawObjectEntry>,
    /// Children per page; 0 means everything on one page
    pub page_size: usize,
    /// Folders whose listing fails
    pub failing_folders: HashSet<String>,
    /// Containers whose root listing fails
    pub failing_containers: HashSet<String>,
    /// Change feed pages; `None` means the connector has no feed
    pub feed: Option<Vec<Vec<RawObjectEntry>>>,
    /// Delta link handed out at the end of the feed
    pub delta_link: String,
    /// Cursors passed to `fetch_changes`, in call order
    pub cursors_requested: Vec<Option<String>>,
    /// Folder whose listing waits on `gate`
    pub gated_folder: Option<String>,
    pub gate: Option<Arc<Semaphore>>,
    pub list_calls: usize,
    pub user: Option<Principal>,
}

pub struct ScriptedLister {
    name: ConnectorName,
    script: Mutex<Script>,
}

impl ScriptedLister {
    pub fn new(objects: Vec<RawObjectEntry>) -> Arc<Self> {
        Arc::new(Self {
            name: ConnectorName::new(CONNECTOR).unwrap(),
            script: Mutex::new(Script {
                objects,
                delta_link: "delta-1".to_string(),
                ..Default::default()
            }),
        })
    }

    /// Edits the script between passes
    pub fn update(&self, f: impl FnOnce(&mut Script)) {
        f(&mut self.script.lock().unwrap());
    }

    pub fn cursors_requested(&self) -> Vec<Option<String>> {
        self.script.lock().unwrap().cursors_requested.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.script.lock().unwrap().list_calls
    }

    /// Replaces the object with external id `id`
    pub fn replace(&self, id: &str, with: RawObjectEntry) {
        self.update(|s| {
            for obj in s.objects.iter_mut() {
                if obj.id.as_deref() == Some(id) {
                    *obj = with.clone();
                }
            }
        });
    }

    pub fn remove(&self, id: &str) {
        self.update(|s| s.objects.retain(|o| o.id.as_deref() != Some(id)));
    }

    pub fn push(&self, entry: RawObjectEntry) {
        self.update(|s| s.objects.push(entry));
    }
}

#[async_trait::async_trait]
impl IObjectLister for ScriptedLister {
    fn connector_name(&self) -> &ConnectorName {
        &self.name
    }

    async fn list_children(
        &self,
        container: &ContainerRef,
        parent: Option<&ExternalId>,
        page_token: Option<&str>,
    ) -> Result<ListingPage> {
        let gate = {
            let mut script = self.script.lock().unwrap();
            script.list_calls += 1;
            let gated = match (&script.gated_folder, parent) {
                (Some(gated), Some(p)) => gated == p.as_str(),
                _ => false,
            };
            gated.then(|| script.gate.clone()).flatten()
        };
        if let Some(gate) = gate {
            let _permit = gate.acquire().await?;
        }

        let script = self.script.lock().unwrap();
        if parent.is_none() && script.failing_containers.contains(container.container_id.as_str())
        {
            return Err(ProviderError::Transient("503 Service Unavailable".into()).into());
        }
        if let Some(p) = parent {
            if script.failing_folders.contains(p.as_str()) {
                return Err(ProviderError::AccessDenied(p.to_string()).into());
            }
        }

        let children: Vec<RawObjectEntry> = script
            .objects
            .iter()
            .filter(|o| o.parent_id.as_deref() == parent.map(ExternalId::as_str))
            .cloned()
            .collect();

        let offset: usize = page_token.map(|t| t.parse().unwrap()).unwrap_or(0);
        let page_size = if script.page_size == 0 {
            children.len().max(1)
        } else {
            script.page_size
        };
        let next = offset + page_size;

        Ok(ListingPage {
            entries: children.iter().skip(offset).take(page_size).cloned().collect(),
            next_page_token: (next < children.len()).then(|| next.to_string()),
            total_count: Some(children.len() as u64),
        })
    }

    async fn fetch_changes(
        &self,
        _container: &ContainerRef,
        cursor: Option<&str>,
    ) -> Result<Option<ChangePage>> {
        let mut script = self.script.lock().unwrap();
        script.cursors_requested.push(cursor.map(str::to_string));
        let Some(pages) = script.feed.clone() else {
            return Ok(None);
        };

        let index = cursor
            .and_then(|c| c.strip_prefix("page:"))
            .and_then(|n| n.parse::<usize>().ok())
            .unwrap_or(0);
        let last = index + 1 >= pages.len();

        Ok(Some(ChangePage {
            entries: pages.get(index).cloned().unwrap_or_default(),
            next_link: (!last).then(|| format!("page:{}", index + 1)),
            delta_link: last.then(|| script.delta_link.clone()),
        }))
    }

    async fn current_cursor(&self, _container: &ContainerRef) -> Result<Option<String>> {
        let script = self.script.lock().unwrap();
        Ok(script.feed.as_ref().map(|_| script.delta_link.clone()))
    }

    async fn describe_container(&self, container: &ContainerRef) -> Result<ContainerInfo> {
        Ok(ContainerInfo {
            name: Some(format!("Bucket {}", container.container_id)),
            owner_id: Some("alice".to_string()),
            web_url: Some(format!("https://storage.test/{}", container.container_id)),
        })
    }

    async fn whoami(&self) -> Result<Principal> {
        let script = self.script.lock().unwrap();
        Ok(script
            .user
            .clone()
            .unwrap_or_else(|| Principal::new("svc-sync", None)))
    }
}

// ============================================================================
// Stores
// ============================================================================

pub async fn sqlite_store() -> Arc<SqliteGraphStore> {
    let pool = DatabasePool::in_memory()
        .await
        .expect("Failed to create in-memory database");
    Arc::new(SqliteGraphStore::new(pool.pool().clone()))
}

pub fn engine(
    lister: Arc<ScriptedLister>,
    store: Arc<dyn IGraphSyncStore>,
    batch_size: usize,
) -> ReconciliationEngine {
    let config = SyncConfig {
        batch_size,
        ..Default::default()
    };
    ReconciliationEngine::new(lister, store, &config)
}

/// A store whose next `fail_flushes` transactional upserts fail halfway
pub struct FaultyStore {
    inner: Arc<SqliteGraphStore>,
    fail_flushes: Arc<AtomicUsize>,
}

impl FaultyStore {
    pub fn new(inner: Arc<SqliteGraphStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_flushes: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn fail_next_flushes(&self, n: usize) {
        self.fail_flushes.store(n, Ordering::SeqCst);
    }
}

struct FaultyTransaction {
    inner: Box<dyn ISyncTransaction>,
    fail: bool,
}

#[async_trait::async_trait]
impl ISyncTransaction for FaultyTransaction {
    async fn upsert_records_batch(&mut self, batch: &[RecordWrite]) -> Result<()> {
        if self.fail {
            // Part of the batch reaches the transaction before the failure
            self.inner
                .upsert_records_batch(&batch[..batch.len() / 2])
                .await?;
            anyhow::bail!("disk I/O error");
        }
        self.inner.upsert_records_batch(batch).await
    }

    async fn delete_record(&mut self, id: &RecordId) -> Result<bool> {
        self.inner.delete_record(id).await
    }

    async fn replace_permission_edges(
        &mut self,
        id: &RecordId,
        permissions: &[Permission],
    ) -> Result<()> {
        self.inner.replace_permission_edges(id, permissions).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.inner.rollback().await
    }
}

#[async_trait::async_trait]
impl IGraphSyncStore for FaultyStore {
    async fn get_record(&self, id: &RecordId) -> Result<Option<Record>> {
        self.inner.get_record(id).await
    }

    async fn get_record_by_external_id(
        &self,
        container: &ContainerRef,
        external_id: &ExternalId,
    ) -> Result<Option<Record>> {
        self.inner
            .get_record_by_external_id(container, external_id)
            .await
    }

    async fn get_records_by_fingerprint(
        &self,
        container: &ContainerRef,
        fingerprint: &str,
        excluding: &HashSet<RecordId>,
    ) -> Result<Vec<Record>> {
        self.inner
            .get_records_by_fingerprint(container, fingerprint, excluding)
            .await
    }

    async fn list_container_records(&self, container: &ContainerRef) -> Result<Vec<Record>> {
        self.inner.list_container_records(container).await
    }

    async fn count_records(&self, container: &ContainerRef) -> Result<u64> {
        self.inner.count_records(container).await
    }

    async fn get_permissions(&self, id: &RecordId) -> Result<Vec<Permission>> {
        self.inner.get_permissions(id).await
    }

    async fn upsert_records_batch(&self, batch: &[RecordWrite]) -> Result<()> {
        self.inner.upsert_records_batch(batch).await
    }

    async fn delete_record(&self, id: &RecordId) -> Result<bool> {
        self.inner.delete_record(id).await
    }

    async fn replace_permission_edges(
        &self,
        id: &RecordId,
        permissions: &[Permission],
    ) -> Result<()> {
        self.inner.replace_permission_edges(id, permissions).await
    }

    async fn begin_transaction(&self) -> Result<Box<dyn ISyncTransaction>> {
        let fail = self
            .fail_flushes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Ok(Box::new(FaultyTransaction {
            inner: self.inner.begin_transaction().await?,
            fail,
        }))
    }

    async fn upsert_record_group(&self, group: &RecordGroup) -> Result<()> {
        self.inner.upsert_record_group(group).await
    }

    async fn get_record_group(&self, container: &ContainerRef) -> Result<Option<RecordGroup>> {
        self.inner.get_record_group(container).await
    }

    async fn get_sync_point(&self, key: &SyncPointKey) -> Result<Option<SyncPoint>> {
        self.inner.get_sync_point(key).await
    }

    async fn save_sync_point(&self, key: &SyncPointKey, point: &SyncPoint) -> Result<()> {
        self.inner.save_sync_point(key, point).await
    }

    async fn save_pass(&self, pass: &SyncPass) -> Result<()> {
        self.inner.save_pass(pass).await
    }

    async fn get_latest_pass(&self, container: &ContainerRef) -> Result<Option<SyncPass>> {
        self.inner.get_latest_pass(container).await
    }
}

//! Reconciliation engine
//!
//! The [`ReconciliationEngine`] runs one pass over one container: it pulls
//! pages from an [`IObjectLister`], routes every entry through
//! fingerprinting, classification and permission resolution, buffers the
//! resulting writes and flushes them transactionally to the
//! [`IGraphSyncStore`].
//!
//! ## Pass Flow
//!
//! 1. **Prelude**: claim the container, persist a RUNNING pass, refresh the
//!    container's RecordGroup
//! 2. **Traversal**: breadth-first over folders (full pass, or incremental
//!    pass without a change feed), or the change feed pages
//! 3. **Flush**: every `batch_size` records and at the end, one transaction
//!    per batch
//! 4. **Sweep**: full passes with a complete listing delete unobserved
//!    records; change feeds delete what they report deleted
//!
//! ## Change Feeds
//!
//! The feed is read to the end before anything is applied. Each object keeps
//! only its last event, upserts run parents first, and deletes are applied
//! after the upserts are flushed. Folders the feed moves or renames have
//! their subtree re-listed so descendant paths follow.
//! 5. **Bookkeeping**: save the sync point, persist the COMPLETED or FAILED
//!    pass, return a [`SyncReport`]
//!
//! ## Failure Scope
//!
//! Invalid entries and per-entry provider failures are logged, counted and
//! skipped. Root listing failures, flush failures and cancellation fail the
//! pass; earlier committed batches stay, and re-running the pass is safe.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use graphsync_core::config::SyncConfig;
use graphsync_core::domain::{
    ConnectorName, ContainerRef, ExternalId, ExternalObjectEntry, ObjectMeta, PassCounters,
    PassId, PassKind, PassStatus, PermissionResolver, PermissionSources, Principal,
    RawObjectEntry, RecordGroup, SyncPass, SyncPoint, SyncPointKey,
};
use graphsync_core::ports::{ChangePage, IGraphSyncStore, IObjectLister, RecordWrite};

use crate::classifier::{ChangeClassifier, Classification};
use crate::guard::ContainerGuard;
use crate::sweeper::DeletionSweeper;
use crate::SyncError;

// ============================================================================
// SyncReport
// ============================================================================

/// Summary of a finished pass
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub pass_id: PassId,
    pub container: ContainerRef,
    pub kind: PassKind,
    pub status: PassStatus,
    /// Entries classified, per classification, plus skipped and failed ones
    pub counters: PassCounters,
    /// Per-entry errors that were skipped
    pub errors: Vec<String>,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
    /// Cursor saved for the next incremental pass
    pub cursor: Option<String>,
    /// Some folder could not be listed; a full pass skipped its sweep
    pub partial_listing: bool,
}

impl SyncReport {
    fn new(pass: &SyncPass, duration_ms: u64, outcome: PassOutcome) -> Self {
        Self {
            pass_id: *pass.id(),
            container: pass.container().clone(),
            kind: pass.kind(),
            status: pass.status().clone(),
            counters: *pass.counters(),
            errors: pass.errors().to_vec(),
            duration_ms,
            cursor: outcome.cursor,
            partial_listing: outcome.partial_listing,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

// ============================================================================
// Pass state
// ============================================================================

/// Result of the body of a pass, before bookkeeping
struct PassOutcome {
    cursor: Option<String>,
    partial_listing: bool,
}

/// Folder queued for listing; index 0 is the container root
struct FolderNode {
    external_id: Option<ExternalId>,
    path: String,
}

/// What processing one listed entry produced
enum EntryOutcome {
    /// A folder whose children still need listing
    Folder(ExternalId, String),
    File,
    /// An explicit delete event
    Deleted(ExternalId),
    Skipped,
}

/// Everything one pass accumulates
struct PassState {
    pass: SyncPass,
    classifier: ChangeClassifier,
    resolver: PermissionResolver,
    actor: Option<Principal>,
    batch: Vec<RecordWrite>,
    /// External ids observed this pass, valid or not
    seen: HashSet<ExternalId>,
    /// Paths of folders reconciled this pass, for change-feed children
    folder_paths: HashMap<ExternalId, String>,
    /// Folders classified as moved or renamed, with their new path
    relocated_folders: Vec<(ExternalId, String)>,
    /// Some subtree went unlisted
    partial: bool,
}

// ============================================================================
// ReconciliationEngine
// ============================================================================

/// Reconciles the containers of one connector into the record graph
pub struct ReconciliationEngine {
    lister: Arc<dyn IObjectLister>,
    store: Arc<dyn IGraphSyncStore>,
    batch_size: usize,
    guard: ContainerGuard,
    /// Configured actors; containers without one use the lister's identity
    actors: HashMap<ContainerRef, Principal>,
    cancel: CancellationToken,
}

impl ReconciliationEngine {
    /// Creates a new `ReconciliationEngine`
    ///
    /// # Arguments
    /// * `lister` - Provider lister (usually a `ThrottledLister`)
    /// * `store` - Persistent record graph
    /// * `config` - Sync settings; only `batch_size` is used here
    pub fn new(
        lister: Arc<dyn IObjectLister>,
        store: Arc<dyn IGraphSyncStore>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            lister,
            store,
            batch_size: config.batch_size.max(1),
            guard: ContainerGuard::new(),
            actors: HashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Shares a re-entrancy guard with other engines
    pub fn with_guard(mut self, guard: ContainerGuard) -> Self {
        self.guard = guard;
        self
    }

    /// Ties the engine to an outer cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Configures the identity granted implicit READ on a container
    pub fn with_actor(mut self, container: ContainerRef, actor: Principal) -> Self {
        self.actors.insert(container, actor);
        self
    }

    pub fn connector_name(&self) -> &ConnectorName {
        self.lister.connector_name()
    }

    pub fn guard(&self) -> &ContainerGuard {
        &self.guard
    }

    /// Token that cancels running and future passes of this engine
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // ========================================================================
    // Public surface
    // ========================================================================

    /// Cheap read-only probe of the provider connection
    #[instrument(skip(self, container), fields(container = %container))]
    pub async fn test_connection(&self, container: &ContainerRef) -> bool {
        if let Err(e) = self.check_container(container) {
            warn!(error = %e, "Connection test rejected");
            return false;
        }
        match self.lister.whoami().await {
            Ok(principal) => {
                info!(principal = %principal.id, "Connection test succeeded");
                true
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Connection test failed");
                false
            }
        }
    }

    /// Full pass: lists the whole container and deletes what is gone
    ///
    /// # Errors
    /// - `Configuration` for a container of another connector
    /// - `AlreadyRunning` if a pass holds the container
    /// - `Provider`, `Storage` or `Cancelled` when the pass fails; the
    ///   FAILED pass is persisted before returning
    #[instrument(skip(self, container), fields(container = %container))]
    pub async fn run_full_sync(&self, container: &ContainerRef) -> Result<SyncReport, SyncError> {
        self.run_pass(container, PassKind::Full, None).await
    }

    /// Incremental pass from `cursor`, or from the saved sync point
    ///
    /// Consumes the provider's change feed when there is one and re-lists
    /// the container otherwise. Records absent from the listing are never
    /// deleted; only explicit delete events remove records.
    ///
    /// # Errors
    /// Same as [`run_full_sync`](Self::run_full_sync)
    #[instrument(skip(self, container, cursor), fields(container = %container))]
    pub async fn run_incremental_sync(
        &self,
        container: &ContainerRef,
        cursor: Option<String>,
    ) -> Result<SyncReport, SyncError> {
        self.run_pass(container, PassKind::Incremental, cursor)
            .await
    }

    // ========================================================================
    // Pass driver
    // ========================================================================

    async fn run_pass(
        &self,
        container: &ContainerRef,
        kind: PassKind,
        cursor: Option<String>,
    ) -> Result<SyncReport, SyncError> {
        self.check_container(container)?;
        let _lease = self.guard.try_acquire(container)?;
        let started = Instant::now();

        info!(kind = kind.as_str(), "Starting sync pass");
        let mut state = self.begin_pass(container, kind).await?;

        let outcome = match kind {
            PassKind::Full => self.full_pass(container, &mut state).await,
            PassKind::Incremental => self.incremental_pass(container, &mut state, cursor).await,
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let PassState { mut pass, .. } = state;

        match outcome {
            Ok(outcome) => {
                pass.complete()?;
                self.store
                    .save_pass(&pass)
                    .await
                    .map_err(SyncError::Storage)?;

                let c = pass.counters();
                info!(
                    kind = kind.as_str(),
                    processed = c.processed,
                    created = c.created,
                    updated = c.updated,
                    moved = c.moved,
                    unchanged = c.unchanged,
                    deleted = c.deleted,
                    skipped = c.skipped,
                    failed = c.failed,
                    duration_ms,
                    "Sync pass completed"
                );
                Ok(SyncReport::new(&pass, duration_ms, outcome))
            }
            Err(err) => {
                if let Err(e) = pass.fail(err.reason()) {
                    warn!(error = %e, "Could not mark pass as failed");
                }
                if let Err(e) = self.store.save_pass(&pass).await {
                    error!(error = %format!("{e:#}"), "Failed to persist failed pass");
                }
                error!(kind = kind.as_str(), error = %err, duration_ms, "Sync pass failed");
                Err(err)
            }
        }
    }

    fn check_container(&self, container: &ContainerRef) -> Result<(), SyncError> {
        if &container.connector != self.lister.connector_name() {
            return Err(SyncError::Configuration(format!(
                "container {container} belongs to connector '{}', engine serves '{}'",
                container.connector,
                self.lister.connector_name()
            )));
        }
        Ok(())
    }

    fn check_cancelled(&self) -> Result<(), SyncError> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    async fn begin_pass(&self, container: &ContainerRef, kind: PassKind) -> Result<PassState, SyncError> {
        let mut pass = SyncPass::new(container.clone(), kind);
        pass.start()?;
        self.store
            .save_pass(&pass)
            .await
            .map_err(SyncError::Storage)?;

        let actor = match self.actors.get(container) {
            Some(actor) => Some(actor.clone()),
            None => match self.lister.whoami().await {
                Ok(principal) => Some(principal),
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "Could not resolve acting identity");
                    None
                }
            },
        };

        Ok(PassState {
            pass,
            classifier: ChangeClassifier::new(Arc::clone(&self.store), container.clone()),
            resolver: PermissionResolver::new(container.org_id.clone(), self.lister.role_table()),
            actor,
            batch: Vec::with_capacity(self.batch_size),
            seen: HashSet::new(),
            folder_paths: HashMap::new(),
            relocated_folders: Vec::new(),
            partial: false,
        })
    }

    async fn full_pass(
        &self,
        container: &ContainerRef,
        state: &mut PassState,
    ) -> Result<PassOutcome, SyncError> {
        self.sync_record_group(container).await?;
        self.traverse(container, state).await?;
        self.flush(state).await?;

        if state.partial {
            warn!(
                container = %container,
                "Listing was partial, skipping deletion sweep"
            );
        } else {
            self.check_cancelled()?;
            let deleted = DeletionSweeper::new(Arc::clone(&self.store), self.batch_size)
                .run(container, &state.seen)
                .await?;
            state.pass.counters_mut().deleted += deleted;
        }

        let cursor = self.current_cursor(container).await;
        self.save_sync_point(container, cursor.as_deref()).await?;
        Ok(PassOutcome {
            cursor,
            partial_listing: state.partial,
        })
    }

    async fn incremental_pass(
        &self,
        container: &ContainerRef,
        state: &mut PassState,
        cursor: Option<String>,
    ) -> Result<PassOutcome, SyncError> {
        self.sync_record_group(container).await?;

        let cursor = match cursor {
            Some(cursor) => Some(cursor),
            None => self
                .store
                .get_sync_point(&SyncPointKey::for_container(container))
                .await
                .map_err(SyncError::Storage)?
                .and_then(|point| point.cursor().map(str::to_string)),
        };
        debug!(cursor = ?cursor, "Resolved incremental cursor");

        let first = self
            .lister
            .fetch_changes(container, cursor.as_deref())
            .await
            .map_err(SyncError::from_provider)?;

        let next_cursor = match first {
            Some(page) => self.consume_changes(container, state, page, cursor).await?,
            None => {
                debug!("Connector has no change feed, re-listing container");
                self.traverse(container, state).await?;
                self.flush(state).await?;
                self.current_cursor(container).await
            }
        };

        self.save_sync_point(container, next_cursor.as_deref()).await?;
        Ok(PassOutcome {
            cursor: next_cursor,
            partial_listing: state.partial,
        })
    }

    // ========================================================================
    // Traversal
    // ========================================================================

    /// Breadth-first listing of the container; parents before children
    async fn traverse(&self, container: &ContainerRef, state: &mut PassState) -> Result<(), SyncError> {
        let root = FolderNode {
            external_id: None,
            path: String::new(),
        };
        self.list_tree(container, state, vec![root], false).await
    }

    /// Breadth-first listing below `seeds`
    ///
    /// Only a failure on the first page of the container root is fatal. When
    /// `relisting`, entries already applied this pass are not reconciled
    /// again; folders among them are still descended.
    async fn list_tree(
        &self,
        container: &ContainerRef,
        state: &mut PassState,
        seeds: Vec<FolderNode>,
        relisting: bool,
    ) -> Result<(), SyncError> {
        let mut listed: HashSet<ExternalId> = seeds
            .iter()
            .filter_map(|node| node.external_id.clone())
            .collect();
        let mut queue: VecDeque<usize> = (0..seeds.len()).collect();
        let mut arena = seeds;

        while let Some(index) = queue.pop_front() {
            let parent_id = arena[index].external_id.clone();
            let parent_path = arena[index].path.clone();
            let mut page_token: Option<String> = None;

            loop {
                self.check_cancelled()?;
                let page = match self
                    .lister
                    .list_children(container, parent_id.as_ref(), page_token.as_deref())
                    .await
                {
                    Ok(page) => page,
                    Err(e) if parent_id.is_none() && page_token.is_none() => {
                        return Err(SyncError::from_provider(
                            e.context("Failed to list container root"),
                        ));
                    }
                    Err(e) => {
                        let folder = parent_id.as_ref().map_or("/", ExternalId::as_str);
                        warn!(
                            container = %container,
                            folder,
                            error = %format!("{e:#}"),
                            "Folder listing failed, listing is partial"
                        );
                        state.pass.counters_mut().failed += 1;
                        state.pass.record_error(format!("listing {folder}: {e:#}"));
                        state.partial = true;
                        break;
                    }
                };

                debug!(
                    folder = parent_id.as_ref().map_or("/", ExternalId::as_str),
                    entries = page.entries.len(),
                    total = ?page.total_count,
                    "Listed page"
                );

                for raw in page.entries {
                    if relisting {
                        if let Some(id) = entry_key(&raw).filter(|id| state.seen.contains(id)) {
                            if let Some(path) = state.folder_paths.get(&id).cloned() {
                                if listed.insert(id.clone()) {
                                    arena.push(FolderNode {
                                        external_id: Some(id),
                                        path,
                                    });
                                    queue.push_back(arena.len() - 1);
                                }
                            }
                            continue;
                        }
                    }

                    match self
                        .process_entry(
                            container,
                            state,
                            raw,
                            parent_id.as_ref(),
                            Some(parent_path.as_str()),
                        )
                        .await?
                    {
                        EntryOutcome::Folder(external_id, path) => {
                            if listed.insert(external_id.clone()) {
                                arena.push(FolderNode {
                                    external_id: Some(external_id),
                                    path,
                                });
                                queue.push_back(arena.len() - 1);
                            }
                        }
                        EntryOutcome::Deleted(external_id) => {
                            debug!(external_id = %external_id, "Ignoring delete marker in listing");
                            state.pass.counters_mut().skipped += 1;
                        }
                        EntryOutcome::File | EntryOutcome::Skipped => {}
                    }
                }

                match page.next_page_token {
                    Some(token) if !token.is_empty() => page_token = Some(token),
                    _ => break,
                }
            }
        }

        Ok(())
    }

    /// Applies a change feed; returns the cursor to resume from
    async fn consume_changes(
        &self,
        container: &ContainerRef,
        state: &mut PassState,
        first: ChangePage,
        cursor: Option<String>,
    ) -> Result<Option<String>, SyncError> {
        let (events, next_cursor) = self.read_feed(container, first, cursor).await?;
        let changes = FeedChanges::reduce(events);
        debug!(
            upserts = changes.upserts.len(),
            deletes = changes.deletes.len(),
            "Reduced change feed"
        );

        state
            .classifier
            .restrict_moves_to(changes.deletes.iter().cloned().collect());
        for raw in changes.upserts {
            self.process_entry(container, state, raw, None, None).await?;
        }

        let relocated = std::mem::take(&mut state.relocated_folders);
        if !relocated.is_empty() {
            info!(
                container = %container,
                folders = relocated.len(),
                "Re-listing moved or renamed folders"
            );
            // Deleted objects a stale listing still returns stay deleted
            state.seen.extend(changes.deletes.iter().cloned());
            let seeds = relocated
                .into_iter()
                .map(|(external_id, path)| FolderNode {
                    external_id: Some(external_id),
                    path,
                })
                .collect();
            self.list_tree(container, state, seeds, true).await?;
        }

        self.flush(state).await?;

        if !changes.deletes.is_empty() {
            self.check_cancelled()?;
            let deleted = DeletionSweeper::new(Arc::clone(&self.store), self.batch_size)
                .delete_explicit(container, &changes.deletes)
                .await?;
            state.pass.counters_mut().deleted += deleted;
        }

        Ok(next_cursor)
    }

    /// Reads every page of the feed
    async fn read_feed(
        &self,
        container: &ContainerRef,
        first: ChangePage,
        cursor: Option<String>,
    ) -> Result<(Vec<RawObjectEntry>, Option<String>), SyncError> {
        let mut page = first;
        let mut events = Vec::new();
        let mut next_cursor = cursor;

        loop {
            debug!(entries = page.entries.len(), "Read change page");
            events.append(&mut page.entries);

            if let Some(delta) = page.delta_link.take() {
                next_cursor = Some(delta);
                break;
            }
            let Some(next) = page.next_link.take() else {
                // No delta link: resume from the old cursor next time
                break;
            };

            self.check_cancelled()?;
            page = self
                .lister
                .fetch_changes(container, Some(&next))
                .await
                .map_err(SyncError::from_provider)?
                .unwrap_or_default();
        }

        Ok((events, next_cursor))
    }

    // ========================================================================
    // Per-entry processing
    // ========================================================================

    /// Validates, reconciles and buffers one entry
    ///
    /// Only flush failures and cancellation escape as errors.
    async fn process_entry(
        &self,
        container: &ContainerRef,
        state: &mut PassState,
        raw: RawObjectEntry,
        listed_parent: Option<&ExternalId>,
        parent_path: Option<&str>,
    ) -> Result<EntryOutcome, SyncError> {
        let raw_id = raw.id.clone();
        let may_have_children = may_have_children(&raw);

        let entry = match ExternalObjectEntry::try_from(raw) {
            Ok(entry) => entry,
            Err(e) => {
                // A listed object must not be swept just because it is malformed
                if let Some(id) = raw_id.and_then(|id| ExternalId::new(id).ok()) {
                    state.seen.insert(id);
                }
                if may_have_children {
                    state.partial = true;
                }
                warn!(container = %container, error = %e, "Skipping invalid entry");
                state.pass.counters_mut().skipped += 1;
                state.pass.record_error(e.to_string());
                return Ok(EntryOutcome::Skipped);
            }
        };

        let (mut meta, is_file) = match entry {
            ExternalObjectEntry::Deleted { external_id } => {
                return Ok(EntryOutcome::Deleted(external_id))
            }
            ExternalObjectEntry::File(meta) => (meta, true),
            ExternalObjectEntry::Folder(meta) => (meta, false),
        };

        if !state.seen.insert(meta.external_id.clone()) {
            debug!(external_id = %meta.external_id, "Entry already seen this pass, skipping");
            state.pass.counters_mut().skipped += 1;
            return Ok(EntryOutcome::Skipped);
        }

        if meta.parent_id.is_none() {
            meta.parent_id = listed_parent.cloned();
        }

        let external_id = meta.external_id.clone();
        match self
            .reconcile_entry(container, state, meta, is_file, parent_path)
            .await
        {
            Ok(outcome) => {
                if state.batch.len() >= self.batch_size {
                    self.flush(state).await?;
                }
                Ok(outcome)
            }
            Err(e) => {
                warn!(
                    container = %container,
                    external_id = %external_id,
                    error = %format!("{e:#}"),
                    "Failed to reconcile entry, skipping"
                );
                if !is_file {
                    state.partial = true;
                }
                state.pass.counters_mut().failed += 1;
                state.pass.record_error(format!("{external_id}: {e:#}"));
                Ok(EntryOutcome::Skipped)
            }
        }
    }

    async fn reconcile_entry(
        &self,
        container: &ContainerRef,
        state: &mut PassState,
        mut meta: ObjectMeta,
        is_file: bool,
        parent_path: Option<&str>,
    ) -> anyhow::Result<EntryOutcome> {
        if let Some(acl) = self
            .lister
            .fetch_acl(container, &meta)
            .await
            .context("Failed to fetch ACL")?
        {
            meta.acl = acl;
        }

        let path = self
            .resolve_path(container, state, &meta, parent_path)
            .await
            .context("Failed to resolve parent path")?;
        let fingerprint = self.lister.fingerprint(&meta);

        let classified = state
            .classifier
            .classify(&meta, is_file, path, fingerprint)
            .await
            .context("Failed to classify entry")?;

        let permissions = state.resolver.resolve(PermissionSources {
            acl: &meta.acl,
            owner: meta.owner.as_ref(),
            visibility: meta.visibility,
            actor: state.actor.as_ref(),
        });

        let counters = state.pass.counters_mut();
        counters.processed += 1;
        match classified.classification {
            Classification::New => counters.created += 1,
            Classification::Updated => counters.updated += 1,
            Classification::MovedOrRenamed => counters.moved += 1,
            Classification::Unchanged => counters.unchanged += 1,
        }

        debug!(
            external_id = %meta.external_id,
            classification = %classified.classification,
            version = classified.record.version(),
            permissions = permissions.len(),
            "Classified entry"
        );

        let outcome = if is_file {
            EntryOutcome::File
        } else {
            let path = classified.record.path().to_string();
            state
                .folder_paths
                .insert(meta.external_id.clone(), path.clone());
            if classified.classification == Classification::MovedOrRenamed {
                state
                    .relocated_folders
                    .push((meta.external_id.clone(), path.clone()));
            }
            EntryOutcome::Folder(meta.external_id, path)
        };

        state
            .batch
            .push(RecordWrite::new(classified.record, permissions));
        Ok(outcome)
    }

    /// Own path, else parent path joined with the name
    ///
    /// Change-feed entries carry no listing parent; their parent's path
    /// comes from this pass or from the store.
    async fn resolve_path(
        &self,
        container: &ContainerRef,
        state: &PassState,
        meta: &ObjectMeta,
        parent_path: Option<&str>,
    ) -> anyhow::Result<String> {
        if let Some(path) = meta.path.as_deref() {
            return Ok(normalize_path(path));
        }

        let parent = match (parent_path, &meta.parent_id) {
            (Some(path), _) => Some(path.to_string()),
            (None, Some(parent_id)) => match state.folder_paths.get(parent_id) {
                Some(path) => Some(path.clone()),
                None => self
                    .store
                    .get_record_by_external_id(container, parent_id)
                    .await?
                    .map(|r| r.path().to_string()),
            },
            (None, None) => None,
        };

        Ok(join_path(parent.as_deref().unwrap_or(""), &meta.name))
    }

    // ========================================================================
    // Store writes
    // ========================================================================

    /// Writes the buffered batch in one transaction
    async fn flush(&self, state: &mut PassState) -> Result<(), SyncError> {
        if state.batch.is_empty() {
            return Ok(());
        }
        self.check_cancelled()?;

        let batch = std::mem::take(&mut state.batch);
        let mut tx = self
            .store
            .begin_transaction()
            .await
            .map_err(SyncError::Storage)?;

        if let Err(e) = tx.upsert_records_batch(&batch).await {
            if let Err(rollback_err) = tx.rollback().await {
                error!(error = %format!("{rollback_err:#}"), "Rollback of batch failed");
            }
            return Err(SyncError::Storage(e.context(format!(
                "Failed to flush batch of {} records",
                batch.len()
            ))));
        }

        tx.commit()
            .await
            .map_err(|e| SyncError::Storage(e.context("Failed to commit batch")))?;
        debug!(records = batch.len(), "Flushed batch");
        Ok(())
    }

    async fn sync_record_group(&self, container: &ContainerRef) -> Result<(), SyncError> {
        let info = self
            .lister
            .describe_container(container)
            .await
            .map_err(SyncError::from_provider)?;

        let group = match self
            .store
            .get_record_group(container)
            .await
            .map_err(SyncError::Storage)?
        {
            Some(mut group) => {
                group.refresh(info);
                group
            }
            None => RecordGroup::new(container, info),
        };

        self.store
            .upsert_record_group(&group)
            .await
            .map_err(SyncError::Storage)
    }

    async fn current_cursor(&self, container: &ContainerRef) -> Option<String> {
        match self.lister.current_cursor(container).await {
            Ok(cursor) => cursor,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Could not read current change cursor");
                None
            }
        }
    }

    async fn save_sync_point(
        &self,
        container: &ContainerRef,
        cursor: Option<&str>,
    ) -> Result<(), SyncError> {
        let key = SyncPointKey::for_container(container);
        let point = SyncPoint::new(cursor.unwrap_or_default(), Utc::now().timestamp_millis());
        self.store
            .save_sync_point(&key, &point)
            .await
            .map_err(SyncError::Storage)
    }
}

/// Invalid entries that are not plainly files may hide a subtree
/// External id of a raw entry, if it has a usable one
fn entry_key(raw: &RawObjectEntry) -> Option<ExternalId> {
    raw.id
        .as_deref()
        .map(str::trim)
        .and_then(|id| ExternalId::new(id).ok())
}

/// A change feed reduced to one event per object
struct FeedChanges {
    /// Last upsert per object, parents before children
    upserts: Vec<RawObjectEntry>,
    /// Objects whose last event is a delete
    deletes: Vec<ExternalId>,
}

impl FeedChanges {
    /// Keeps the last event per object in feed order
    ///
    /// Entries without a usable id are kept so validation can report them.
    fn reduce(events: Vec<RawObjectEntry>) -> Self {
        let mut last = HashMap::new();
        for (index, raw) in events.iter().enumerate() {
            if let Some(id) = entry_key(raw) {
                last.insert(id, index);
            }
        }

        let mut upserts = Vec::new();
        let mut deletes = Vec::new();
        for (index, raw) in events.into_iter().enumerate() {
            match entry_key(&raw) {
                Some(id) if last.get(&id) != Some(&index) => {
                    debug!(external_id = %id, "Change superseded later in the feed");
                }
                Some(id) if raw.deleted => deletes.push(id),
                _ => upserts.push(raw),
            }
        }

        Self {
            upserts: parents_first(upserts),
            deletes,
        }
    }
}

/// Stable reorder so an entry follows its parent when both are present
fn parents_first(entries: Vec<RawObjectEntry>) -> Vec<RawObjectEntry> {
    let parents: HashMap<String, Option<String>> = entries
        .iter()
        .filter_map(|raw| Some((raw.id.clone()?, raw.parent_id.clone())))
        .collect();
    let depth_of = |raw: &RawObjectEntry| {
        let mut depth = 0usize;
        let mut current = raw.parent_id.as_deref();
        // Bounded so a parent cycle cannot loop
        while let Some(parent) = current.filter(|_| depth < parents.len()) {
            match parents.get(parent) {
                Some(next) => {
                    depth += 1;
                    current = next.as_deref();
                }
                None => break,
            }
        }
        depth
    };

    let mut keyed: Vec<(usize, RawObjectEntry)> =
        entries.into_iter().map(|raw| (depth_of(&raw), raw)).collect();
    keyed.sort_by_key(|(depth, _)| *depth);
    keyed.into_iter().map(|(_, raw)| raw).collect()
}

fn may_have_children(raw: &RawObjectEntry) -> bool {
    match raw.kind.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None | Some("file") | Some("object") | Some("blob") => false,
        Some(_) => !raw.deleted,
    }
}

/// Leading slash, no trailing slash except for the root
fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    format!("/{trimmed}")
}

fn join_path(parent: &str, name: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("docs/a.pdf"), "/docs/a.pdf");
        assert_eq!(normalize_path("/docs/reports/"), "/docs/reports");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path(" /a "), "/a");
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("", "a.pdf"), "/a.pdf");
        assert_eq!(join_path("/docs", "a.pdf"), "/docs/a.pdf");
        assert_eq!(join_path("/", "a.pdf"), "/a.pdf");
    }

    #[test]
    fn test_may_have_children() {
        assert!(!may_have_children(&RawObjectEntry::file("f", "a")));
        assert!(may_have_children(&RawObjectEntry::folder("d", "docs")));
        let mut odd = RawObjectEntry::file("x", "x");
        odd.kind = Some("shortcut".into());
        assert!(may_have_children(&odd));
    }

    fn ids(entries: &[RawObjectEntry]) -> Vec<&str> {
        entries.iter().filter_map(|raw| raw.id.as_deref()).collect()
    }

    #[test]
    fn test_feed_keeps_last_event_per_object() {
        let mut v2 = RawObjectEntry::file("a", "a.txt");
        v2.content_hash = Some("h2".into());
        let changes = FeedChanges::reduce(vec![
            RawObjectEntry::deletion("a"),
            RawObjectEntry::file("b", "b.txt"),
            v2,
            RawObjectEntry::file("c", "c.txt"),
            RawObjectEntry::deletion("c"),
            RawObjectEntry::default(),
        ]);

        assert_eq!(ids(&changes.upserts), vec!["b", "a"]);
        assert_eq!(changes.upserts[1].content_hash.as_deref(), Some("h2"));
        assert_eq!(changes.deletes, vec![ExternalId::new("c").unwrap()]);
        // The id-less entry is passed on for validation
        assert_eq!(changes.upserts.len() - ids(&changes.upserts).len(), 1);
    }

    #[test]
    fn test_parents_first_is_stable() {
        let mut child = RawObjectEntry::file("f", "f.txt");
        child.parent_id = Some("d2".into());
        let mut inner = RawObjectEntry::folder("d2", "inner");
        inner.parent_id = Some("d1".into());
        let outer = RawObjectEntry::folder("d1", "outer");
        let mut elsewhere = RawObjectEntry::file("g", "g.txt");
        elsewhere.parent_id = Some("not-in-feed".into());

        let ordered = parents_first(vec![child, inner, elsewhere, outer]);
        assert_eq!(ids(&ordered), vec!["g", "d1", "d2", "f"]);
    }

    #[test]
    fn test_parents_first_survives_cycles() {
        let mut a = RawObjectEntry::folder("a", "a");
        a.parent_id = Some("b".into());
        let mut b = RawObjectEntry::folder("b", "b");
        b.parent_id = Some("a".into());

        assert_eq!(parents_first(vec![a, b]).len(), 2);
    }
}

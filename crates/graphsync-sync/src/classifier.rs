//! Change classification
//!
//! Decides what a listed entry means for the persisted graph by comparing it
//! against records of the same container, first by external id and then by
//! content fingerprint.
//!
//! ## Decision table
//!
//! | External id match | Fingerprint            | Location  | Result            |
//! |-------------------|------------------------|-----------|-------------------|
//! | yes               | equal                  | same      | UNCHANGED         |
//! | yes               | equal                  | different | MOVED_OR_RENAMED  |
//! | yes               | different              | any       | UPDATED           |
//! | yes (file)        | empty                  | any       | UPDATED           |
//! | no                | one unmatched match    | any       | MOVED_OR_RENAMED  |
//! | no                | several                | any       | MOVED_OR_RENAMED* |
//! | no                | none / empty           | any       | NEW               |
//!
//! \* the most recently updated candidate wins, then the smallest id.
//!
//! Records claimed earlier in the pass are invisible to both lookups, so one
//! record is never matched twice.
//!
//! A change feed reports only what changed, so every untouched record would
//! look unmatched. For feeds the fingerprint lookup is limited with
//! [`ChangeClassifier::restrict_moves_to`] to records whose old external id
//! the same feed deletes; any other fingerprint hit is NEW.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use graphsync_core::domain::{ContainerRef, ExternalId, ObjectMeta, Record, RecordId};
use graphsync_core::ports::IGraphSyncStore;
use tracing::{debug, warn};

/// What a listed entry means for its record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    New,
    Updated,
    MovedOrRenamed,
    Unchanged,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::New => "NEW",
            Classification::Updated => "UPDATED",
            Classification::MovedOrRenamed => "MOVED_OR_RENAMED",
            Classification::Unchanged => "UNCHANGED",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified entry with the record state to persist
#[derive(Debug, Clone)]
pub struct Classified {
    pub classification: Classification,
    /// The record after applying the observation
    pub record: Record,
}

/// Per-pass classifier over one container
///
/// Holds the set of records matched so far; create one per pass.
pub struct ChangeClassifier {
    store: Arc<dyn IGraphSyncStore>,
    container: ContainerRef,
    matched: HashSet<RecordId>,
    /// External ids a fingerprint move may come from; `None` allows any
    move_sources: Option<HashSet<ExternalId>>,
}

impl ChangeClassifier {
    pub fn new(store: Arc<dyn IGraphSyncStore>, container: ContainerRef) -> Self {
        Self {
            store,
            container,
            matched: HashSet::new(),
            move_sources: None,
        }
    }

    /// Only records currently under one of `sources` can match by fingerprint
    pub fn restrict_moves_to(&mut self, sources: HashSet<ExternalId>) {
        self.move_sources = Some(sources);
    }

    /// Records matched in this pass so far
    pub fn matched(&self) -> &HashSet<RecordId> {
        &self.matched
    }

    /// Classifies one entry and returns the record to persist
    ///
    /// # Arguments
    /// * `meta` - Validated entry metadata
    /// * `is_file` - File or folder
    /// * `path` - Resolved path of the entry
    /// * `fingerprint` - Content fingerprint, possibly empty
    ///
    /// # Errors
    /// Propagates store lookup failures
    pub async fn classify(
        &mut self,
        meta: &ObjectMeta,
        is_file: bool,
        path: String,
        fingerprint: String,
    ) -> Result<Classified> {
        let by_external_id = self
            .store
            .get_record_by_external_id(&self.container, &meta.external_id)
            .await?
            .filter(|r| !self.matched.contains(r.id()));

        if let Some(mut record) = by_external_id {
            let classification = if fingerprint.is_empty() {
                // No signal: files always refresh, folders only when relocated
                if is_file {
                    Classification::Updated
                } else if record.location_differs(meta, &path) {
                    Classification::MovedOrRenamed
                } else {
                    Classification::Unchanged
                }
            } else if record.external_revision_id() != fingerprint {
                Classification::Updated
            } else if record.location_differs(meta, &path) {
                Classification::MovedOrRenamed
            } else {
                Classification::Unchanged
            };

            if classification != Classification::Unchanged {
                record.apply_observation(meta, path, fingerprint);
            }
            self.matched.insert(*record.id());
            return Ok(Classified {
                classification,
                record,
            });
        }

        if !fingerprint.is_empty() && is_file {
            if let Some(mut record) = self.match_by_fingerprint(meta, &fingerprint).await? {
                debug!(
                    record_id = %record.id(),
                    from = %record.external_id(),
                    to = %meta.external_id,
                    "Matched moved or renamed entry by fingerprint"
                );
                record.apply_observation(meta, path, fingerprint);
                self.matched.insert(*record.id());
                return Ok(Classified {
                    classification: Classification::MovedOrRenamed,
                    record,
                });
            }
        }

        let record = Record::new(&self.container, meta, is_file, path, fingerprint);
        self.matched.insert(*record.id());
        Ok(Classified {
            classification: Classification::New,
            record,
        })
    }

    /// Picks the unmatched file record carrying `fingerprint`, if any
    async fn match_by_fingerprint(
        &self,
        meta: &ObjectMeta,
        fingerprint: &str,
    ) -> Result<Option<Record>> {
        let mut candidates: Vec<Record> = self
            .store
            .get_records_by_fingerprint(&self.container, fingerprint, &self.matched)
            .await?
            .into_iter()
            .filter(|r| r.is_file() && !self.matched.contains(r.id()))
            .filter(|r| {
                self.move_sources
                    .as_ref()
                    .map_or(true, |sources| sources.contains(r.external_id()))
            })
            .collect();

        if candidates.len() > 1 {
            candidates.sort_by(|a, b| {
                b.updated_at()
                    .cmp(&a.updated_at())
                    .then_with(|| a.id().cmp(b.id()))
            });
            warn!(
                container = %self.container,
                external_id = %meta.external_id,
                candidates = candidates.len(),
                chosen = %candidates[0].external_id(),
                "Ambiguous fingerprint match, using most recently updated record"
            );
        }

        Ok(candidates.into_iter().next())
    }
}

//! Record domain entity
//!
//! A Record is the persisted counterpart of one remote object (file or
//! folder). Its internal [`RecordId`] survives renames and moves; the
//! provider-facing fields are refreshed in place and `version` is bumped on
//! every change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entry::ObjectMeta;
use super::newtypes::{ConnectorName, ContainerRef, ExternalId, OrgId, RecordId};

/// A synchronized remote object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Internal identity, stable across moves
    id: RecordId,
    /// Provider id, unique within connector + container
    external_id: ExternalId,
    /// Content fingerprint at last observation
    external_revision_id: String,
    path: String,
    parent_external_id: Option<ExternalId>,
    record_name: String,
    /// Starts at 1, never decreases
    version: u64,
    is_file: bool,
    connector_name: ConnectorName,
    org_id: OrgId,
    container_id: ExternalId,
    mime_type: Option<String>,
    size_bytes: Option<u64>,
    web_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    source_created_at: Option<DateTime<Utc>>,
    source_updated_at: Option<DateTime<Utc>>,
}

impl Record {
    /// Creates a record at version 1 from a first sighting
    pub fn new(
        container: &ContainerRef,
        meta: &ObjectMeta,
        is_file: bool,
        path: String,
        fingerprint: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RecordId::new(),
            external_id: meta.external_id.clone(),
            external_revision_id: fingerprint,
            path,
            parent_external_id: meta.parent_id.clone(),
            record_name: meta.name.clone(),
            version: 1,
            is_file,
            connector_name: container.connector.clone(),
            org_id: container.org_id.clone(),
            container_id: container.container_id.clone(),
            mime_type: meta.mime_type.clone(),
            size_bytes: meta.size,
            web_url: meta.web_url.clone(),
            created_at: now,
            updated_at: now,
            source_created_at: meta.created_at,
            source_updated_at: meta.modified_at,
        }
    }

    /// Applies a new observation of the same object
    ///
    /// Refreshes the external id, fingerprint, location and source metadata
    /// and bumps `version`. Parent and path change together.
    pub fn apply_observation(&mut self, meta: &ObjectMeta, path: String, fingerprint: String) {
        self.external_id = meta.external_id.clone();
        self.external_revision_id = fingerprint;
        self.path = path;
        self.parent_external_id = meta.parent_id.clone();
        self.record_name = meta.name.clone();
        self.mime_type = meta.mime_type.clone().or(self.mime_type.take());
        self.size_bytes = meta.size.or(self.size_bytes);
        self.web_url = meta.web_url.clone().or(self.web_url.take());
        self.source_created_at = meta.created_at.or(self.source_created_at);
        self.source_updated_at = meta.modified_at.or(self.source_updated_at);
        self.version += 1;
        self.updated_at = Utc::now();
    }

    /// Returns true if name, path or parent differ from the observation
    pub fn location_differs(&self, meta: &ObjectMeta, path: &str) -> bool {
        self.record_name != meta.name
            || self.path != path
            || self.parent_external_id != meta.parent_id
    }

    pub fn id(&self) -> &RecordId {
        &self.id
    }

    pub fn external_id(&self) -> &ExternalId {
        &self.external_id
    }

    pub fn external_revision_id(&self) -> &str {
        &self.external_revision_id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn parent_external_id(&self) -> Option<&ExternalId> {
        self.parent_external_id.as_ref()
    }

    pub fn record_name(&self) -> &str {
        &self.record_name
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_file(&self) -> bool {
        self.is_file
    }

    pub fn connector_name(&self) -> &ConnectorName {
        &self.connector_name
    }

    pub fn org_id(&self) -> &OrgId {
        &self.org_id
    }

    pub fn container_id(&self) -> &ExternalId {
        &self.container_id
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    pub fn size_bytes(&self) -> Option<u64> {
        self.size_bytes
    }

    pub fn web_url(&self) -> Option<&str> {
        self.web_url.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn source_created_at(&self) -> Option<DateTime<Utc>> {
        self.source_created_at
    }

    pub fn source_updated_at(&self) -> Option<DateTime<Utc>> {
        self.source_updated_at
    }
}

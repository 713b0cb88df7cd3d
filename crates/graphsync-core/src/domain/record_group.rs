//! RecordGroup domain entity
//!
//! A RecordGroup is the root container (bucket, drive, shared space) that
//! every Record of a sync pass hangs under.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{ConnectorName, ContainerRef, ExternalId, GroupId, OrgId};

/// Descriptive data a lister reports for its container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub name: Option<String>,
    pub owner_id: Option<String>,
    pub web_url: Option<String>,
}

/// A root container of records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordGroup {
    id: GroupId,
    external_group_id: ExternalId,
    org_id: OrgId,
    connector_name: ConnectorName,
    name: String,
    owner_id: Option<String>,
    web_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RecordGroup {
    /// Creates a group for a container; the name defaults to the container id
    pub fn new(container: &ContainerRef, info: ContainerInfo) -> Self {
        let now = Utc::now();
        Self {
            id: GroupId::new(),
            external_group_id: container.container_id.clone(),
            org_id: container.org_id.clone(),
            connector_name: container.connector.clone(),
            name: info
                .name
                .unwrap_or_else(|| container.container_id.to_string()),
            owner_id: info.owner_id,
            web_url: info.web_url,
            created_at: now,
            updated_at: now,
        }
    }

    /// Refreshes descriptive fields from a newer listing
    pub fn refresh(&mut self, info: ContainerInfo) {
        if let Some(name) = info.name {
            self.name = name;
        }
        if info.owner_id.is_some() {
            self.owner_id = info.owner_id;
        }
        if info.web_url.is_some() {
            self.web_url = info.web_url;
        }
        self.updated_at = Utc::now();
    }

    pub fn id(&self) -> &GroupId {
        &self.id
    }

    pub fn external_group_id(&self) -> &ExternalId {
        &self.external_group_id
    }

    pub fn org_id(&self) -> &OrgId {
        &self.org_id
    }

    pub fn connector_name(&self) -> &ConnectorName {
        &self.connector_name
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner_id(&self) -> Option<&str> {
        self.owner_id.as_deref()
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_defaults_to_container_id() {
        let container = ContainerRef::parse("acme", "s3", "bucket-a").unwrap();
        let group = RecordGroup::new(&container, ContainerInfo::default());
        assert_eq!(group.name(), "bucket-a");
        assert_eq!(group.external_group_id().as_str(), "bucket-a");
    }

    #[test]
    fn test_refresh_keeps_unknown_fields() {
        let container = ContainerRef::parse("acme", "box", "42").unwrap();
        let mut group = RecordGroup::new(
            &container,
            ContainerInfo {
                name: Some("Legal".into()),
                owner_id: Some("u1".into()),
                web_url: None,
            },
        );
        group.refresh(ContainerInfo {
            name: None,
            owner_id: None,
            web_url: Some("https://box.test/42".into()),
        });
        assert_eq!(group.name(), "Legal");
        assert_eq!(group.owner_id(), Some("u1"));
        assert_eq!(group.web_url(), Some("https://box.test/42"));
    }
}

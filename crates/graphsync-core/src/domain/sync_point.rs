//! Sync points: persisted per-scope progress markers
//!
//! Keys follow `{org_id}/{connector}/{data_point_type}/{subkey}`; the value
//! holds the provider cursor and the last-run timestamp in epoch millis.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::{ConnectorName, ContainerRef, OrgId};

/// Data point type used for per-container record cursors
pub const RECORDS_DATA_POINT: &str = "records";

/// Composite key of a sync point
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SyncPointKey {
    org_id: OrgId,
    connector: ConnectorName,
    data_point_type: String,
    subkey: String,
}

impl SyncPointKey {
    /// Builds a key
    ///
    /// # Errors
    /// Returns error if `data_point_type` is empty or contains `/`, or if
    /// `subkey` is empty. The subkey may contain `/`.
    pub fn new(
        org_id: OrgId,
        connector: ConnectorName,
        data_point_type: impl Into<String>,
        subkey: impl Into<String>,
    ) -> Result<Self, DomainError> {
        let data_point_type = data_point_type.into();
        let subkey = subkey.into();
        if data_point_type.is_empty() || data_point_type.contains('/') {
            return Err(DomainError::InvalidSyncPointKey(format!(
                "invalid data point type '{data_point_type}'"
            )));
        }
        if subkey.is_empty() {
            return Err(DomainError::InvalidSyncPointKey(
                "subkey cannot be empty".to_string(),
            ));
        }
        Ok(Self {
            org_id,
            connector,
            data_point_type,
            subkey,
        })
    }

    /// The record cursor key of a container
    pub fn for_container(container: &ContainerRef) -> Self {
        Self {
            org_id: container.org_id.clone(),
            connector: container.connector.clone(),
            data_point_type: RECORDS_DATA_POINT.to_string(),
            subkey: container.container_id.to_string(),
        }
    }

    pub fn org_id(&self) -> &OrgId {
        &self.org_id
    }

    pub fn connector(&self) -> &ConnectorName {
        &self.connector
    }

    pub fn data_point_type(&self) -> &str {
        &self.data_point_type
    }

    pub fn subkey(&self) -> &str {
        &self.subkey
    }
}

impl fmt::Display for SyncPointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.org_id, self.connector, self.data_point_type, self.subkey
        )
    }
}

impl FromStr for SyncPointKey {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(4, '/');
        let (Some(org), Some(connector), Some(kind), Some(subkey)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(DomainError::InvalidSyncPointKey(format!(
                "expected 4 segments: {s}"
            )));
        };
        Self::new(
            OrgId::new(org)?,
            ConnectorName::new(connector)?,
            kind,
            subkey,
        )
    }
}

impl TryFrom<String> for SyncPointKey {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<SyncPointKey> for String {
    fn from(key: SyncPointKey) -> Self {
        key.to_string()
    }
}

/// Value stored under a sync point key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPoint {
    /// Provider cursor; empty when the provider has no change feed
    pub cursor: String,
    /// Epoch milliseconds of the last successful run
    pub last_run_ts: i64,
}

impl SyncPoint {
    pub fn new(cursor: impl Into<String>, last_run_ts: i64) -> Self {
        Self {
            cursor: cursor.into(),
            last_run_ts,
        }
    }

    /// The cursor, unless empty
    pub fn cursor(&self) -> Option<&str> {
        if self.cursor.is_empty() {
            None
        } else {
            Some(&self.cursor)
        }
    }
}

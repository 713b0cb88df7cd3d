//! Listed object entries
//!
//! Listers hand over [`RawObjectEntry`] values: every field optional, shaped
//! after whatever the provider returned. The engine validates each one into
//! an [`ExternalObjectEntry`] before it touches persisted state, so a
//! malformed entry is skipped instead of corrupting the graph.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::ExternalId;
use super::permission::{AclEntry, EntityType, LinkVisibility, Principal};

// ============================================================================
// Raw (provider-shaped) entries
// ============================================================================

/// A timestamp as providers report it: epoch milliseconds or ISO 8601
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    EpochMillis(i64),
    Iso(String),
}

impl RawTimestamp {
    /// Parses into a UTC timestamp
    ///
    /// # Errors
    /// Returns `InvalidTimestamp` for out-of-range millis or unparseable strings
    pub fn parse(&self) -> Result<DateTime<Utc>, DomainError> {
        match self {
            RawTimestamp::EpochMillis(ms) => Utc
                .timestamp_millis_opt(*ms)
                .single()
                .ok_or_else(|| DomainError::InvalidTimestamp(ms.to_string())),
            RawTimestamp::Iso(s) => {
                if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                    return Ok(dt.with_timezone(&Utc));
                }
                // Some providers send digits as strings
                if let Ok(ms) = s.trim().parse::<i64>() {
                    return RawTimestamp::EpochMillis(ms).parse();
                }
                chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                    .map(|naive| naive.and_utc())
                    .map_err(|_| DomainError::InvalidTimestamp(s.clone()))
            }
        }
    }
}

/// Owner or actor reference in a raw entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawPrincipal {
    pub id: Option<String>,
    pub email: Option<String>,
}

/// An explicit ACL entry in a raw entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawAclEntry {
    pub grantee_id: Option<String>,
    pub email: Option<String>,
    #[serde(alias = "type")]
    pub grantee_type: Option<String>,
    pub role: Option<String>,
}

/// An object as reported by a lister, before validation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawObjectEntry {
    pub id: Option<String>,
    pub name: Option<String>,
    /// `file`, `folder` (or `directory`); missing means file
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// Explicit delete event from a change feed
    pub deleted: bool,
    pub size: Option<u64>,
    pub created_at: Option<RawTimestamp>,
    pub modified_at: Option<RawTimestamp>,
    pub content_hash: Option<String>,
    pub etag: Option<String>,
    pub parent_id: Option<String>,
    pub path: Option<String>,
    pub mime_type: Option<String>,
    pub web_url: Option<String>,
    pub owner: Option<RawPrincipal>,
    pub acl: Vec<RawAclEntry>,
    pub link_visibility: Option<String>,
}

impl RawObjectEntry {
    /// Minimal file entry, handy for listers and tests
    pub fn file(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            name: Some(name.into()),
            kind: Some("file".to_string()),
            ..Default::default()
        }
    }

    /// Minimal folder entry
    pub fn folder(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            name: Some(name.into()),
            kind: Some("folder".to_string()),
            ..Default::default()
        }
    }

    /// Explicit delete event
    pub fn deletion(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            deleted: true,
            ..Default::default()
        }
    }
}

// ============================================================================
// Validated entries
// ============================================================================

/// Validated metadata shared by files and folders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub external_id: ExternalId,
    pub name: String,
    pub parent_id: Option<ExternalId>,
    /// Provider-reported full path, if any
    pub path: Option<String>,
    pub size: Option<u64>,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    pub content_hash: Option<String>,
    pub etag: Option<String>,
    pub mime_type: Option<String>,
    pub web_url: Option<String>,
    pub owner: Option<Principal>,
    pub acl: Vec<AclEntry>,
    pub visibility: LinkVisibility,
}

/// A listed object after ingestion-boundary validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalObjectEntry {
    File(ObjectMeta),
    Folder(ObjectMeta),
    Deleted { external_id: ExternalId },
}

impl ExternalObjectEntry {
    pub fn external_id(&self) -> &ExternalId {
        match self {
            ExternalObjectEntry::File(meta) | ExternalObjectEntry::Folder(meta) => {
                &meta.external_id
            }
            ExternalObjectEntry::Deleted { external_id } => external_id,
        }
    }

    pub fn meta(&self) -> Option<&ObjectMeta> {
        match self {
            ExternalObjectEntry::File(meta) | ExternalObjectEntry::Folder(meta) => Some(meta),
            ExternalObjectEntry::Deleted { .. } => None,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, ExternalObjectEntry::File(_))
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, ExternalObjectEntry::Folder(_))
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn parse_timestamp(field: &str, raw: Option<RawTimestamp>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    match raw.parse() {
        Ok(dt) => Some(dt),
        Err(e) => {
            tracing::warn!(field, error = %e, "Ignoring unparseable timestamp");
            None
        }
    }
}

fn convert_acl(raw: RawAclEntry) -> Result<AclEntry, DomainError> {
    let grantee_id = non_empty(raw.grantee_id)
        .or_else(|| non_empty(raw.email.clone()))
        .ok_or_else(|| DomainError::InvalidEntry("ACL entry without grantee".to_string()))?;
    let grantee_type = match raw.grantee_type.as_deref() {
        None => EntityType::User,
        Some(t) => EntityType::from_grantee_type(t).ok_or_else(|| {
            DomainError::InvalidEntry(format!("Unknown grantee type '{t}' for {grantee_id}"))
        })?,
    };
    let role = non_empty(raw.role).ok_or_else(|| {
        DomainError::InvalidEntry(format!("ACL entry for {grantee_id} has no role"))
    })?;

    Ok(AclEntry {
        grantee_id,
        email: non_empty(raw.email),
        grantee_type,
        role,
    })
}

impl TryFrom<RawObjectEntry> for ExternalObjectEntry {
    type Error = DomainError;

    fn try_from(raw: RawObjectEntry) -> Result<Self, Self::Error> {
        let id = non_empty(raw.id)
            .ok_or_else(|| DomainError::InvalidEntry("entry has no id".to_string()))?;
        let external_id = ExternalId::new(id)?;

        if raw.deleted {
            return Ok(ExternalObjectEntry::Deleted { external_id });
        }

        let path = non_empty(raw.path);
        let name = non_empty(raw.name)
            .or_else(|| {
                path.as_deref()
                    .and_then(|p| p.trim_end_matches('/').rsplit('/').next())
                    .filter(|segment| !segment.is_empty())
                    .map(str::to_string)
            })
            .ok_or_else(|| {
                DomainError::InvalidEntry(format!("entry {external_id} has no name"))
            })?;

        let is_folder = match raw.kind.as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("file") | Some("object") | Some("blob") => false,
            Some("folder") | Some("directory") | Some("dir") | Some("prefix") => true,
            Some(other) => {
                return Err(DomainError::InvalidEntry(format!(
                    "entry {external_id} has unknown type '{other}'"
                )))
            }
        };

        let parent_id = match non_empty(raw.parent_id) {
            Some(p) => Some(ExternalId::new(p)?),
            None => None,
        };

        let owner = raw.owner.and_then(|o| {
            let email = non_empty(o.email);
            non_empty(o.id)
                .or_else(|| email.clone())
                .map(|id| Principal::new(id, email))
        });

        let acl = raw
            .acl
            .into_iter()
            .filter_map(|entry| match convert_acl(entry) {
                Ok(acl) => Some(acl),
                Err(e) => {
                    tracing::warn!(external_id = %external_id, error = %e, "Ignoring malformed ACL entry");
                    None
                }
            })
            .collect();

        let meta = ObjectMeta {
            external_id,
            name,
            parent_id,
            path,
            size: raw.size,
            created_at: parse_timestamp("created_at", raw.created_at),
            modified_at: parse_timestamp("modified_at", raw.modified_at),
            content_hash: non_empty(raw.content_hash),
            etag: non_empty(raw.etag),
            mime_type: non_empty(raw.mime_type),
            web_url: non_empty(raw.web_url),
            owner,
            acl,
            visibility: raw
                .link_visibility
                .as_deref()
                .map(LinkVisibility::parse_lenient)
                .unwrap_or_default(),
        };

        Ok(if is_folder {
            ExternalObjectEntry::Folder(meta)
        } else {
            ExternalObjectEntry::File(meta)
        })
    }
}

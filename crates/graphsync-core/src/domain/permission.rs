//! Permission types and the canonical ACL resolver
//!
//! Providers expose access in different shapes: explicit ACL entries with
//! provider-specific role names, an owner reference, and link-sharing
//! visibility. [`PermissionResolver`] merges all of them into one
//! de-duplicated list of [`Permission`] edges keyed by grantee id.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::newtypes::OrgId;

// ============================================================================
// Roles and entity types
// ============================================================================

/// Canonical access role
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermissionRole {
    Read,
    Write,
    Owner,
}

impl PermissionRole {
    /// Stable name used for persistence
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionRole::Read => "READ",
            PermissionRole::Write => "WRITE",
            PermissionRole::Owner => "OWNER",
        }
    }

    /// Parses a persisted role name
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "READ" => Some(PermissionRole::Read),
            "WRITE" => Some(PermissionRole::Write),
            "OWNER" => Some(PermissionRole::Owner),
            _ => None,
        }
    }
}

impl fmt::Display for PermissionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of principal a permission is granted to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    User,
    Group,
    Org,
    Public,
}

impl EntityType {
    /// Stable name used for persistence
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::User => "USER",
            EntityType::Group => "GROUP",
            EntityType::Org => "ORG",
            EntityType::Public => "PUBLIC",
        }
    }

    /// Parses a persisted entity type name
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "USER" => Some(EntityType::User),
            "GROUP" => Some(EntityType::Group),
            "ORG" => Some(EntityType::Org),
            "PUBLIC" => Some(EntityType::Public),
            _ => None,
        }
    }

    /// Maps a provider grantee type (`user`, `group`, `domain`, `anyone`, ...)
    pub fn from_grantee_type(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" | "person" | "member" => Some(EntityType::User),
            "group" | "team" => Some(EntityType::Group),
            "domain" | "org" | "organization" | "enterprise" | "company" => Some(EntityType::Org),
            "anyone" | "public" | "everyone" => Some(EntityType::Public),
            _ => None,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Link-sharing visibility of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkVisibility {
    #[default]
    Private,
    OrgWide,
    Public,
}

impl LinkVisibility {
    /// Maps a provider visibility string; unknown values are treated as private
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "org_wide" | "org" | "domain" | "company" | "organization" => LinkVisibility::OrgWide,
            "public" | "anyone" | "open" => LinkVisibility::Public,
            _ => LinkVisibility::Private,
        }
    }
}

// ============================================================================
// Inputs and outputs
// ============================================================================

/// A resolved permission edge between a grantee and a record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission {
    pub grantee_id: String,
    pub email: Option<String>,
    pub role: PermissionRole,
    pub entity_type: EntityType,
}

impl Permission {
    pub fn new(
        grantee_id: impl Into<String>,
        email: Option<String>,
        role: PermissionRole,
        entity_type: EntityType,
    ) -> Self {
        Self {
            grantee_id: grantee_id.into(),
            email,
            role,
            entity_type,
        }
    }
}

/// A user or service identity known to a provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub email: Option<String>,
}

impl Principal {
    pub fn new(id: impl Into<String>, email: Option<String>) -> Self {
        Self {
            id: id.into(),
            email,
        }
    }
}

/// An explicit ACL entry as reported by a provider
///
/// `role` is the provider's own role name; it is translated through the
/// connector's [`RoleTable`] during resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    pub grantee_id: String,
    pub email: Option<String>,
    pub grantee_type: EntityType,
    pub role: String,
}

// ============================================================================
// Role table
// ============================================================================

/// Case-insensitive mapping from provider role names to canonical roles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleTable {
    roles: HashMap<String, PermissionRole>,
}

impl RoleTable {
    /// An empty table; every lookup misses
    pub fn empty() -> Self {
        Self {
            roles: HashMap::new(),
        }
    }

    /// Adds or replaces a mapping
    #[must_use]
    pub fn with_role(mut self, provider_role: &str, role: PermissionRole) -> Self {
        self.roles.insert(provider_role.to_ascii_lowercase(), role);
        self
    }

    /// Looks up a provider role name
    pub fn lookup(&self, provider_role: &str) -> Option<PermissionRole> {
        self.roles
            .get(&provider_role.trim().to_ascii_lowercase())
            .copied()
    }
}

impl Default for RoleTable {
    fn default() -> Self {
        const OWNER: &[&str] = &["owner", "co-owner", "organizer"];
        const WRITE: &[&str] = &[
            "editor",
            "writer",
            "fileorganizer",
            "uploader",
            "co-editor",
        ];
        const READ: &[&str] = &[
            "viewer",
            "reader",
            "commenter",
            "previewer",
            "viewer-uploader",
            "previewer-uploader",
        ];

        let mut table = Self::empty();
        for name in OWNER {
            table = table.with_role(name, PermissionRole::Owner);
        }
        for name in WRITE {
            table = table.with_role(name, PermissionRole::Write);
        }
        for name in READ {
            table = table.with_role(name, PermissionRole::Read);
        }
        table
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// Grantee id used for org-wide link sharing
pub fn org_grantee_id(org_id: &OrgId) -> String {
    format!("ORG_{org_id}")
}

/// Grantee id used for public link sharing
pub const PUBLIC_GRANTEE_ID: &str = "PUBLIC";

/// All permission sources for a single object
#[derive(Debug, Clone, Copy)]
pub struct PermissionSources<'a> {
    pub acl: &'a [AclEntry],
    pub owner: Option<&'a Principal>,
    pub visibility: LinkVisibility,
    pub actor: Option<&'a Principal>,
}

/// Merges ACL, owner, link-sharing and actor into canonical permissions
///
/// Precedence is explicit ACL, then owner, then link sharing, then the
/// current actor. Injected grants never overwrite a grantee that a
/// higher-precedence source already placed. Within the explicit ACL the
/// last entry for a grantee wins.
#[derive(Debug, Clone)]
pub struct PermissionResolver {
    org_id: OrgId,
    role_table: RoleTable,
}

impl PermissionResolver {
    pub fn new(org_id: OrgId, role_table: RoleTable) -> Self {
        Self { org_id, role_table }
    }

    pub fn role_table(&self) -> &RoleTable {
        &self.role_table
    }

    /// Resolves a canonical permission list, sorted by grantee id
    pub fn resolve(&self, sources: PermissionSources<'_>) -> Vec<Permission> {
        let mut resolved: BTreeMap<String, Permission> = BTreeMap::new();

        for entry in sources.acl {
            let role = match self.role_table.lookup(&entry.role) {
                Some(role) => role,
                None => {
                    tracing::warn!(
                        grantee = %entry.grantee_id,
                        role = %entry.role,
                        "Unknown provider role, granting READ"
                    );
                    PermissionRole::Read
                }
            };
            resolved.insert(
                entry.grantee_id.clone(),
                Permission::new(
                    entry.grantee_id.clone(),
                    entry.email.clone(),
                    role,
                    entry.grantee_type,
                ),
            );
        }

        if let Some(owner) = sources.owner {
            resolved.entry(owner.id.clone()).or_insert_with(|| {
                Permission::new(
                    owner.id.clone(),
                    owner.email.clone(),
                    PermissionRole::Owner,
                    EntityType::User,
                )
            });
        }

        match sources.visibility {
            LinkVisibility::Private => {}
            LinkVisibility::OrgWide => {
                let grantee = org_grantee_id(&self.org_id);
                resolved.entry(grantee.clone()).or_insert_with(|| {
                    Permission::new(grantee, None, PermissionRole::Read, EntityType::Group)
                });
            }
            LinkVisibility::Public => {
                resolved
                    .entry(PUBLIC_GRANTEE_ID.to_string())
                    .or_insert_with(|| {
                        Permission::new(
                            PUBLIC_GRANTEE_ID,
                            None,
                            PermissionRole::Read,
                            EntityType::Group,
                        )
                    });
            }
        }

        // NOTE: the actor is whoever the connector authenticates as. Granting
        // it READ may over-grant for service accounts.
        if let Some(actor) = sources.actor {
            resolved.entry(actor.id.clone()).or_insert_with(|| {
                Permission::new(
                    actor.id.clone(),
                    actor.email.clone(),
                    PermissionRole::Read,
                    EntityType::User,
                )
            });
        }

        resolved.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> PermissionResolver {
        PermissionResolver::new(OrgId::new("acme").unwrap(), RoleTable::default())
    }

    fn acl(grantee: &str, role: &str) -> AclEntry {
        AclEntry {
            grantee_id: grantee.to_string(),
            email: Some(format!("{grantee}@acme.test")),
            grantee_type: EntityType::User,
            role: role.to_string(),
        }
    }

    fn find<'a>(perms: &'a [Permission], grantee: &str) -> &'a Permission {
        perms
            .iter()
            .find(|p| p.grantee_id == grantee)
            .unwrap_or_else(|| panic!("missing grantee {grantee}"))
    }

    #[test]
    fn test_role_table_defaults() {
        let table = RoleTable::default();
        assert_eq!(table.lookup("Editor"), Some(PermissionRole::Write));
        assert_eq!(table.lookup("viewer"), Some(PermissionRole::Read));
        assert_eq!(table.lookup("OWNER"), Some(PermissionRole::Owner));
        assert_eq!(table.lookup("fileOrganizer"), Some(PermissionRole::Write));
        assert_eq!(table.lookup("auditor"), None);
    }

    #[test]
    fn test_editor_owner_and_org_link() {
        let owner = Principal::new("owner", Some("owner@acme.test".into()));
        let entries = vec![acl("collab", "editor")];

        let perms = resolver().resolve(PermissionSources {
            acl: &entries,
            owner: Some(&owner),
            visibility: LinkVisibility::OrgWide,
            actor: Some(&owner),
        });

        assert_eq!(perms.len(), 3);
        assert_eq!(find(&perms, "owner").role, PermissionRole::Owner);
        assert_eq!(find(&perms, "collab").role, PermissionRole::Write);
        let org = find(&perms, "ORG_acme");
        assert_eq!(org.role, PermissionRole::Read);
        assert_eq!(org.entity_type, EntityType::Group);
    }

    #[test]
    fn test_explicit_acl_beats_owner_injection() {
        let owner = Principal::new("alice", None);
        let entries = vec![acl("alice", "viewer")];

        let perms = resolver().resolve(PermissionSources {
            acl: &entries,
            owner: Some(&owner),
            visibility: LinkVisibility::Private,
            actor: None,
        });

        assert_eq!(perms.len(), 1);
        assert_eq!(perms[0].role, PermissionRole::Read);
    }

    #[test]
    fn test_last_acl_entry_wins_for_duplicate_grantee() {
        let entries = vec![acl("bob", "viewer"), acl("bob", "editor")];
        let perms = resolver().resolve(PermissionSources {
            acl: &entries,
            owner: None,
            visibility: LinkVisibility::Private,
            actor: None,
        });
        assert_eq!(perms.len(), 1);
        assert_eq!(perms[0].role, PermissionRole::Write);
    }

    #[test]
    fn test_public_link_and_actor_injection() {
        let actor = Principal::new("svc", Some("svc@acme.test".into()));
        let perms = resolver().resolve(PermissionSources {
            acl: &[],
            owner: None,
            visibility: LinkVisibility::Public,
            actor: Some(&actor),
        });

        assert_eq!(perms.len(), 2);
        let public = find(&perms, PUBLIC_GRANTEE_ID);
        assert_eq!(public.role, PermissionRole::Read);
        assert_eq!(public.entity_type, EntityType::Group);
        let svc = find(&perms, "svc");
        assert_eq!(svc.role, PermissionRole::Read);
        assert_eq!(svc.entity_type, EntityType::User);
    }

    #[test]
    fn test_unknown_role_maps_to_read() {
        let entries = vec![acl("carol", "auditor")];
        let perms = resolver().resolve(PermissionSources {
            acl: &entries,
            owner: None,
            visibility: LinkVisibility::Private,
            actor: None,
        });
        assert_eq!(perms[0].role, PermissionRole::Read);
    }

    #[test]
    fn test_output_sorted_by_grantee() {
        let entries = vec![acl("zed", "viewer"), acl("amy", "editor")];
        let owner = Principal::new("mike", None);
        let perms = resolver().resolve(PermissionSources {
            acl: &entries,
            owner: Some(&owner),
            visibility: LinkVisibility::Private,
            actor: None,
        });
        let ids: Vec<_> = perms.iter().map(|p| p.grantee_id.as_str()).collect();
        assert_eq!(ids, vec!["amy", "mike", "zed"]);
    }

    #[test]
    fn test_visibility_parsing() {
        assert_eq!(LinkVisibility::parse_lenient("org-wide"), LinkVisibility::OrgWide);
        assert_eq!(LinkVisibility::parse_lenient("company"), LinkVisibility::OrgWide);
        assert_eq!(LinkVisibility::parse_lenient("open"), LinkVisibility::Public);
        assert_eq!(LinkVisibility::parse_lenient("collaborators"), LinkVisibility::Private);
    }

    #[test]
    fn test_entity_type_from_grantee_type() {
        assert_eq!(EntityType::from_grantee_type("domain"), Some(EntityType::Org));
        assert_eq!(EntityType::from_grantee_type("anyone"), Some(EntityType::Public));
        assert_eq!(EntityType::from_grantee_type("Group"), Some(EntityType::Group));
        assert_eq!(EntityType::from_grantee_type("robot"), None);
    }
}

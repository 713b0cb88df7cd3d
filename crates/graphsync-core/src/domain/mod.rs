//! Domain entities and business logic
//!
//! This module contains the core domain types for GraphSync:
//! - Newtypes for type-safe identifiers and validated domain types
//! - Records, record groups and their permissions
//! - Listed entries and their validation into tagged variants
//! - Fingerprint and permission resolution
//! - Sync points and pass tracking
//! - Domain-specific error types

pub mod entry;
pub mod errors;
pub mod fingerprint;
pub mod newtypes;
pub mod pass;
pub mod permission;
pub mod record;
pub mod record_group;
pub mod sync_point;

// Re-export commonly used types
pub use entry::{
    ExternalObjectEntry, ObjectMeta, RawAclEntry, RawObjectEntry, RawPrincipal, RawTimestamp,
};
pub use errors::DomainError;
pub use fingerprint::{FingerprintResolver, FingerprintSource};
pub use newtypes::*;
pub use pass::{PassCounters, PassKind, PassStatus, SyncPass};
pub use permission::{
    AclEntry, EntityType, LinkVisibility, Permission, PermissionResolver, PermissionRole,
    PermissionSources, Principal, RoleTable,
};
pub use record::Record;
pub use record_group::{ContainerInfo, RecordGroup};
pub use sync_point::{SyncPoint, SyncPointKey};

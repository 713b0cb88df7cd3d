//! Object lister port (driven/secondary port)
//!
//! This module defines the contract every provider-specific lister must
//! satisfy for the reconciliation engine to crawl it: paginated child
//! listings, an optional change feed, an identity probe, and the
//! connector's fingerprint and role conventions.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because errors at port boundaries are adapter-specific.
//!   Adapters that can classify failures wrap a [`ProviderError`] so the retry
//!   layer can tell transient from permanent failures by downcasting.
//! - Entries cross the port as [`RawObjectEntry`]; validation happens in the engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::entry::{ObjectMeta, RawObjectEntry};
use crate::domain::fingerprint::FingerprintResolver;
use crate::domain::newtypes::{ConnectorName, ContainerRef, ExternalId};
use crate::domain::permission::{AclEntry, Principal, RoleTable};
use crate::domain::record_group::ContainerInfo;

// ============================================================================
// Provider errors
// ============================================================================

/// Classified provider failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Network failure, timeout or 5xx
    #[error("Transient provider error: {0}")]
    Transient(String),

    /// Throttled by the provider
    #[error("Rate limited by provider (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// The object vanished between listing and lookup
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Access was revoked or never granted
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Missing credentials or an invalid container
    #[error("Provider configuration error: {0}")]
    Configuration(String),

    /// Any other non-retryable failure
    #[error("Permanent provider error: {0}")]
    Permanent(String),
}

impl ProviderError {
    /// Returns true for failures worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Transient(_) | ProviderError::RateLimited { .. }
        )
    }

    /// Server-requested delay, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

// ============================================================================
// Listing DTOs
// ============================================================================

/// One page of a child listing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingPage {
    pub entries: Vec<RawObjectEntry>,
    /// Token for the next page; `None` on the last page
    pub next_page_token: Option<String>,
    /// Total children under the parent, when the provider reports it
    pub total_count: Option<u64>,
}

/// One page of a provider change feed
///
/// Mirrors the next-link / delta-link convention: while `next_link` is set
/// more pages follow; the final page carries `delta_link`, the cursor to
/// resume from next time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangePage {
    pub entries: Vec<RawObjectEntry>,
    pub next_link: Option<String>,
    pub delta_link: Option<String>,
}

// ============================================================================
// IObjectLister trait
// ============================================================================

/// Port trait for crawling a provider's containers
///
/// Implementations must be `Send + Sync` so one lister can serve every
/// container task of a connector.
#[async_trait::async_trait]
pub trait IObjectLister: Send + Sync {
    /// Name of the connector this lister serves
    fn connector_name(&self) -> &ConnectorName;

    /// Lists the children of `parent` (or of the container root when `None`)
    ///
    /// # Arguments
    /// * `container` - Container being crawled
    /// * `parent` - Folder to list, `None` for the root
    /// * `page_token` - Token from the previous page, `None` for the first page
    async fn list_children(
        &self,
        container: &ContainerRef,
        parent: Option<&ExternalId>,
        page_token: Option<&str>,
    ) -> anyhow::Result<ListingPage>;

    /// Fetches one page of the change feed starting at `cursor`
    ///
    /// A `None` cursor enumerates from the beginning. Returns `Ok(None)` when
    /// the provider has no change feed; the engine then re-lists instead.
    async fn fetch_changes(
        &self,
        _container: &ContainerRef,
        _cursor: Option<&str>,
    ) -> anyhow::Result<Option<ChangePage>> {
        Ok(None)
    }

    /// Returns the current change-feed cursor without enumerating
    ///
    /// Used after a full pass so a following incremental pass starts from
    /// the present. `Ok(None)` when there is no change feed.
    async fn current_cursor(&self, _container: &ContainerRef) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    /// Fetches the ACL of an entry when the listing does not inline it
    ///
    /// `Ok(None)` means "use the inline ACL".
    async fn fetch_acl(
        &self,
        _container: &ContainerRef,
        _entry: &ObjectMeta,
    ) -> anyhow::Result<Option<Vec<AclEntry>>> {
        Ok(None)
    }

    /// Describes the container for its RecordGroup
    async fn describe_container(&self, _container: &ContainerRef) -> anyhow::Result<ContainerInfo> {
        Ok(ContainerInfo::default())
    }

    /// Identity the connector authenticates as
    ///
    /// Doubles as the cheap read-only connection probe.
    async fn whoami(&self) -> anyhow::Result<Principal>;

    /// Content fingerprint of an entry
    fn fingerprint(&self, meta: &ObjectMeta) -> String {
        FingerprintResolver::for_meta(meta)
    }

    /// Mapping from this provider's role names to canonical roles
    fn role_table(&self) -> RoleTable {
        RoleTable::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::Transient("timeout".into()).is_transient());
        assert!(ProviderError::RateLimited { retry_after: None }.is_transient());
        assert!(!ProviderError::NotFound("x".into()).is_transient());
        assert!(!ProviderError::AccessDenied("x".into()).is_transient());
        assert!(!ProviderError::Configuration("x".into()).is_transient());
    }

    #[test]
    fn test_retry_after() {
        let err = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(ProviderError::Transient("x".into()).retry_after(), None);
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = ProviderError::NotFound("f1".into()).into();
        let err = err.context("listing children");
        assert_eq!(
            err.downcast_ref::<ProviderError>(),
            Some(&ProviderError::NotFound("f1".into()))
        );
    }
}

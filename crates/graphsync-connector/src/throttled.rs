//! Throttling decorator for listers
//!
//! [`ThrottledLister`] wraps any [`IObjectLister`] so that every outbound
//! call first takes a token from the connection's bucket, transient failures
//! are retried with backoff, and throttle responses shrink the bucket.

use std::sync::Arc;

use anyhow::Result;
use graphsync_core::domain::{
    AclEntry, ConnectorName, ContainerInfo, ContainerRef, ExternalId, ObjectMeta, Principal,
    RoleTable,
};
use graphsync_core::ports::{ChangePage, IObjectLister, ListingPage};

use crate::rate_limit::AdaptiveRateLimiter;
use crate::retry::{is_throttle_error, with_retry_observed, RetryPolicy};

/// An [`IObjectLister`] that paces and retries the calls of another
pub struct ThrottledLister<L: IObjectLister + ?Sized> {
    inner: Arc<L>,
    limiter: Arc<AdaptiveRateLimiter>,
    policy: RetryPolicy,
    /// Bucket key; one bucket per provider connection
    connection: String,
}

impl<L: IObjectLister + ?Sized> ThrottledLister<L> {
    /// Wraps `inner`, keying its bucket by the connector name
    pub fn new(inner: Arc<L>, limiter: Arc<AdaptiveRateLimiter>, policy: RetryPolicy) -> Self {
        let connection = inner.connector_name().to_string();
        Self {
            inner,
            limiter,
            policy,
            connection,
        }
    }

    /// Uses a custom bucket key, for several connections of one connector
    pub fn with_connection_key(mut self, key: impl Into<String>) -> Self {
        self.connection = key.into();
        self
    }

    /// Bucket key of this lister
    pub fn connection(&self) -> &str {
        &self.connection
    }

    /// Runs one provider call under the limiter and retry policy
    async fn call<T, F, Fut>(&self, operation: &str, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let connection = self.connection.as_str();
        let limiter = &self.limiter;
        let f = &f;
        let result = with_retry_observed(
            operation,
            self.policy,
            |err| {
                if is_throttle_error(err) {
                    limiter.on_throttle(connection);
                }
            },
            move || async move {
                let _guard = limiter.acquire(connection).await;
                f().await
            },
        )
        .await;

        if result.is_ok() {
            limiter.on_success(connection);
        }
        result
    }
}

#[async_trait::async_trait]
impl<L: IObjectLister + ?Sized> IObjectLister for ThrottledLister<L> {
    fn connector_name(&self) -> &ConnectorName {
        self.inner.connector_name()
    }

    async fn list_children(
        &self,
        container: &ContainerRef,
        parent: Option<&ExternalId>,
        page_token: Option<&str>,
    ) -> Result<ListingPage> {
        self.call("list_children", || async move {
            self.inner.list_children(container, parent, page_token).await
        })
        .await
    }

    async fn fetch_changes(
        &self,
        container: &ContainerRef,
        cursor: Option<&str>,
    ) -> Result<Option<ChangePage>> {
        self.call("fetch_changes", || async move {
            self.inner.fetch_changes(container, cursor).await
        })
        .await
    }

    async fn current_cursor(&self, container: &ContainerRef) -> Result<Option<String>> {
        self.call("current_cursor", || async move {
            self.inner.current_cursor(container).await
        })
        .await
    }

    async fn fetch_acl(
        &self,
        container: &ContainerRef,
        entry: &ObjectMeta,
    ) -> Result<Option<Vec<AclEntry>>> {
        self.call("fetch_acl", || async move {
            self.inner.fetch_acl(container, entry).await
        })
        .await
    }

    async fn describe_container(&self, container: &ContainerRef) -> Result<ContainerInfo> {
        self.call("describe_container", || async move {
            self.inner.describe_container(container).await
        })
        .await
    }

    async fn whoami(&self) -> Result<Principal> {
        self.call("whoami", || async move { self.inner.whoami().await })
            .await
    }

    fn fingerprint(&self, meta: &ObjectMeta) -> String {
        self.inner.fingerprint(meta)
    }

    fn role_table(&self) -> RoleTable {
        self.inner.role_table()
    }
}

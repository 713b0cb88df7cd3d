//! GraphSync Connector - Provider-boundary plumbing
//!
//! Everything that sits between the reconciliation engine and a provider API:
//!
//! - [`rate_limit`] - Adaptive token buckets, one per provider connection
//! - [`retry`] - Exponential backoff for transient provider failures
//! - [`throttled`] - An `IObjectLister` decorator applying both of the above
//! - [`local`] - A lister exposing a local directory tree as a container
//!
//! ## Architecture
//!
//! Listers implement the `IObjectLister` port from `graphsync-core`. Concrete
//! provider SDK wrappers live outside this workspace; they plug in by
//! implementing the port and are wrapped in [`ThrottledLister`] so every
//! outbound call is paced and retried the same way.

pub mod local;
pub mod rate_limit;
pub mod retry;
pub mod throttled;

pub use local::{LocalDirectoryLister, LOCAL_CONNECTOR};
pub use rate_limit::{AdaptiveRateLimiter, RateLimitConfig, RateLimitGuard};
pub use retry::{is_throttle_error, is_transient_error, with_retry, with_retry_observed, RetryPolicy};
pub use throttled::ThrottledLister;

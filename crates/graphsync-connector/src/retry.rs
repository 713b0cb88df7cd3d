//! Exponential backoff for provider calls
//!
//! Only transient failures are retried. A failure is transient when it wraps
//! a [`ProviderError`] that says so, or, for adapters that do not classify
//! their errors, when its message looks like a network, throttling or
//! server-side failure.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use graphsync_core::config::RateLimitingConfig;
use graphsync_core::ports::ProviderError;
use tracing::{info, warn};

/// Retry settings for provider calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubled on each following one
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    /// Backoff schedule: 1s, 2s, 4s, 8s, 16s
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl From<&RateLimitingConfig> for RetryPolicy {
    fn from(config: &RateLimitingConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
        }
    }

    /// Backoff before retry number `attempt + 1`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
    }
}

/// Determines if an error is transient and should be retried
pub fn is_transient_error(err: &anyhow::Error) -> bool {
    if let Some(provider) = err.downcast_ref::<ProviderError>() {
        return provider.is_transient();
    }

    let err_str = format!("{err:#}").to_lowercase();

    // Network errors
    if err_str.contains("network")
        || err_str.contains("connection")
        || err_str.contains("timeout")
        || err_str.contains("timed out")
        || err_str.contains("dns")
        || err_str.contains("reset by peer")
        || err_str.contains("broken pipe")
    {
        return true;
    }

    // Rate limiting
    if err_str.contains("429")
        || err_str.contains("too many requests")
        || err_str.contains("rate limit")
        || err_str.contains("throttl")
    {
        return true;
    }

    // Server errors (5xx)
    err_str.contains("500")
        || err_str.contains("502")
        || err_str.contains("503")
        || err_str.contains("504")
        || err_str.contains("server error")
}

/// Returns true when the error reports provider throttling
pub fn is_throttle_error(err: &anyhow::Error) -> bool {
    if let Some(provider) = err.downcast_ref::<ProviderError>() {
        return matches!(provider, ProviderError::RateLimited { .. });
    }
    let err_str = format!("{err:#}").to_lowercase();
    err_str.contains("429") || err_str.contains("too many requests")
}

/// Server-requested delay carried by the error, if any
fn retry_after(err: &anyhow::Error) -> Option<Duration> {
    err.downcast_ref::<ProviderError>()
        .and_then(ProviderError::retry_after)
}

/// Executes an async operation with exponential backoff retry
///
/// Non-transient errors are returned immediately. A provider-supplied
/// retry-after delay replaces the computed backoff for that attempt.
/// `on_error` sees every failed attempt, retried or not.
pub async fn with_retry_observed<F, Fut, T, E>(
    operation_name: &str,
    policy: RetryPolicy,
    mut on_error: E,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    E: FnMut(&anyhow::Error),
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(
                        operation = operation_name,
                        attempt, "Operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) => {
                on_error(&err);
                if attempt >= policy.max_retries || !is_transient_error(&err) {
                    return Err(err);
                }

                let delay = retry_after(&err).unwrap_or_else(|| policy.delay_for(attempt));
                warn!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// [`with_retry_observed`] without an error observer
pub async fn with_retry<F, Fut, T>(operation_name: &str, policy: RetryPolicy, f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_retry_observed(operation_name, policy, |_| {}, f).await
}

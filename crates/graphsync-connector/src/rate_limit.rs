//! Rate limiting and adaptive throttling for provider connections
//!
//! Container tasks share one limiter per provider connection, so outbound
//! request pressure is bounded independently of how many containers sync at
//! once.
//!
//! ## Architecture
//!
//! - [`TokenBucket`]: Classic token bucket algorithm for one connection
//! - [`AdaptiveRateLimiter`]: Manages one token bucket per connection with
//!   adaptive capacity adjustment based on provider responses
//!   (throttle / success)
//!
//! ## Usage
//!
//! ```rust,no_run
//! use graphsync_connector::rate_limit::{AdaptiveRateLimiter, RateLimitConfig};
//!
//! # async fn example() {
//! let limiter = AdaptiveRateLimiter::new(RateLimitConfig::default());
//! let _guard = limiter.acquire("box").await;
//! // ... list a page ...
//! limiter.on_success("box");
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use graphsync_core::config::RateLimitingConfig;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Successes needed before capacity grows again after a throttle
const RECOVERY_INTERVAL: u64 = 100;

/// Fraction of the current capacity added on each recovery step
const RECOVERY_FACTOR: f64 = 0.05;

// ============================================================================
// TokenBucket
// ============================================================================

/// Mutable state of a bucket, guarded by one mutex
#[derive(Debug)]
struct BucketState {
    /// Available tokens (fractional for smooth refill)
    tokens: f64,
    last_refill: Instant,
    /// Capacity after adaptive adjustments
    effective_capacity: u32,
    /// Consecutive successes since the last throttle
    success_count: u64,
}

/// Token bucket rate limiter for a single provider connection.
///
/// Tokens are consumed on each request and refilled at a constant rate.
/// When no tokens are available, callers wait for refill.
#[derive(Debug)]
pub struct TokenBucket {
    /// Capacity before any throttle adjustments
    capacity: u32,
    /// Tokens added per second
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Creates a new `TokenBucket`; the bucket starts full.
    ///
    /// # Arguments
    /// * `capacity` - Maximum number of tokens (burst size)
    /// * `refill_rate` - Tokens added per second
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
                effective_capacity: capacity,
                success_count: 0,
            }),
        }
    }

    /// The bucket state stays consistent across a panic in another holder,
    /// so a poisoned lock is recovered rather than propagated.
    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds tokens for the time elapsed since the last refill, capped at the
    /// effective capacity.
    fn refill(state: &mut BucketState, refill_rate: f64) {
        let now = Instant::now();
        let elapsed_secs = now.duration_since(state.last_refill).as_secs_f64();

        if elapsed_secs > 0.0 {
            state.tokens =
                (state.tokens + elapsed_secs * refill_rate).min(state.effective_capacity as f64);
            state.last_refill = now;
        }
    }

    /// Attempts to take one token without waiting.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.lock();
        Self::refill(&mut state, self.refill_rate);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Estimated wait until a token becomes available.
    pub fn time_until_available(&self) -> Duration {
        let mut state = self.lock();
        Self::refill(&mut state, self.refill_rate);

        if state.tokens >= 1.0 {
            Duration::ZERO
        } else if self.refill_rate > 0.0 {
            Duration::from_secs_f64((1.0 - state.tokens) / self.refill_rate)
        } else {
            Duration::MAX
        }
    }

    /// Currently available tokens (after refill).
    pub fn available_tokens(&self) -> f64 {
        let mut state = self.lock();
        Self::refill(&mut state, self.refill_rate);
        state.tokens
    }

    /// Original (maximum) capacity.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Current effective capacity (may be reduced by throttling).
    pub fn effective_capacity(&self) -> u32 {
        self.lock().effective_capacity
    }

    /// Records a successful call.
    ///
    /// Every 100 consecutive successes the effective capacity grows by 5%
    /// (at least 1), up to the original capacity.
    pub fn on_success(&self) {
        let mut state = self.lock();
        state.success_count += 1;

        if state.success_count % RECOVERY_INTERVAL == 0 && state.effective_capacity < self.capacity
        {
            let old = state.effective_capacity;
            let increase = (old as f64 * RECOVERY_FACTOR).max(1.0) as u32;
            state.effective_capacity = (old + increase).min(self.capacity);
            debug!(
                old_capacity = old,
                new_capacity = state.effective_capacity,
                successes = state.success_count,
                "Provider healthy again, raising request budget"
            );
        }
    }

    /// Records a throttle signal and halves the effective capacity (minimum 1).
    pub fn on_throttle(&self) {
        let mut state = self.lock();
        let old = state.effective_capacity;
        state.effective_capacity = (old / 2).max(1);
        state.tokens = state.tokens.min(state.effective_capacity as f64);
        state.success_count = 0;
        warn!(
            old_capacity = old,
            new_capacity = state.effective_capacity,
            "Provider throttled us, halving request budget"
        );
    }
}

// ============================================================================
// RateLimitGuard
// ============================================================================

/// Proof that a token was taken for a connection.
///
/// The token is consumed on acquisition, so dropping the guard has no effect.
#[derive(Debug)]
pub struct RateLimitGuard {
    connection: String,
}

impl RateLimitGuard {
    fn new(connection: String) -> Self {
        Self { connection }
    }

    /// Connection the token was taken from
    pub fn connection(&self) -> &str {
        &self.connection
    }
}

// ============================================================================
// RateLimitConfig
// ============================================================================

/// Budgets per provider connection
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Bucket capacity (burst size) per connection
    pub default_capacity: u32,
    /// Sustained rate per connection (tokens per second)
    pub default_refill_rate: f64,
    /// Per-connection overrides: (capacity, refill_rate)
    pub connection_overrides: HashMap<String, (u32, f64)>,
}

impl Default for RateLimitConfig {
    /// 50 requests per second per connection with an equal burst.
    fn default() -> Self {
        Self {
            default_capacity: 50,
            default_refill_rate: 50.0,
            connection_overrides: HashMap::new(),
        }
    }
}

impl From<&RateLimitingConfig> for RateLimitConfig {
    fn from(config: &RateLimitingConfig) -> Self {
        Self {
            default_capacity: config.burst.max(1),
            default_refill_rate: f64::from(config.requests_per_second.max(1)),
            connection_overrides: HashMap::new(),
        }
    }
}

// ============================================================================
// AdaptiveRateLimiter
// ============================================================================

/// Adaptive rate limiter managing one token bucket per provider connection.
///
/// Shared by every lister of a daemon through an `Arc`.
pub struct AdaptiveRateLimiter {
    buckets: Mutex<HashMap<String, std::sync::Arc<TokenBucket>>>,
    config: RateLimitConfig,
}

impl std::fmt::Debug for AdaptiveRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveRateLimiter")
            .field("config", &self.config)
            .finish()
    }
}

impl AdaptiveRateLimiter {
    /// Creates a limiter; buckets are created lazily per connection
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Creates a limiter with the default 50 requests/second per connection.
    pub fn with_defaults() -> Self {
        Self::new(RateLimitConfig::default())
    }

    /// Returns the bucket of a connection, creating it on first use.
    fn bucket(&self, connection: &str) -> std::sync::Arc<TokenBucket> {
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        buckets
            .entry(connection.to_string())
            .or_insert_with(|| {
                let (capacity, refill_rate) = self
                    .config
                    .connection_overrides
                    .get(connection)
                    .copied()
                    .unwrap_or((self.config.default_capacity, self.config.default_refill_rate));
                debug!(
                    connection,
                    capacity, refill_rate, "Creating token bucket for connection"
                );
                std::sync::Arc::new(TokenBucket::new(capacity, refill_rate))
            })
            .clone()
    }

    /// Takes a token for the connection, sleeping until one is available.
    pub async fn acquire(&self, connection: &str) -> RateLimitGuard {
        let bucket = self.bucket(connection);
        loop {
            if bucket.try_acquire() {
                return RateLimitGuard::new(connection.to_string());
            }

            let wait = bucket
                .time_until_available()
                .max(Duration::from_millis(1))
                .min(Duration::from_secs(60));
            debug!(
                connection,
                wait_ms = wait.as_millis() as u64,
                "Request budget exhausted, waiting"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Notifies the limiter that a call on the connection succeeded.
    pub fn on_success(&self, connection: &str) {
        self.bucket(connection).on_success();
    }

    /// Notifies the limiter that the provider throttled the connection.
    pub fn on_throttle(&self, connection: &str) {
        info!(connection, "Recording throttle event for connection");
        self.bucket(connection).on_throttle();
    }

    /// Effective capacity of a connection, `None` before its first use.
    pub fn effective_capacity(&self, connection: &str) -> Option<u32> {
        let buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        buckets.get(connection).map(|b| b.effective_capacity())
    }

    /// Available tokens of a connection, `None` before its first use.
    pub fn available_tokens(&self, connection: &str) -> Option<f64> {
        let buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        buckets.get(connection).map(|b| b.available_tokens())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    // ====================================================================
    // TokenBucket tests
    // ====================================================================

    #[tokio::test(start_paused = true)]
    async fn test_bucket_starts_full_and_drains() {
        let bucket = TokenBucket::new(3, 1.0);
        assert_eq!(bucket.capacity(), 3);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
        assert!(bucket.time_until_available() > Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_over_time_caps_at_capacity() {
        let bucket = TokenBucket::new(2, 10.0);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(bucket.try_acquire());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!((bucket.available_tokens() - 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_halves_capacity_with_floor_of_one() {
        let bucket = TokenBucket::new(8, 1.0);
        bucket.on_throttle();
        assert_eq!(bucket.effective_capacity(), 4);
        assert!(bucket.available_tokens() <= 4.0);
        bucket.on_throttle();
        bucket.on_throttle();
        bucket.on_throttle();
        assert_eq!(bucket.effective_capacity(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_recovers_capacity_gradually() {
        let bucket = TokenBucket::new(100, 1.0);
        bucket.on_throttle();
        assert_eq!(bucket.effective_capacity(), 50);

        for _ in 0..99 {
            bucket.on_success();
        }
        assert_eq!(bucket.effective_capacity(), 50);
        bucket.on_success();
        // 50 + 5% of 50
        assert_eq!(bucket.effective_capacity(), 52);

        for _ in 0..10_000 {
            bucket.on_success();
        }
        assert_eq!(bucket.effective_capacity(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_resets_success_streak() {
        let bucket = TokenBucket::new(100, 1.0);
        bucket.on_throttle();
        for _ in 0..99 {
            bucket.on_success();
        }
        bucket.on_throttle();
        assert_eq!(bucket.effective_capacity(), 25);
        bucket.on_success();
        assert_eq!(bucket.effective_capacity(), 25);
    }

    // ====================================================================
    // AdaptiveRateLimiter tests
    // ====================================================================

    #[tokio::test(start_paused = true)]
    async fn test_acquire_creates_bucket_on_demand() {
        let limiter = AdaptiveRateLimiter::with_defaults();
        assert!(limiter.effective_capacity("s3").is_none());
        let guard = limiter.acquire("s3").await;
        assert_eq!(guard.connection(), "s3");
        assert_eq!(limiter.effective_capacity("s3"), Some(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let mut config = RateLimitConfig::default();
        config
            .connection_overrides
            .insert("slow".to_string(), (1, 2.0));
        let limiter = AdaptiveRateLimiter::new(config);

        let start = Instant::now();
        limiter.acquire("slow").await;
        limiter.acquire("slow").await;
        limiter.acquire("slow").await;
        // Two refills at 2 tokens/second
        assert!(start.elapsed() >= Duration::from_millis(999));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connections_are_independent() {
        let mut config = RateLimitConfig::default();
        config.connection_overrides.insert("a".to_string(), (1, 0.5));
        let limiter = AdaptiveRateLimiter::new(config);

        limiter.acquire("a").await;
        limiter.on_throttle("b");
        assert_eq!(limiter.effective_capacity("a"), Some(1));
        assert_eq!(limiter.effective_capacity("b"), Some(25));
        assert!(limiter.available_tokens("a").unwrap() < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquire_never_overallocates() {
        let mut config = RateLimitConfig::default();
        config
            .connection_overrides
            .insert("shared".to_string(), (5, 5.0));
        let limiter = Arc::new(AdaptiveRateLimiter::new(config));

        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..15 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.acquire("shared").await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        // 5 from the initial burst, 10 more at 5/second
        assert!(start.elapsed() >= Duration::from_millis(1999));
    }

    #[test]
    fn test_config_from_settings() {
        let settings = RateLimitingConfig {
            requests_per_second: 20,
            burst: 40,
            max_retries: 3,
            base_delay_ms: 100,
        };
        let config = RateLimitConfig::from(&settings);
        assert_eq!(config.default_capacity, 40);
        assert!((config.default_refill_rate - 20.0).abs() < f64::EPSILON);
    }
}

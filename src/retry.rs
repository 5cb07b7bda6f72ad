//! Retry and rate-limit helpers for the worker side
//!
//! The supervisor restarts processes; these helpers govern in-process call
//! retries with the same failure-classification philosophy. Transient errors
//! (network hiccups, rate limits) are retried with exponential backoff and
//! jitter; fatal errors propagate immediately. The token-bucket limiter
//! blocks callers until capacity is available instead of rejecting them.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How an error should be treated by the retry loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Worth retrying after a backoff delay
    Transient,
    /// Retrying cannot help; propagate immediately
    Fatal,
}

/// Classification hook implemented by caller error types
pub trait Retryable {
    fn retry_class(&self) -> RetryClass;

    fn is_transient(&self) -> bool {
        self.retry_class() == RetryClass::Transient
    }
}

/// Backoff parameters for [`retry_with_backoff`]
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first call
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Ceiling for the exponential delay
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    /// Exponential delay for the given attempt (1-based), capped and
    /// jittered by ±25% so concurrent callers do not retry in lockstep
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay_ms.saturating_mul(1u64 << (attempt - 1).min(16));
        let capped = exp.min(self.max_delay_ms).max(1);
        let jitter_range = (capped / 4).max(1);
        let jitter = rand::thread_rng().gen_range(0..=jitter_range * 2);
        Duration::from_millis(capped - jitter_range + jitter)
    }
}

/// Call `op` until it succeeds, a fatal error appears, or attempts run out
pub async fn retry_with_backoff<T, E, F, Fut>(
    config: &RetryConfig,
    op_name: &str,
    mut op: F,
) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => {
                warn!("{} failed fatally: {}", op_name, e);
                return Err(e);
            }
            Err(e) if attempt >= attempts => {
                warn!("{} failed after {} attempts: {}", op_name, attempt, e);
                return Err(e);
            }
            Err(e) => {
                let delay = config.delay_for(attempt);
                debug!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    op_name, attempt, attempts, delay, e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket limiter whose `acquire` waits for capacity
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    /// `capacity` tokens maximum, refilled at `refill_per_sec` tokens/second
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        let capacity = capacity.max(1) as f64;
        Self {
            capacity,
            refill_per_sec: refill_per_sec.max(f64::EPSILON),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping until one is available
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                let missing = 1.0 - state.tokens;
                Duration::from_secs_f64(missing / self.refill_per_sec)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Take one token only if available right now
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }
}

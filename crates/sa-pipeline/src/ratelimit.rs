//! Token bucket limiter shared by every outbound call of the pipeline.
//!
//! Tokens refill continuously at `quota / window` per second up to `burst`.
//! A waiter computes the exact delay until the next token, sleeps without
//! holding the lock, and re-checks. Cancellation interrupts the sleep.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sa_core::{AppError, Result};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default quota window
const DEFAULT_WINDOW: Duration = Duration::from_secs(300);

/// Default requests per window
const DEFAULT_QUOTA: u32 = 3000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub quota: u32,
    /// Bucket capacity; `max(1, quota / 10)` when unset
    pub burst: Option<u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            quota: DEFAULT_QUOTA,
            burst: None,
        }
    }
}

impl RateLimitConfig {
    pub fn new(window: Duration, quota: u32) -> Self {
        Self { window, quota, burst: None }
    }

    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = Some(burst);
        self
    }

    pub fn effective_burst(&self) -> u32 {
        self.burst.unwrap_or(self.quota / 10).max(1)
    }

    fn rate_per_sec(&self) -> f64 {
        let secs = self.window.as_secs_f64();
        if secs <= 0.0 {
            return f64::INFINITY;
        }
        f64::from(self.quota.max(1)) / secs
    }
}

/// Point-in-time view of the bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitSnapshot {
    pub tokens_available: f64,
    pub burst: u32,
    pub quota: u32,
    pub window: Duration,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    rate: f64,
    max_tokens: f64,
}

impl Bucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.max_tokens);
        self.last_refill = now;
    }

    fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_available(&self) -> Duration {
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        let needed = 1.0 - self.tokens;
        Duration::from_secs_f64(needed / self.rate)
    }
}

/// Cheap to clone; all clones draw from the same bucket.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    bucket: Arc<Mutex<Bucket>>,
}

impl RateLimiter {
    /// The bucket starts full.
    pub fn new(config: RateLimitConfig) -> Self {
        let burst = f64::from(config.effective_burst());
        let bucket = Bucket {
            tokens: burst,
            last_refill: Instant::now(),
            rate: config.rate_per_sec(),
            max_tokens: burst,
        };
        Self {
            config,
            bucket: Arc::new(Mutex::new(bucket)),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Waits for one token. Returns `AppError::Cancelled` as soon as `cancel`
    /// fires, whether before or during the wait.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled("rate limiter wait cancelled".into()));
            }

            let wait = {
                let mut bucket = self.bucket.lock();
                if bucket.try_consume() {
                    return Ok(());
                }
                bucket.time_until_available()
            };

            tracing::trace!(wait_ms = wait.as_millis() as u64, "rate limited");
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(AppError::Cancelled("rate limiter wait cancelled".into()));
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Takes a token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.bucket.lock().try_consume()
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        let mut bucket = self.bucket.lock();
        bucket.refill();
        RateLimitSnapshot {
            tokens_available: bucket.tokens,
            burst: self.config.effective_burst(),
            quota: self.config.quota,
            window: self.config.window,
        }
    }
}

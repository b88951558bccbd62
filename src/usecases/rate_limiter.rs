//! Token Bucket Rate Limiter
//!
//! Bounds the outbound call rate of one rate-limited client. Refill is
//! lazy: tokens are recomputed from elapsed time whenever the bucket is
//! touched, so there is no background refill task.
//!
//! - `try_acquire` never waits
//! - `acquire` waits (outside the lock) until enough tokens exist, and
//!   is interrupted by its `CancellationToken`
//! - waiters are not served in any particular order

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{IngestError, IngestResult};

/// Token bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterConfig {
    /// Maximum burst size.
    pub capacity: f64,
    /// Tokens added per second.
    pub refill_per_sec: f64,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket shared by every poller of one upstream API.
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    capacity: f64,
    refill_rate: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a full bucket.
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> IngestResult<Self> {
        let RateLimiterConfig {
            capacity,
            refill_per_sec,
        } = config;
        if !capacity.is_finite() || capacity < 1.0 {
            return Err(IngestError::config(format!(
                "rate limiter capacity must be >= 1, got {capacity}"
            )));
        }
        if !refill_per_sec.is_finite() || refill_per_sec <= 0.0 {
            return Err(IngestError::config(format!(
                "rate limiter refill rate must be positive, got {refill_per_sec}"
            )));
        }
        Ok(Self {
            name: name.into(),
            capacity,
            refill_rate: refill_per_sec,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        })
    }

    /// Limiter name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum burst size.
    pub const fn capacity(&self) -> f64 {
        self.capacity
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.capacity);
        bucket.last_refill = now;
    }

    /// Take `n` tokens if available right now.
    pub fn try_acquire(&self, n: u32) -> bool {
        let need = f64::from(n);
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, Instant::now());
        if bucket.tokens >= need {
            bucket.tokens -= need;
            true
        } else {
            false
        }
    }

    /// Wait until `n` tokens are available, then take them.
    ///
    /// Returns `Cancelled` if `cancel` fires first, and `Configuration`
    /// when `n` exceeds the capacity (such a request can never succeed).
    pub async fn acquire(&self, n: u32, cancel: &CancellationToken) -> IngestResult<()> {
        let need = f64::from(n);
        if need > self.capacity {
            return Err(IngestError::config(format!(
                "requested {n} tokens from '{}' but capacity is {}",
                self.name, self.capacity
            )));
        }

        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                self.refill(&mut bucket, Instant::now());
                if bucket.tokens >= need {
                    bucket.tokens -= need;
                    return Ok(());
                }
                Duration::from_secs_f64((need - bucket.tokens) / self.refill_rate)
                    .max(Duration::from_millis(1))
            };

            trace!(limiter = %self.name, wait_ms = wait.as_millis(), "Rate limit wait");

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(IngestError::Cancelled),
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Tokens available now (after lazy refill).
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, Instant::now());
        bucket.tokens
    }
}

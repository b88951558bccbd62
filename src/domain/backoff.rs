//! Backoff Policy - Shared Exponential Delay Schedule
//!
//! One policy object drives both stream reconnects and supervisor
//! restarts: `base * multiplier^attempt`, capped at `max`, with a
//! random jitter band so that many clients do not retry in lockstep.
//!
//! The jitter for attempt `n` is drawn from the band between the
//! nominal delay of `n` and that of `n + 1`, so the jittered schedule
//! stays non-decreasing up to the cap.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{IngestError, IngestResult};

/// Exponential backoff with capped growth and banded jitter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    base: Duration,
    /// Growth factor per attempt (>= 1.0).
    multiplier: f64,
    /// Upper bound for any delay.
    max: Duration,
    /// Fraction of the gap to the next step used as random spread, in [0, 1].
    jitter: f64,
}

impl BackoffPolicy {
    /// Create a validated policy.
    pub fn new(
        base: Duration,
        multiplier: f64,
        max: Duration,
        jitter: f64,
    ) -> IngestResult<Self> {
        if base.is_zero() {
            return Err(IngestError::config("backoff base delay must be positive"));
        }
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(IngestError::config(format!(
                "backoff multiplier must be >= 1.0, got {multiplier}"
            )));
        }
        if max < base {
            return Err(IngestError::config(format!(
                "backoff cap {max:?} is below base delay {base:?}"
            )));
        }
        if !(0.0..=1.0).contains(&jitter) {
            return Err(IngestError::config(format!(
                "backoff jitter must be in [0, 1], got {jitter}"
            )));
        }
        Ok(Self {
            base,
            multiplier,
            max,
            jitter,
        })
    }

    /// Doubling policy without jitter.
    pub fn exponential(base: Duration, max: Duration) -> IngestResult<Self> {
        Self::new(base, 2.0, max, 0.0)
    }

    /// Same policy with a different jitter fraction.
    pub fn with_jitter(self, jitter: f64) -> IngestResult<Self> {
        Self::new(self.base, self.multiplier, self.max, jitter)
    }

    /// Delay before the first retry.
    pub const fn base(&self) -> Duration {
        self.base
    }

    /// Upper bound for any delay.
    pub const fn max(&self) -> Duration {
        self.max
    }

    /// Deterministic delay for `attempt` (0-based): `base * multiplier^attempt`, capped.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.multiplier.powi(exponent);
        let secs = self.base.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        self.base.mul_f64(factor)
    }

    /// Jittered delay for `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.jitter == 0.0 {
            return nominal;
        }
        let gap = self.nominal_delay(attempt.saturating_add(1)).saturating_sub(nominal);
        if gap.is_zero() {
            return nominal;
        }
        let spread: f64 = rand::thread_rng().gen_range(0.0..=self.jitter);
        (nominal + gap.mul_f64(spread)).min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(60),
            jitter: 0.5,
        }
    }
}

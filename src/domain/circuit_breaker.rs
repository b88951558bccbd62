//! Restart Circuit Breaker
//!
//! Counts consecutive restart failures for one worker. Reaching the
//! threshold opens the breaker for `open_duration`; while open no
//! restart is permitted. Once the cooldown elapses the breaker moves to
//! half-open and grants exactly one trial: success closes it and clears
//! the failure count, failure reopens it for another full cooldown.
//!
//! The breaker is a plain value owned by the supervisor's per-worker
//! record and mutated under that record's lock; callers pass `now` so
//! the state machine is deterministic under test.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{IngestError, IngestResult};

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, restarts allowed.
    Closed,
    /// Cooling down, restarts blocked.
    Open,
    /// One trial restart permitted.
    HalfOpen,
}

/// Consecutive-failure circuit breaker with a single half-open trial.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    open_duration: Duration,
    state: CircuitState,
    opened_at: Option<Instant>,
    consecutive_failures: u32,
    trial_granted: bool,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(failure_threshold: u32, open_duration: Duration) -> IngestResult<Self> {
        if failure_threshold == 0 {
            return Err(IngestError::config("circuit breaker threshold must be >= 1"));
        }
        if open_duration.is_zero() {
            return Err(IngestError::config("circuit breaker open duration must be positive"));
        }
        Ok(Self {
            failure_threshold,
            open_duration,
            state: CircuitState::Closed,
            opened_at: None,
            consecutive_failures: 0,
            trial_granted: false,
        })
    }

    /// Current position without advancing the cooldown.
    pub const fn state(&self) -> CircuitState {
        self.state
    }

    /// Consecutive failures since the last success.
    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// When the current open period ends, if open.
    pub fn open_until(&self) -> Option<Instant> {
        match self.state {
            CircuitState::Open => self.opened_at.map(|t| t + self.open_duration),
            _ => None,
        }
    }

    /// Ask for permission to attempt a restart at `now`.
    ///
    /// Moves `Open -> HalfOpen` once the cooldown has elapsed and hands
    /// out the single trial; later calls are refused until the trial
    /// outcome is recorded.
    pub fn allow_attempt(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .is_none_or(|opened| now >= opened + self.open_duration);
                if elapsed {
                    self.state = CircuitState::HalfOpen;
                    self.trial_granted = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.trial_granted {
                    false
                } else {
                    self.trial_granted = true;
                    true
                }
            }
        }
    }

    /// Record a successful restart; closes the breaker.
    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.consecutive_failures = 0;
        self.trial_granted = false;
    }

    /// Record a failed restart. Returns `true` when this call opened the breaker.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.state {
            CircuitState::HalfOpen => {
                self.open(now);
                true
            }
            CircuitState::Closed if self.consecutive_failures >= self.failure_threshold => {
                self.open(now);
                true
            }
            _ => false,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.trial_granted = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_at_threshold() {
        let t0 = Instant::now();
        let mut cb = CircuitBreaker::new(3, Duration::from_secs(60)).unwrap();

        assert!(!cb.record_failure(t0));
        assert!(!cb.record_failure(t0));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.record_failure(t0));
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.open_until(), Some(t0 + Duration::from_secs(60)));
    }

    #[test]
    fn test_blocks_until_open_duration_elapses() {
        let t0 = Instant::now();
        let mut cb = CircuitBreaker::new(1, Duration::from_secs(60)).unwrap();
        cb.record_failure(t0);

        assert!(!cb.allow_attempt(t0 + Duration::from_secs(30)));
        assert!(!cb.allow_attempt(t0 + Duration::from_millis(59_999)));
        assert!(cb.allow_attempt(t0 + Duration::from_secs(60)));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_grants_exactly_one_trial() {
        let t0 = Instant::now();
        let mut cb = CircuitBreaker::new(1, Duration::from_secs(1)).unwrap();
        cb.record_failure(t0);

        let later = t0 + Duration::from_secs(2);
        assert!(cb.allow_attempt(later));
        assert!(!cb.allow_attempt(later));
        assert!(!cb.allow_attempt(later + Duration::from_secs(10)));
    }

    #[test]
    fn test_trial_success_closes_and_resets() {
        let t0 = Instant::now();
        let mut cb = CircuitBreaker::new(2, Duration::from_secs(1)).unwrap();
        cb.record_failure(t0);
        cb.record_failure(t0);
        assert!(cb.allow_attempt(t0 + Duration::from_secs(1)));

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
        assert!(cb.allow_attempt(t0 + Duration::from_secs(1)));
    }

    #[test]
    fn test_trial_failure_reopens() {
        let t0 = Instant::now();
        let mut cb = CircuitBreaker::new(2, Duration::from_secs(5)).unwrap();
        cb.record_failure(t0);
        cb.record_failure(t0);

        let trial_at = t0 + Duration::from_secs(5);
        assert!(cb.allow_attempt(trial_at));
        assert!(cb.record_failure(trial_at));
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_attempt(trial_at + Duration::from_secs(4)));
        assert!(cb.allow_attempt(trial_at + Duration::from_secs(5)));
    }

    #[test]
    fn test_rejects_zero_threshold() {
        assert!(CircuitBreaker::new(0, Duration::from_secs(1)).is_err());
    }
}

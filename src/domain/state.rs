//! Component State Types
//!
//! Connection, source-arbitration and service states shared between
//! the stream handler, the hybrid manager and the supervisor, plus the
//! immutable health report handed to observability consumers.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::circuit_breaker::CircuitState;
use super::quote::QuoteSource;

/// Lifecycle of one streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
    Subscribed,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    /// States in which the handshake sequence is in progress or complete.
    pub const fn is_establishing(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Connected | Self::Authenticated | Self::Subscribed
        )
    }

    /// Numeric code exported as a gauge.
    pub const fn code(self) -> i64 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::Authenticated => 3,
            Self::Subscribed => 4,
            Self::Reconnecting => 5,
            Self::Failed => 6,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Health of the polling path as seen by the hybrid manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PollHealth {
    /// No poller attached or no cycle completed yet.
    Unknown,
    Healthy,
    Failing,
}

/// Per-instrument source arbitration record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceStatus {
    /// Source whose values are currently served.
    pub active_source: QuoteSource,
    /// Stream connection state at the time of the snapshot.
    pub stream_state: ConnectionState,
    /// Poller health at the time of the snapshot.
    pub poll_health: PollHealth,
    /// Last stream -> poll transition.
    pub last_failover_at: Option<DateTime<Utc>>,
    /// Number of stream -> poll transitions.
    pub failover_count: u64,
    /// Receipt time of the last accepted stream quote.
    pub last_stream_update_at: Option<DateTime<Utc>>,
    /// Receipt time of the last poll quote.
    pub last_poll_update_at: Option<DateTime<Utc>>,
}

/// Supervised worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Degraded,
    Restarting,
    StoppedFatal,
}

impl ServiceState {
    /// Numeric code exported as a gauge.
    pub const fn code(self) -> i64 {
        match self {
            Self::Stopped => 0,
            Self::Starting => 1,
            Self::Running => 2,
            Self::Degraded => 3,
            Self::Restarting => 4,
            Self::StoppedFatal => 5,
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Immutable view of one supervised worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub name: String,
    pub state: ServiceState,
    pub restart_count: u32,
    pub consecutive_restart_failures: u32,
    /// Time since the worker last entered `Running` (zero when not running).
    pub uptime: Duration,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub circuit_state: CircuitState,
    pub circuit_open_until: Option<DateTime<Utc>>,
}

/// Immutable supervisor report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub workers: Vec<WorkerSnapshot>,
}

impl HealthReport {
    /// Every worker is `Running`.
    pub fn all_running(&self) -> bool {
        !self.workers.is_empty()
            && self
                .workers
                .iter()
                .all(|w| w.state == ServiceState::Running)
    }

    /// Look up one worker by name.
    pub fn worker(&self, name: &str) -> Option<&WorkerSnapshot> {
        self.workers.iter().find(|w| w.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(name: &str, state: ServiceState) -> WorkerSnapshot {
        WorkerSnapshot {
            name: name.to_string(),
            state,
            restart_count: 0,
            consecutive_restart_failures: 0,
            uptime: Duration::ZERO,
            last_health_check_at: None,
            circuit_state: CircuitState::Closed,
            circuit_open_until: None,
        }
    }

    #[test]
    fn test_all_running() {
        let report = HealthReport {
            generated_at: Utc::now(),
            workers: vec![
                snapshot("scoreboard", ServiceState::Running),
                snapshot("market", ServiceState::Degraded),
            ],
        };
        assert!(!report.all_running());
        assert_eq!(
            report.worker("market").map(|w| w.state),
            Some(ServiceState::Degraded)
        );
    }

    #[test]
    fn test_empty_report_is_not_ready() {
        let report = HealthReport {
            generated_at: Utc::now(),
            workers: Vec::new(),
        };
        assert!(!report.all_running());
    }

    #[test]
    fn test_connection_state_establishing() {
        assert!(ConnectionState::Authenticated.is_establishing());
        assert!(!ConnectionState::Reconnecting.is_establishing());
        assert!(!ConnectionState::Failed.is_establishing());
    }
}

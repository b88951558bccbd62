//! Worker Port - Supervised Unit of Work
//!
//! Anything the supervisor owns implements `Worker`: a named task with
//! scoped start/stop and a health probe.

use async_trait::async_trait;

use crate::error::IngestResult;

/// Result of a health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
  /// Operating normally.
  Healthy,
  /// Not operating normally; may recover on its own.
  Unhealthy(String),
  /// Internal error that requires a restart.
  Fatal(String),
}

impl HealthStatus {
  /// Whether the probe passed.
  pub const fn is_healthy(&self) -> bool {
    matches!(self, Self::Healthy)
  }
}

/// A long-running component managed by the supervisor.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
  /// Unique, stable name used in reports and alerts.
  fn name(&self) -> &str;

  /// Launch the worker's tasks. Must be callable again after `stop`.
  async fn start(&self) -> IngestResult<()>;

  /// Scoped shutdown: returns once the worker's tasks have finished.
  async fn stop(&self) -> IngestResult<()>;

  /// Health probe. Must not block for long; the supervisor applies a timeout.
  async fn is_healthy(&self) -> HealthStatus;
}

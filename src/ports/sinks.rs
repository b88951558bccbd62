//! Sink Ports - Where Accepted State Goes
//!
//! - `QuoteSink`: ingestion entry point (implemented by the quote cache)
//! - `PersistenceSink`: external CRUD/versioning layer, always called
//!   from a background drainer, never from the ingestion path
//! - `AlertSink`: operator notifications on degraded/fatal transitions

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::quote::Quote;
use crate::domain::state::HealthReport;
use crate::error::IngestResult;

/// What the cache did with an incoming quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
  /// Became the served value and was fanned out.
  Applied,
  /// Kept as the poll backstop while the stream is authoritative.
  Retained,
  /// Older than the value already held; discarded.
  Stale,
  /// Failed validation (crossed book, non-finite value).
  Rejected,
}

/// Entry point for decoded quotes from either source.
pub trait QuoteSink: Send + Sync + 'static {
  /// Offer a quote to the cache. Never blocks on I/O.
  fn ingest(&self, quote: Quote) -> IngestOutcome;
}

/// External persistence collaborator.
#[async_trait]
pub trait PersistenceSink: Send + Sync + 'static {
  /// Upsert the latest state of an instrument.
  async fn upsert_quote(&self, quote: &Quote) -> IngestResult<()>;

  /// Upsert a supervisor snapshot.
  async fn upsert_service_state(&self, report: &HealthReport) -> IngestResult<()>;
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
  Info,
  Warning,
  Critical,
}

impl fmt::Display for Severity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Info => f.write_str("info"),
      Self::Warning => f.write_str("warning"),
      Self::Critical => f.write_str("critical"),
    }
  }
}

/// External alerting collaborator.
#[async_trait]
pub trait AlertSink: Send + Sync + 'static {
  /// Deliver one alert. Delivery failures are the sink's concern.
  async fn notify(&self, severity: Severity, message: &str);
}

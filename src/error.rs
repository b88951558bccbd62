//! Ingest Error Taxonomy
//!
//! Every component-local failure is expressed as an `IngestError`.
//! Errors that make a component unusable never cross component
//! boundaries as errors; they surface as state transitions
//! (`ConnectionState::Failed`, `ServiceState::StoppedFatal`) instead.

use thiserror::Error;

/// Errors produced by the ingestion core.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IngestError {
    /// Network failure or timeout. Retried with backoff, never fatal by itself.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// Malformed or unexpected message. Dropped and counted.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Credential or signature rejected by the upstream.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Invalid interval, threshold or capacity. Raised at construction only.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Reported by a worker probe or lifecycle hook; drives the circuit breaker.
    #[error("fatal worker error: {0}")]
    FatalWorker(String),

    /// A blocking wait was interrupted by a shutdown signal.
    #[error("operation cancelled by shutdown")]
    Cancelled,
}

impl IngestError {
    /// Whether retrying the same operation can reasonably succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientIo(_) | Self::Protocol(_))
    }

    /// Shorthand used by constructors validating their inputs.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

/// Result alias used across the crate.
pub type IngestResult<T> = Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(IngestError::TransientIo("timeout".into()).is_retryable());
        assert!(IngestError::Protocol("bad json".into()).is_retryable());
        assert!(!IngestError::Auth("bad key".into()).is_retryable());
        assert!(!IngestError::Cancelled.is_retryable());
    }

    #[test]
    fn test_display_includes_detail() {
        let err = IngestError::config("interval must be positive");
        assert_eq!(
            err.to_string(),
            "invalid configuration: interval must be positive"
        );
    }
}

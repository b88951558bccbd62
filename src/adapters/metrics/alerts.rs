//! Tracing Alert Sink
//!
//! Default `AlertSink`: alerts become structured log events at a level
//! matching their severity, so any log shipper can route them.

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::ports::sinks::{AlertSink, Severity};

/// Logs every alert; keeps the most recent one for the health endpoint.
#[derive(Debug, Default)]
pub struct TracingAlertSink {
    last: Mutex<Option<(Severity, String)>>,
}

impl TracingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent alert, if any was raised.
    pub fn last_alert(&self) -> Option<(Severity, String)> {
        self.last.lock().clone()
    }
}

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn notify(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Info => info!(alert = true, %severity, "{message}"),
            Severity::Warning => warn!(alert = true, %severity, "{message}"),
            Severity::Critical => error!(alert = true, %severity, "{message}"),
        }
        *self.last.lock() = Some((severity, message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_last_alert_tracked() {
        let sink = TracingAlertSink::new();
        assert!(sink.last_alert().is_none());
        sink.notify(Severity::Warning, "stream degraded").await;
        sink.notify(Severity::Critical, "worker stopped").await;
        assert_eq!(
            sink.last_alert(),
            Some((Severity::Critical, "worker stopped".to_string()))
        );
    }
}

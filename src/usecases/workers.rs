//! Supervised Workers
//!
//! Adapters from the ingestion components to the `Worker` port, so the
//! supervisor can start, stop and probe them.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::quote::InstrumentId;
use crate::domain::state::ConnectionState;
use crate::error::IngestResult;
use crate::ports::worker::{HealthStatus, Worker};
use crate::usecases::hybrid_manager::HybridDataManager;
use crate::usecases::poller::{Poller, PollerLifecycle};

/// A standalone poller under supervision.
pub struct PollerWorker {
    poller: Arc<Poller>,
}

impl PollerWorker {
    pub const fn new(poller: Arc<Poller>) -> Self {
        Self { poller }
    }
}

#[async_trait]
impl Worker for PollerWorker {
    fn name(&self) -> &str {
        self.poller.name()
    }

    async fn start(&self) -> IngestResult<()> {
        self.poller.start().await
    }

    async fn stop(&self) -> IngestResult<()> {
        self.poller.stop().await;
        Ok(())
    }

    async fn is_healthy(&self) -> HealthStatus {
        poller_health(&self.poller)
    }
}

fn poller_health(poller: &Poller) -> HealthStatus {
    if poller.is_halted() {
        let reason = poller
            .stats()
            .last_error
            .unwrap_or_else(|| "consecutive failure limit reached".to_string());
        return HealthStatus::Fatal(format!("poller '{}' halted: {reason}", poller.name()));
    }
    if poller.lifecycle() != PollerLifecycle::Started {
        return HealthStatus::Unhealthy(format!("poller '{}' is not running", poller.name()));
    }
    if poller.is_healthy() {
        HealthStatus::Healthy
    } else {
        let stats = poller.stats();
        HealthStatus::Unhealthy(format!(
            "poller '{}' failed {} cycles in a row",
            poller.name(),
            stats.consecutive_failures
        ))
    }
}

/// The hybrid manager and everything it owns, as one supervised unit.
pub struct HybridWorker {
    name: String,
    manager: Arc<HybridDataManager>,
    instruments: Vec<InstrumentId>,
}

impl HybridWorker {
    pub fn new(
        name: impl Into<String>,
        manager: Arc<HybridDataManager>,
        instruments: Vec<InstrumentId>,
    ) -> Self {
        Self {
            name: name.into(),
            manager,
            instruments,
        }
    }
}

#[async_trait]
impl Worker for HybridWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> IngestResult<()> {
        self.manager.start(&self.instruments).await
    }

    async fn stop(&self) -> IngestResult<()> {
        self.manager.stop().await
    }

    /// Healthy while at least one source delivers: a subscribed stream
    /// or a healthy poller. Fatal once every source has given up.
    async fn is_healthy(&self) -> HealthStatus {
        if !self.manager.is_started().await {
            return HealthStatus::Unhealthy("hybrid manager is not started".to_string());
        }

        let stream_state = self.manager.stream().map(|s| s.state());
        let pollers = self.manager.pollers();
        let poll_statuses: Vec<HealthStatus> = pollers.iter().map(|p| poller_health(p)).collect();

        let stream_ok = stream_state == Some(ConnectionState::Subscribed);
        let poll_ok = poll_statuses.iter().any(HealthStatus::is_healthy);
        if stream_ok || poll_ok {
            return HealthStatus::Healthy;
        }

        let stream_gone = stream_state.is_none_or(|s| s == ConnectionState::Failed);
        let polls_gone = poll_statuses
            .iter()
            .all(|s| matches!(s, HealthStatus::Fatal(_)));
        let state = stream_state.map_or_else(|| "none".to_string(), |s| s.to_string());
        if stream_gone && polls_gone {
            HealthStatus::Fatal(format!(
                "no live source: stream {state}, {} poller(s) halted",
                pollers.len()
            ))
        } else {
            HealthStatus::Unhealthy(format!(
                "no healthy source yet: stream {state}, {} poller(s) unhealthy",
                pollers.len()
            ))
        }
    }
}

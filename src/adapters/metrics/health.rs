//! Health Check Server - Liveness, Readiness and Report Endpoints
//!
//! Exposes the supervisor's latest `HealthReport` via axum 0.7:
//!
//! - `/live`: 200 while the process runs
//! - `/ready`: 200 when every worker is `Running` or `Degraded`
//! - `/health`: the full report as JSON

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::domain::state::{HealthReport, ServiceState};

/// Whether the report allows traffic: no worker is stopped, starting,
/// restarting or tripped.
pub fn is_ready(report: &HealthReport) -> bool {
    !report.workers.is_empty()
        && report
            .workers
            .iter()
            .all(|w| matches!(w.state, ServiceState::Running | ServiceState::Degraded))
}

pub struct HealthServer {
    reports: watch::Receiver<HealthReport>,
    bind_address: String,
}

impl HealthServer {
    pub const fn new(reports: watch::Receiver<HealthReport>, bind_address: String) -> Self {
        Self {
            reports,
            bind_address,
        }
    }

    fn router(reports: watch::Receiver<HealthReport>) -> Router {
        Router::new()
            .route("/live", get(Self::liveness))
            .route("/ready", get(Self::readiness))
            .route("/health", get(Self::report))
            .with_state(reports)
    }

    /// Serve until `cancel` fires.
    #[instrument(skip(self, cancel), fields(address = %self.bind_address))]
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let app = Self::router(self.reports);
        let listener = tokio::net::TcpListener::bind(&self.bind_address).await?;

        info!("Health server started");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;

        Ok(())
    }

    async fn liveness() -> impl IntoResponse {
        (StatusCode::OK, "OK")
    }

    async fn readiness(State(reports): State<watch::Receiver<HealthReport>>) -> impl IntoResponse {
        if is_ready(&reports.borrow()) {
            (StatusCode::OK, "READY")
        } else {
            (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
        }
    }

    async fn report(State(reports): State<watch::Receiver<HealthReport>>) -> Json<HealthReport> {
        Json(reports.borrow().clone())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::domain::circuit_breaker::CircuitState;
    use crate::domain::state::WorkerSnapshot;

    fn report(states: &[ServiceState]) -> HealthReport {
        HealthReport {
            generated_at: Utc::now(),
            workers: states
                .iter()
                .enumerate()
                .map(|(i, &state)| WorkerSnapshot {
                    name: format!("w{i}"),
                    state,
                    restart_count: 0,
                    consecutive_restart_failures: 0,
                    uptime: Duration::ZERO,
                    last_health_check_at: None,
                    circuit_state: CircuitState::Closed,
                    circuit_open_until: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_readiness_rules() {
        assert!(!is_ready(&report(&[])));
        assert!(is_ready(&report(&[ServiceState::Running, ServiceState::Degraded])));
        assert!(!is_ready(&report(&[ServiceState::Running, ServiceState::StoppedFatal])));
        assert!(!is_ready(&report(&[ServiceState::Starting])));
    }

    #[tokio::test]
    async fn test_readiness_follows_latest_report() {
        let (tx, rx) = watch::channel(report(&[ServiceState::Starting]));
        let response = HealthServer::readiness(State(rx.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        tx.send(report(&[ServiceState::Running])).unwrap();
        let response = HealthServer::readiness(State(rx)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

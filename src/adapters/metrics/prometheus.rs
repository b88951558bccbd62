//! Prometheus Metrics Registry - Ingestion Observability
//!
//! Mirrors component snapshots (cache counters, poller and stream
//! stats, supervisor report) into Prometheus gauges on a fixed
//! interval and serves them on `/metrics`.
//!
//! Component counters are cumulative snapshots, so they are exported as
//! gauges set to the latest value rather than incremented here.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use prometheus::{Encoder, IntGaugeVec, Opts, Registry, TextEncoder};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::domain::state::HealthReport;
use crate::usecases::hybrid_manager::HybridDataManager;
use crate::usecases::rate_limiter::RateLimiter;

/// All metrics follow the naming convention `feed_ingest_*`.
pub struct MetricsRegistry {
    registry: Registry,
    /// Cache outcome counters by `outcome`.
    pub cache_quotes: IntGaugeVec,
    /// Instruments tracked by the cache.
    pub cache_instruments: IntGaugeVec,
    /// Poll cycle counters by `poller` and `outcome`.
    pub poll_cycles: IntGaugeVec,
    /// Stream frame and reconnect counters by `stream` and `kind`.
    pub stream_events: IntGaugeVec,
    /// `ConnectionState::code()` per stream.
    pub stream_state: IntGaugeVec,
    /// `ServiceState::code()` per worker.
    pub worker_state: IntGaugeVec,
    /// Restarts per worker.
    pub worker_restarts: IntGaugeVec,
    /// Whole tokens left per rate limiter.
    pub limiter_tokens: IntGaugeVec,
}

impl MetricsRegistry {
    /// Create and register all Prometheus metrics.
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let cache_quotes = IntGaugeVec::new(
            Opts::new("feed_ingest_cache_quotes", "Quotes seen by the cache, by outcome"),
            &["outcome"],
        )?;
        let cache_instruments = IntGaugeVec::new(
            Opts::new("feed_ingest_cache_instruments", "Instruments tracked by the cache"),
            &["manager"],
        )?;
        let poll_cycles = IntGaugeVec::new(
            Opts::new("feed_ingest_poll_cycles", "Poll cycles, by outcome"),
            &["poller", "outcome"],
        )?;
        let stream_events = IntGaugeVec::new(
            Opts::new("feed_ingest_stream_events", "Stream frames and reconnects, by kind"),
            &["stream", "kind"],
        )?;
        let stream_state = IntGaugeVec::new(
            Opts::new(
                "feed_ingest_stream_state",
                "Connection state code (0=disconnected .. 4=subscribed, 5=reconnecting, 6=failed)",
            ),
            &["stream"],
        )?;
        let worker_state = IntGaugeVec::new(
            Opts::new(
                "feed_ingest_worker_state",
                "Service state code (0=stopped, 2=running, 3=degraded, 5=stopped_fatal)",
            ),
            &["worker"],
        )?;
        let worker_restarts = IntGaugeVec::new(
            Opts::new("feed_ingest_worker_restarts", "Restarts performed per worker"),
            &["worker"],
        )?;
        let limiter_tokens = IntGaugeVec::new(
            Opts::new("feed_ingest_limiter_tokens", "Tokens available per rate limiter"),
            &["limiter"],
        )?;

        registry.register(Box::new(cache_quotes.clone()))?;
        registry.register(Box::new(cache_instruments.clone()))?;
        registry.register(Box::new(poll_cycles.clone()))?;
        registry.register(Box::new(stream_events.clone()))?;
        registry.register(Box::new(stream_state.clone()))?;
        registry.register(Box::new(worker_state.clone()))?;
        registry.register(Box::new(worker_restarts.clone()))?;
        registry.register(Box::new(limiter_tokens.clone()))?;

        Ok(Self {
            registry,
            cache_quotes,
            cache_instruments,
            poll_cycles,
            stream_events,
            stream_state,
            worker_state,
            worker_restarts,
            limiter_tokens,
        })
    }

    /// Copy the manager's cache, poller and stream snapshots.
    pub fn observe_manager(&self, name: &str, manager: &HybridDataManager) {
        let cache = manager.cache_stats();
        for (outcome, value) in [
            ("applied", cache.applied),
            ("retained", cache.retained),
            ("stale", cache.stale),
            ("rejected", cache.rejected),
            ("failover", cache.failovers),
            ("callback_dropped", cache.callback_dropped),
            ("persist_dropped", cache.persist_dropped),
        ] {
            self.cache_quotes.with_label_values(&[outcome]).set(gauge(value));
        }
        self.cache_instruments
            .with_label_values(&[name])
            .set(gauge(manager.instruments().len() as u64));

        for poller in manager.pollers() {
            let stats = poller.stats();
            for (outcome, value) in [
                ("success", stats.successes),
                ("failure", stats.failures),
                ("skipped", stats.skipped),
            ] {
                self.poll_cycles
                    .with_label_values(&[poller.name(), outcome])
                    .set(gauge(value));
            }
        }

        if let Some(stream) = manager.stream() {
            let stats = stream.stats();
            for (kind, value) in [
                ("frame", stats.frames),
                ("quote", stats.quotes),
                ("malformed", stats.malformed_frames),
                ("reconnect", stats.reconnects),
                ("auth_failure", stats.auth_failures),
            ] {
                self.stream_events
                    .with_label_values(&[stream.name(), kind])
                    .set(gauge(value));
            }
            self.stream_state
                .with_label_values(&[stream.name()])
                .set(stream.state().code());
        }
    }

    /// Copy the supervisor's per-worker state.
    pub fn observe_report(&self, report: &HealthReport) {
        for worker in &report.workers {
            self.worker_state
                .with_label_values(&[worker.name.as_str()])
                .set(worker.state.code());
            self.worker_restarts
                .with_label_values(&[worker.name.as_str()])
                .set(i64::from(worker.restart_count));
        }
    }

    pub fn observe_limiter(&self, limiter: &RateLimiter) {
        #[allow(clippy::cast_possible_truncation)]
        let tokens = limiter.available().floor() as i64;
        self.limiter_tokens.with_label_values(&[limiter.name()]).set(tokens);
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Refresh all gauges every `interval` until `cancel` fires.
    pub fn spawn_collector(
        self: Arc<Self>,
        managers: Vec<(String, Arc<HybridDataManager>)>,
        limiters: Vec<Arc<RateLimiter>>,
        mut reports: watch::Receiver<HealthReport>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    changed = reports.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let report = reports.borrow_and_update().clone();
                        self.observe_report(&report);
                    }
                    _ = ticker.tick() => {
                        for (name, manager) in &managers {
                            self.observe_manager(name, manager);
                        }
                        for limiter in &limiters {
                            self.observe_limiter(limiter);
                        }
                    }
                }
            }
        })
    }

    /// Serve Prometheus metrics on the configured bind address.
    #[instrument(skip(self, cancel))]
    pub async fn serve(self: Arc<Self>, bind_address: String, cancel: CancellationToken) -> anyhow::Result<()> {
        let metrics = Arc::clone(&self);
        let app = Router::new().route(
            "/metrics",
            get(move || {
                let metrics = Arc::clone(&metrics);
                async move {
                    match metrics.render() {
                        Ok(body) => (StatusCode::OK, body),
                        Err(e) => {
                            warn!(error = %e, "Failed to encode metrics");
                            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
                        }
                    }
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind(&bind_address).await?;
        info!(address = %bind_address, "Prometheus metrics server started");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;

        Ok(())
    }
}

fn gauge(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::domain::circuit_breaker::CircuitState;
    use crate::domain::state::{ServiceState, WorkerSnapshot};

    #[test]
    fn test_report_exported_as_gauges() {
        let metrics = MetricsRegistry::new().unwrap();
        metrics.observe_report(&HealthReport {
            generated_at: Utc::now(),
            workers: vec![WorkerSnapshot {
                name: "market".to_string(),
                state: ServiceState::Degraded,
                restart_count: 2,
                consecutive_restart_failures: 0,
                uptime: Duration::ZERO,
                last_health_check_at: None,
                circuit_state: CircuitState::Closed,
                circuit_open_until: None,
            }],
        });

        let text = metrics.render().unwrap();
        assert!(text.contains(r#"feed_ingest_worker_state{worker="market"} 3"#));
        assert!(text.contains(r#"feed_ingest_worker_restarts{worker="market"} 2"#));
    }

    #[tokio::test]
    async fn test_manager_snapshot_exported() {
        use crate::domain::quote::{Quote, QuoteSource};
        use crate::ports::sinks::QuoteSink;
        use crate::usecases::hybrid_manager::HybridConfig;

        let metrics = MetricsRegistry::new().unwrap();
        let manager = HybridDataManager::new(HybridConfig::new(Duration::from_secs(5)).unwrap(), None);
        manager
            .ingress()
            .ingest(Quote::score("G1", 1.0, QuoteSource::Poll, Utc::now()));
        metrics.observe_manager("scores", &manager);

        let text = metrics.render().unwrap();
        assert!(text.contains(r#"feed_ingest_cache_quotes{outcome="applied"} 1"#));
        assert!(text.contains(r#"feed_ingest_cache_instruments{manager="scores"} 1"#));
    }
}

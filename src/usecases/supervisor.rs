//! Supervisor - Health Checks, Restarts and Circuit Breaking
//!
//! Owns a fixed set of workers and runs one background health loop
//! that probes each of them every `health_check_interval`.
//!
//! State machine per worker:
//! - `Starting -> Running` on the first passing probe, or once
//!   `startup_grace` has elapsed without a fatal probe
//! - `Running -> Degraded` on one failed probe (warning alert)
//! - `Degraded -> Restarting` on another failed probe, or straight from
//!   `Running` on a fatal probe
//! - `Restarting -> Running` once the restart succeeded and the next
//!   probe passes
//!
//! Every failed probe that triggers a restart, every failed restart and
//! every failing post-restart probe is recorded on the worker's circuit
//! breaker. When it opens the worker is stopped and held in
//! `StoppedFatal` until the cooldown allows one trial restart.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::backoff::BackoffPolicy;
use crate::domain::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::domain::state::{HealthReport, ServiceState, WorkerSnapshot};
use crate::error::{IngestError, IngestResult};
use crate::ports::sinks::{AlertSink, PersistenceSink, Severity};
use crate::ports::worker::{HealthStatus, Worker};

/// Supervisor timing and restart policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SupervisorConfig {
    health_check_interval: Duration,
    probe_timeout: Duration,
    startup_grace: Duration,
    restart_backoff: BackoffPolicy,
    failure_threshold: u32,
    open_duration: Duration,
    report_interval: Duration,
    stop_timeout: Duration,
}

impl SupervisorConfig {
    /// Validated configuration with default grace, timeouts and report cadence.
    pub fn new(
        health_check_interval: Duration,
        restart_backoff: BackoffPolicy,
        failure_threshold: u32,
        open_duration: Duration,
    ) -> IngestResult<Self> {
        if health_check_interval.is_zero() {
            return Err(IngestError::config("health_check_interval must be positive"));
        }
        // Validates threshold and open duration.
        CircuitBreaker::new(failure_threshold, open_duration)?;
        Ok(Self {
            health_check_interval,
            probe_timeout: health_check_interval,
            startup_grace: health_check_interval * 3,
            restart_backoff,
            failure_threshold,
            open_duration,
            report_interval: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(10),
        })
    }

    /// Time after which a `Starting` worker counts as running without a passing probe.
    #[must_use]
    pub const fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    /// Upper bound on one `is_healthy` call; a timeout counts as unhealthy.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> IngestResult<Self> {
        if timeout.is_zero() {
            return Err(IngestError::config("probe_timeout must be positive"));
        }
        self.probe_timeout = timeout;
        Ok(self)
    }

    /// How often a health report is pushed to the persistence sink.
    pub fn with_report_interval(mut self, interval: Duration) -> IngestResult<Self> {
        if interval.is_zero() {
            return Err(IngestError::config("report_interval must be positive"));
        }
        self.report_interval = interval;
        Ok(self)
    }

    /// Upper bound on one worker's `stop` during `stop_all`.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> IngestResult<Self> {
        if timeout.is_zero() {
            return Err(IngestError::config("stop_timeout must be positive"));
        }
        self.stop_timeout = timeout;
        Ok(self)
    }

    fn breaker(&self) -> IngestResult<CircuitBreaker> {
        CircuitBreaker::new(self.failure_threshold, self.open_duration)
    }
}

/// Outcome of `stop_all`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StopReport {
    /// Workers stopped, in stop order.
    pub stopped: Vec<String>,
    /// Workers whose own `stop` failed or timed out, with the reason.
    pub failures: Vec<(String, String)>,
}

impl StopReport {
    /// Whether every worker stopped cleanly.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Collapse into one aggregate error listing every failure.
    pub fn into_result(self) -> IngestResult<()> {
        if self.failures.is_empty() {
            return Ok(());
        }
        let detail = self
            .failures
            .iter()
            .map(|(name, reason)| format!("{name}: {reason}"))
            .collect::<Vec<_>>()
            .join("; ");
        Err(IngestError::FatalWorker(format!("shutdown errors: {detail}")))
    }
}

#[derive(Debug)]
struct Record {
    state: ServiceState,
    restart_count: u32,
    breaker: CircuitBreaker,
    started_at: Option<Instant>,
    running_since: Option<Instant>,
    last_health_check_at: Option<DateTime<Utc>>,
    /// A restart task owns the worker right now.
    restart_in_flight: bool,
}

struct Supervised {
    worker: Arc<dyn Worker>,
    record: Mutex<Record>,
}

impl Supervised {
    fn name(&self) -> &str {
        self.worker.name()
    }
}

enum Step {
    Skip,
    Probe,
    Trial,
}

/// What to do after a state transition, executed outside the record lock.
enum Action {
    None,
    Alert(Severity, String),
    Restart { delay: Duration, reason: String },
    Trip { reason: String, open_for: Duration },
}

struct Shared {
    config: SupervisorConfig,
    workers: Vec<Arc<Supervised>>,
    alerts: Option<Arc<dyn AlertSink>>,
    persistence: Option<Arc<dyn PersistenceSink>>,
    report_tx: watch::Sender<HealthReport>,
    restarts: Mutex<Vec<JoinHandle<()>>>,
}

struct Runtime {
    cancel: CancellationToken,
    health_loop: JoinHandle<()>,
}

/// Owner of every long-running worker.
pub struct Supervisor {
    shared: Arc<Shared>,
    runtime: tokio::sync::Mutex<Option<Runtime>>,
}

impl Supervisor {
    /// Create a supervisor with no workers.
    pub fn new(config: SupervisorConfig) -> Self {
        let (report_tx, _) = watch::channel(HealthReport {
            generated_at: Utc::now(),
            workers: Vec::new(),
        });
        Self {
            shared: Arc::new(Shared {
                config,
                workers: Vec::new(),
                alerts: None,
                persistence: None,
                report_tx,
                restarts: Mutex::new(Vec::new()),
            }),
            runtime: tokio::sync::Mutex::new(None),
        }
    }

    fn shared_mut(&mut self) -> IngestResult<&mut Shared> {
        Arc::get_mut(&mut self.shared)
            .ok_or_else(|| IngestError::config("supervisor cannot be changed once shared"))
    }

    /// Register a worker. Start order is registration order.
    pub fn with_worker(mut self, worker: Arc<dyn Worker>) -> IngestResult<Self> {
        let shared = self.shared_mut()?;
        if shared.workers.iter().any(|w| w.name() == worker.name()) {
            return Err(IngestError::config(format!(
                "duplicate worker name '{}'",
                worker.name()
            )));
        }
        let breaker = shared.config.breaker()?;
        shared.workers.push(Arc::new(Supervised {
            worker,
            record: Mutex::new(Record {
                state: ServiceState::Stopped,
                restart_count: 0,
                breaker,
                started_at: None,
                running_since: None,
                last_health_check_at: None,
                restart_in_flight: false,
            }),
        }));
        Ok(self)
    }

    /// Deliver degraded/fatal transitions to an alert sink.
    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> IngestResult<Self> {
        self.shared_mut()?.alerts = Some(alerts);
        Ok(self)
    }

    /// Push periodic health snapshots to a persistence sink.
    pub fn with_persistence(mut self, persistence: Arc<dyn PersistenceSink>) -> IngestResult<Self> {
        self.shared_mut()?.persistence = Some(persistence);
        Ok(self)
    }

    /// Immutable snapshot of every worker.
    pub fn health_report(&self) -> HealthReport {
        self.shared.report()
    }

    /// Receiver updated after every health cycle.
    pub fn watch_reports(&self) -> watch::Receiver<HealthReport> {
        self.shared.report_tx.subscribe()
    }

    /// Start every worker in registration order, then the health loop.
    ///
    /// A worker whose `start` fails is handled like a failed restart;
    /// the other workers still start. A no-op when already started.
    #[instrument(skip(self))]
    pub async fn start_all(&self) -> IngestResult<()> {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            debug!("Supervisor already started");
            return Ok(());
        }
        let cancel = CancellationToken::new();

        for supervised in &self.shared.workers {
            {
                let mut record = supervised.record.lock();
                record.state = ServiceState::Starting;
                record.started_at = Some(Instant::now());
                record.running_since = None;
            }
            match supervised.worker.start().await {
                Ok(()) => info!(worker = %supervised.name(), "Worker started"),
                Err(e) => {
                    error!(worker = %supervised.name(), error = %e, "Worker failed to start");
                    let action = {
                        let mut record = supervised.record.lock();
                        self.shared.escalate(&mut record, e.to_string())
                    };
                    Arc::clone(&self.shared)
                        .perform(Arc::clone(supervised), action, &cancel)
                        .await;
                }
            }
        }

        let health_loop = tokio::spawn(Arc::clone(&self.shared).health_loop(cancel.clone()));
        *runtime = Some(Runtime {
            cancel,
            health_loop,
        });
        self.shared.publish();
        info!(workers = self.shared.workers.len(), "Supervisor started");
        Ok(())
    }

    /// Stop the health loop and every worker in reverse start order.
    ///
    /// Individual stop failures are collected, never short-circuit the
    /// rest. Every worker ends in `Stopped`.
    #[instrument(skip(self))]
    pub async fn stop_all(&self) -> StopReport {
        if let Some(runtime) = self.runtime.lock().await.take() {
            runtime.cancel.cancel();
            if let Err(e) = runtime.health_loop.await {
                warn!(error = %e, "Health loop ended abnormally");
            }
        }
        let restarts: Vec<_> = std::mem::take(&mut *self.shared.restarts.lock());
        for handle in restarts {
            if let Err(e) = handle.await {
                warn!(error = %e, "Restart task ended abnormally");
            }
        }

        let mut report = StopReport::default();
        for supervised in self.shared.workers.iter().rev() {
            let name = supervised.name().to_string();
            match tokio::time::timeout(self.shared.config.stop_timeout, supervised.worker.stop())
                .await
            {
                Ok(Ok(())) => info!(worker = %name, "Worker stopped"),
                Ok(Err(e)) => {
                    warn!(worker = %name, error = %e, "Worker stop failed");
                    report.failures.push((name.clone(), e.to_string()));
                }
                Err(_) => {
                    warn!(worker = %name, "Worker stop timed out");
                    report.failures.push((name.clone(), "stop timed out".to_string()));
                }
            }
            {
                let mut record = supervised.record.lock();
                record.state = ServiceState::Stopped;
                record.running_since = None;
                record.restart_in_flight = false;
            }
            report.stopped.push(name);
        }

        self.shared.publish();
        if let Some(persistence) = &self.shared.persistence {
            if let Err(e) = persistence.upsert_service_state(&self.shared.report()).await {
                warn!(error = %e, "Failed to persist final health report");
            }
        }
        info!(
            stopped = report.stopped.len(),
            failures = report.failures.len(),
            "Supervisor stopped"
        );
        report
    }
}

impl Shared {
    fn report(&self) -> HealthReport {
        let now = Instant::now();
        let wall_now = Utc::now();
        let workers = self
            .workers
            .iter()
            .map(|supervised| {
                let record = supervised.record.lock();
                let circuit_open_until = record.breaker.open_until().and_then(|until| {
                    chrono::Duration::from_std(until.saturating_duration_since(now))
                        .ok()
                        .map(|remaining| wall_now + remaining)
                });
                WorkerSnapshot {
                    name: supervised.name().to_string(),
                    state: record.state,
                    restart_count: record.restart_count,
                    consecutive_restart_failures: record.breaker.consecutive_failures(),
                    uptime: record
                        .running_since
                        .map_or(Duration::ZERO, |since| now.saturating_duration_since(since)),
                    last_health_check_at: record.last_health_check_at,
                    circuit_state: record.breaker.state(),
                    circuit_open_until,
                }
            })
            .collect();
        HealthReport {
            generated_at: wall_now,
            workers,
        }
    }

    fn publish(&self) {
        self.report_tx.send_replace(self.report());
    }

    async fn health_loop(self: Arc<Self>, cancel: CancellationToken) {
        let interval = self.config.health_check_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_persisted: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            join_all(
                self.workers
                    .iter()
                    .map(|supervised| Arc::clone(&self).check(Arc::clone(supervised), &cancel)),
            )
            .await;
            self.publish();

            let due = last_persisted
                .is_none_or(|at| at.elapsed() >= self.config.report_interval);
            if due {
                last_persisted = Some(Instant::now());
                // Inline so `stop_all` never races a write still in flight.
                if let Some(persistence) = &self.persistence {
                    if let Err(e) = persistence.upsert_service_state(&self.report()).await {
                        warn!(error = %e, "Failed to persist health report");
                    }
                }
            }
        }
        debug!("Health loop stopped");
    }

    /// One health-check step for one worker.
    async fn check(self: Arc<Self>, supervised: Arc<Supervised>, cancel: &CancellationToken) {
        let step = {
            let mut record = supervised.record.lock();
            if record.state == ServiceState::Stopped || record.restart_in_flight {
                Step::Skip
            } else if record.state == ServiceState::StoppedFatal {
                if record.breaker.allow_attempt(Instant::now()) {
                    record.state = ServiceState::Restarting;
                    record.restart_in_flight = true;
                    Step::Trial
                } else {
                    Step::Skip
                }
            } else {
                Step::Probe
            }
        };
        match step {
            Step::Skip => return,
            Step::Trial => {
                info!(worker = %supervised.name(), "Circuit half-open, trial restart");
                let action = Action::Restart {
                    delay: Duration::ZERO,
                    reason: "circuit half-open trial".to_string(),
                };
                self.perform(supervised, action, cancel).await;
                return;
            }
            Step::Probe => {}
        }

        let status = tokio::time::timeout(self.config.probe_timeout, supervised.worker.is_healthy())
            .await
            .unwrap_or_else(|_| HealthStatus::Unhealthy("health probe timed out".to_string()));

        let action = {
            let mut record = supervised.record.lock();
            record.last_health_check_at = Some(Utc::now());
            self.transition(supervised.name(), &mut record, status)
        };
        self.perform(supervised, action, cancel).await;
    }

    fn transition(&self, name: &str, record: &mut Record, status: HealthStatus) -> Action {
        use ServiceState::{Degraded, Restarting, Running, Starting, Stopped, StoppedFatal};

        // A restart or stop may have raced the probe.
        if record.restart_in_flight || matches!(record.state, Stopped | StoppedFatal) {
            return Action::None;
        }

        match (record.state, status) {
            (Starting, HealthStatus::Healthy) => {
                enter_running(record);
                info!(worker = %name, "Worker running");
                Action::None
            }
            (Starting, HealthStatus::Unhealthy(reason)) => {
                let grace_over = record
                    .started_at
                    .is_none_or(|at| at.elapsed() >= self.config.startup_grace);
                if grace_over {
                    enter_running(record);
                    info!(worker = %name, %reason, "Startup grace elapsed, worker running");
                }
                Action::None
            }
            (Running, HealthStatus::Healthy) => Action::None,
            (Running, HealthStatus::Unhealthy(reason)) => {
                record.state = Degraded;
                warn!(worker = %name, %reason, "Worker degraded");
                Action::Alert(Severity::Warning, format!("worker '{name}' degraded: {reason}"))
            }
            (Degraded | Restarting, HealthStatus::Healthy) => {
                let recovered_from = record.state;
                if recovered_from == Restarting {
                    record.breaker.record_success();
                }
                enter_running(record);
                info!(worker = %name, from = %recovered_from, "Worker recovered");
                Action::None
            }
            (
                Starting | Running | Degraded | Restarting,
                HealthStatus::Unhealthy(reason) | HealthStatus::Fatal(reason),
            ) => self.escalate(record, reason),
            (Stopped | StoppedFatal, _) => Action::None,
        }
    }

    /// Record a restart-worthy failure and decide between restart and trip.
    fn escalate(&self, record: &mut Record, reason: String) -> Action {
        record.running_since = None;
        record.breaker.record_failure(Instant::now());
        if record.breaker.state() == CircuitState::Open {
            record.state = ServiceState::StoppedFatal;
            record.restart_in_flight = true;
            return Action::Trip {
                reason,
                open_for: self.config.open_duration,
            };
        }
        let delay = self.config.restart_backoff.delay(record.restart_count);
        record.state = ServiceState::Restarting;
        record.restart_in_flight = true;
        Action::Restart { delay, reason }
    }

    async fn perform(
        self: Arc<Self>,
        supervised: Arc<Supervised>,
        action: Action,
        cancel: &CancellationToken,
    ) {
        match action {
            Action::None => {}
            Action::Alert(severity, message) => self.notify(severity, &message).await,
            Action::Restart { delay, reason } => {
                warn!(
                    worker = %supervised.name(),
                    %reason,
                    delay_ms = delay.as_millis(),
                    "Scheduling worker restart"
                );
                let handle = tokio::spawn(
                    Arc::clone(&self).restart(supervised, delay, cancel.clone()),
                );
                let mut restarts = self.restarts.lock();
                restarts.retain(|h| !h.is_finished());
                restarts.push(handle);
            }
            Action::Trip { reason, open_for } => self.trip(&supervised, &reason, open_for).await,
        }
    }

    /// Restart loop: keeps retrying with backoff until a start succeeds,
    /// the breaker trips, or shutdown.
    async fn restart(
        self: Arc<Self>,
        supervised: Arc<Supervised>,
        mut delay: Duration,
        cancel: CancellationToken,
    ) {
        let name = supervised.name().to_string();
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }

            supervised.record.lock().restart_count += 1;
            if let Err(e) = supervised.worker.stop().await {
                debug!(worker = %name, error = %e, "Stop before restart failed");
            }
            if cancel.is_cancelled() {
                return;
            }

            let error = match supervised.worker.start().await {
                Ok(()) => {
                    let mut record = supervised.record.lock();
                    record.restart_in_flight = false;
                    info!(
                        worker = %name,
                        restart_count = record.restart_count,
                        "Worker restarted, awaiting health probe"
                    );
                    return;
                }
                Err(e) => e,
            };

            error!(worker = %name, error = %error, "Worker restart failed");
            let action = {
                let mut record = supervised.record.lock();
                self.escalate(&mut record, error.to_string())
            };
            match action {
                Action::Restart { delay: next, .. } => delay = next,
                Action::Trip { reason, open_for } => {
                    self.trip(&supervised, &reason, open_for).await;
                    return;
                }
                Action::None | Action::Alert(..) => return,
            }
        }
    }

    /// Hold a worker stopped while its breaker is open.
    async fn trip(&self, supervised: &Supervised, reason: &str, open_for: Duration) {
        let name = supervised.name();
        error!(
            worker = %name,
            %reason,
            open_for_secs = open_for.as_secs(),
            "Circuit breaker open, worker held stopped"
        );
        if let Err(e) = supervised.worker.stop().await {
            warn!(worker = %name, error = %e, "Stopping tripped worker failed");
        }
        supervised.record.lock().restart_in_flight = false;
        self.notify(
            Severity::Critical,
            &format!("worker '{name}' stopped: circuit open for {open_for:?} ({reason})"),
        )
        .await;
    }

    async fn notify(&self, severity: Severity, message: &str) {
        if let Some(alerts) = &self.alerts {
            alerts.notify(severity, message).await;
        }
    }
}

fn enter_running(record: &mut Record) {
    record.state = ServiceState::Running;
    record.running_since = Some(Instant::now());
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;

    struct FakeWorker {
        name: String,
        health: Mutex<HealthStatus>,
        start_results: Mutex<VecDeque<IngestResult<()>>>,
        starts: AtomicU32,
        fail_stop: bool,
        stop_log: Arc<Mutex<Vec<String>>>,
    }

    impl FakeWorker {
        fn new(name: &str, stop_log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                health: Mutex::new(HealthStatus::Healthy),
                start_results: Mutex::new(VecDeque::new()),
                starts: AtomicU32::new(0),
                fail_stop: false,
                stop_log: Arc::clone(stop_log),
            })
        }

        fn set_health(&self, status: HealthStatus) {
            *self.health.lock() = status;
        }
    }

    #[async_trait]
    impl Worker for FakeWorker {
        fn name(&self) -> &str {
            &self.name
        }

        async fn start(&self) -> IngestResult<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.start_results.lock().pop_front().unwrap_or(Ok(()))
        }

        async fn stop(&self) -> IngestResult<()> {
            self.stop_log.lock().push(self.name.clone());
            if self.fail_stop {
                Err(IngestError::FatalWorker("stop exploded".into()))
            } else {
                Ok(())
            }
        }

        async fn is_healthy(&self) -> HealthStatus {
            self.health.lock().clone()
        }
    }

    #[derive(Default)]
    struct RecordingAlerts(Mutex<Vec<Severity>>);

    #[async_trait]
    impl AlertSink for RecordingAlerts {
        async fn notify(&self, severity: Severity, _message: &str) {
            self.0.lock().push(severity);
        }
    }

    /// Sink whose writes take a scripted time; records completed reports.
    #[derive(Default)]
    struct SlowPersistence {
        delays: Mutex<VecDeque<Duration>>,
        written: Mutex<Vec<HealthReport>>,
    }

    #[async_trait]
    impl PersistenceSink for SlowPersistence {
        async fn upsert_quote(&self, _quote: &crate::domain::quote::Quote) -> IngestResult<()> {
            Ok(())
        }

        async fn upsert_service_state(&self, report: &HealthReport) -> IngestResult<()> {
            let delay = self.delays.lock().pop_front().unwrap_or_default();
            tokio::time::sleep(delay).await;
            self.written.lock().push(report.clone());
            Ok(())
        }
    }

    fn config() -> SupervisorConfig {
        let backoff =
            BackoffPolicy::exponential(Duration::from_millis(100), Duration::from_secs(1)).unwrap();
        SupervisorConfig::new(Duration::from_secs(1), backoff, 3, Duration::from_secs(60))
            .unwrap()
            .with_startup_grace(Duration::from_millis(1_500))
    }

    fn state_of(supervisor: &Supervisor, name: &str) -> ServiceState {
        supervisor.health_report().worker(name).unwrap().state
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_passing_probe_marks_running() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let worker = FakeWorker::new("feed", &log);
        let supervisor = Supervisor::new(config()).with_worker(worker).unwrap();

        supervisor.start_all().await.unwrap();
        assert_eq!(state_of(&supervisor, "feed"), ServiceState::Starting);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(state_of(&supervisor, "feed"), ServiceState::Running);
        assert!(supervisor.health_report().all_running());
        supervisor.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_grace_then_degraded() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let worker = FakeWorker::new("feed", &log);
        worker.set_health(HealthStatus::Unhealthy("warming up".into()));
        let alerts = Arc::new(RecordingAlerts::default());
        let supervisor = Supervisor::new(config())
            .with_worker(worker)
            .unwrap()
            .with_alerts(alerts.clone())
            .unwrap();

        supervisor.start_all().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(state_of(&supervisor, "feed"), ServiceState::Starting);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(state_of(&supervisor, "feed"), ServiceState::Running);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(state_of(&supervisor, "feed"), ServiceState::Degraded);
        assert_eq!(alerts.0.lock().as_slice(), &[Severity::Warning]);
        supervisor.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_worker_recovers_without_restart() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let worker = FakeWorker::new("feed", &log);
        let supervisor = Supervisor::new(config()).with_worker(worker.clone()).unwrap();

        supervisor.start_all().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        worker.set_health(HealthStatus::Unhealthy("lagging".into()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(state_of(&supervisor, "feed"), ServiceState::Degraded);

        worker.set_health(HealthStatus::Healthy);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(state_of(&supervisor, "feed"), ServiceState::Running);
        assert_eq!(worker.starts.load(Ordering::SeqCst), 1);
        supervisor.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_probe_restarts_immediately() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let worker = FakeWorker::new("feed", &log);
        let supervisor = Supervisor::new(config()).with_worker(worker.clone()).unwrap();

        supervisor.start_all().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        worker.set_health(HealthStatus::Fatal("poisoned state".into()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(state_of(&supervisor, "feed"), ServiceState::Restarting);

        worker.set_health(HealthStatus::Healthy);
        tokio::time::sleep(Duration::from_secs(1)).await;
        let snapshot = supervisor.health_report().worker("feed").cloned().unwrap();
        assert_eq!(snapshot.state, ServiceState::Running);
        assert_eq!(snapshot.restart_count, 1);
        assert_eq!(snapshot.consecutive_restart_failures, 0);
        assert_eq!(worker.starts.load(Ordering::SeqCst), 2);
        supervisor.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_and_blocks_restarts_until_cooldown() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let worker = FakeWorker::new("feed", &log);
        let alerts = Arc::new(RecordingAlerts::default());
        let supervisor = Supervisor::new(config())
            .with_worker(worker.clone())
            .unwrap()
            .with_alerts(alerts.clone())
            .unwrap();

        supervisor.start_all().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(state_of(&supervisor, "feed"), ServiceState::Running);
        worker.set_health(HealthStatus::Unhealthy("upstream gone".into()));

        // t=2 degraded; failures recorded at t=3 and t=4 (each followed by
        // a restart) and t=5, which opens the breaker until t=65.
        tokio::time::sleep(Duration::from_millis(4_400)).await;
        let snapshot = supervisor.health_report().worker("feed").cloned().unwrap();
        assert_eq!(snapshot.state, ServiceState::StoppedFatal);
        assert_eq!(snapshot.circuit_state, CircuitState::Open);
        assert!(snapshot.circuit_open_until.is_some());
        assert_eq!(snapshot.consecutive_restart_failures, 3);
        let starts_when_opened = worker.starts.load(Ordering::SeqCst);
        assert_eq!(starts_when_opened, 3);
        assert!(alerts.0.lock().contains(&Severity::Critical));

        // Nothing is attempted while the breaker is open.
        tokio::time::sleep(Duration::from_secs(55)).await;
        assert_eq!(worker.starts.load(Ordering::SeqCst), starts_when_opened);
        assert_eq!(state_of(&supervisor, "feed"), ServiceState::StoppedFatal);

        // Trial restart after the open duration; success closes the breaker.
        worker.set_health(HealthStatus::Healthy);
        tokio::time::sleep(Duration::from_secs(7)).await;
        let snapshot = supervisor.health_report().worker("feed").cloned().unwrap();
        assert_eq!(worker.starts.load(Ordering::SeqCst), starts_when_opened + 1);
        assert_eq!(snapshot.state, ServiceState::Running);
        assert_eq!(snapshot.circuit_state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_restart_failures, 0);
        supervisor.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_start_counts_against_breaker() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let worker = FakeWorker::new("feed", &log);
        for _ in 0..3 {
            worker
                .start_results
                .lock()
                .push_back(Err(IngestError::TransientIo("port busy".into())));
        }
        let supervisor = Supervisor::new(config()).with_worker(worker.clone()).unwrap();

        supervisor.start_all().await.unwrap();
        // Start, then restarts after 100ms and 200ms all fail.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(worker.starts.load(Ordering::SeqCst), 3);
        assert_eq!(state_of(&supervisor, "feed"), ServiceState::StoppedFatal);
        supervisor.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_reverse_order_tolerates_failures() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = FakeWorker::new("a", &log);
        let b = Arc::new(FakeWorker {
            name: "b".to_string(),
            health: Mutex::new(HealthStatus::Healthy),
            start_results: Mutex::new(VecDeque::new()),
            starts: AtomicU32::new(0),
            fail_stop: true,
            stop_log: Arc::clone(&log),
        });
        let c = FakeWorker::new("c", &log);
        let supervisor = Supervisor::new(config())
            .with_worker(a)
            .unwrap()
            .with_worker(b)
            .unwrap()
            .with_worker(c)
            .unwrap();

        supervisor.start_all().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        let report = supervisor.stop_all().await;

        assert_eq!(log.lock().as_slice(), &["c", "b", "a"]);
        assert_eq!(report.stopped, vec!["c", "b", "a"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "b");
        assert!(report.clone().into_result().is_err());
        assert!(supervisor
            .health_report()
            .workers
            .iter()
            .all(|w| w.state == ServiceState::Stopped));
    }

    #[test]
    fn test_duplicate_worker_names_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let result = Supervisor::new(config())
            .with_worker(FakeWorker::new("feed", &log))
            .unwrap()
            .with_worker(FakeWorker::new("feed", &log));
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_waits_for_periodic_report_write() {
        let stop_log = Arc::new(Mutex::new(Vec::new()));
        let persistence = Arc::new(SlowPersistence::default());
        persistence
            .delays
            .lock()
            .extend([Duration::from_secs(2), Duration::from_millis(10)]);
        let cfg = config().with_report_interval(Duration::from_secs(1)).unwrap();
        let supervisor = Supervisor::new(cfg)
            .with_persistence(persistence.clone())
            .unwrap()
            .with_worker(FakeWorker::new("feed", &stop_log))
            .unwrap();

        supervisor.start_all().await.unwrap();
        // The first periodic write starts at the 1s tick and takes 2s.
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        let report = supervisor.stop_all().await;
        assert!(report.is_clean());

        let written = persistence.written.lock().clone();
        assert_eq!(written.len(), 2);
        assert_eq!(written[1].worker("feed").unwrap().state, ServiceState::Stopped);

        // Nothing lands after shutdown to overwrite the final report.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(persistence.written.lock().len(), 2);
    }
}

//! Poller - Interval-driven Execution Engine
//!
//! Runs a `PollJob` every `interval ± jitter`. A tick that fires while
//! the previous cycle is still executing is skipped and counted, never
//! queued. Failed cycles are recorded and logged; the schedule keeps
//! going unless `max_consecutive_failures` is configured and reached.
//!
//! `stop()` is scoped: it returns only after the scheduler has exited
//! and any in-flight cycle has finished, so callers never observe torn
//! statistics after it returns.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{IngestError, IngestResult};

/// One unit of polled work.
#[async_trait]
pub trait PollJob: Send + Sync + 'static {
    /// Name used in logs, stats and supervisor reports.
    fn name(&self) -> &str;

    /// Execute one cycle. Returns the number of items processed.
    ///
    /// Blocking waits inside the cycle (rate limiter, network) must
    /// honour `cancel` so that `Poller::stop` completes in bounded time.
    async fn run(&self, cancel: &CancellationToken) -> IngestResult<usize>;
}

/// Scheduling parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollerConfig {
    interval: Duration,
    jitter_fraction: f64,
    max_consecutive_failures: Option<u32>,
    unhealthy_after: u32,
}

impl PollerConfig {
    /// Validated configuration.
    ///
    /// `jitter_fraction` must be in `[0, 1)`; each delay is drawn from
    /// `interval * (1 ± jitter_fraction)`.
    pub fn new(interval: Duration, jitter_fraction: f64) -> IngestResult<Self> {
        if interval.is_zero() {
            return Err(IngestError::config("poll interval must be positive"));
        }
        if !(0.0..1.0).contains(&jitter_fraction) {
            return Err(IngestError::config(format!(
                "poll jitter fraction must be in [0, 1), got {jitter_fraction}"
            )));
        }
        Ok(Self {
            interval,
            jitter_fraction,
            max_consecutive_failures: None,
            unhealthy_after: 3,
        })
    }

    /// Halt scheduling after this many consecutive failed cycles.
    pub fn with_max_consecutive_failures(mut self, max: u32) -> IngestResult<Self> {
        if max == 0 {
            return Err(IngestError::config("max_consecutive_failures must be >= 1"));
        }
        self.max_consecutive_failures = Some(max);
        Ok(self)
    }

    /// Report unhealthy once this many consecutive cycles have failed.
    pub fn with_unhealthy_after(mut self, failures: u32) -> IngestResult<Self> {
        if failures == 0 {
            return Err(IngestError::config("unhealthy_after must be >= 1"));
        }
        self.unhealthy_after = failures;
        Ok(self)
    }

    /// Nominal interval between cycles.
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    fn next_delay(&self) -> Duration {
        if self.jitter_fraction == 0.0 {
            return self.interval;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter_fraction..=self.jitter_fraction);
        self.interval.mul_f64(1.0 + spread)
    }
}

/// Running statistics. Counters are monotonic until `reset_stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollerStats {
    /// Completed cycles (`successes + failures`).
    pub runs: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    /// Ticks skipped because a cycle was still executing.
    pub skipped: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Whether cycles are being scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PollerLifecycle {
    Stopped,
    Started,
    /// Scheduling stopped itself after `max_consecutive_failures`.
    Halted,
    Stopping,
}

struct PollerInner {
    job: Arc<dyn PollJob>,
    config: PollerConfig,
    stats: Mutex<PollerStats>,
    lifecycle: Mutex<PollerLifecycle>,
    /// Held for the whole duration of a cycle.
    cycle_gate: Arc<tokio::sync::Mutex<()>>,
    halted: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl PollerInner {
    async fn execute_cycle(&self, cancel: &CancellationToken) -> Option<IngestResult<usize>> {
        let started_at = Utc::now();
        let outcome = AssertUnwindSafe(self.job.run(cancel))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(IngestError::FatalWorker("poll cycle panicked".into())));

        if outcome == Err(IngestError::Cancelled) {
            debug!(poller = %self.job.name(), "Poll cycle cancelled by shutdown");
            return None;
        }

        let mut stats = self.stats.lock();
        stats.runs += 1;
        stats.last_run_at = Some(started_at);
        match &outcome {
            Ok(items) => {
                stats.successes += 1;
                stats.consecutive_failures = 0;
                stats.last_success_at = Some(Utc::now());
                debug!(poller = %self.job.name(), items, "Poll cycle complete");
            }
            Err(e) => {
                stats.failures += 1;
                stats.consecutive_failures = stats.consecutive_failures.saturating_add(1);
                stats.last_error = Some(e.to_string());
                warn!(
                    poller = %self.job.name(),
                    error = %e,
                    consecutive = stats.consecutive_failures,
                    "Poll cycle failed"
                );
                if let Some(max) = self.config.max_consecutive_failures {
                    if stats.consecutive_failures >= max {
                        error!(
                            poller = %self.job.name(),
                            max,
                            "Consecutive failure limit reached, halting schedule"
                        );
                        self.halted.store(true, Ordering::SeqCst);
                        let mut lifecycle = self.lifecycle.lock();
                        if *lifecycle == PollerLifecycle::Started {
                            *lifecycle = PollerLifecycle::Halted;
                        }
                        drop(lifecycle);
                        cancel.cancel();
                    }
                }
            }
        }
        Some(outcome)
    }
}

/// Interval-driven executor for one `PollJob`.
pub struct Poller {
    inner: Arc<PollerInner>,
    scheduler: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Poller {
    /// Create a stopped poller.
    pub fn new(job: Arc<dyn PollJob>, config: PollerConfig) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                job,
                config,
                stats: Mutex::new(PollerStats::default()),
                lifecycle: Mutex::new(PollerLifecycle::Stopped),
                cycle_gate: Arc::new(tokio::sync::Mutex::new(())),
                halted: AtomicBool::new(false),
                cancel: Mutex::new(CancellationToken::new()),
            }),
            scheduler: tokio::sync::Mutex::new(None),
        }
    }

    /// Job name.
    pub fn name(&self) -> &str {
        self.inner.job.name()
    }

    /// Scheduling parameters.
    pub fn config(&self) -> &PollerConfig {
        &self.inner.config
    }

    /// Begin scheduling cycles. The first cycle runs immediately.
    ///
    /// Calling `start` on a started poller is a no-op.
    #[instrument(skip(self), fields(poller = %self.name()))]
    pub async fn start(&self) -> IngestResult<()> {
        let mut scheduler = self.scheduler.lock().await;
        if scheduler.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("Poller already started");
            return Ok(());
        }

        let cancel = CancellationToken::new();
        *self.inner.cancel.lock() = cancel.clone();
        self.inner.halted.store(false, Ordering::SeqCst);
        *self.inner.lifecycle.lock() = PollerLifecycle::Started;

        *scheduler = Some(tokio::spawn(schedule(Arc::clone(&self.inner), cancel)));
        info!(interval_ms = self.inner.config.interval.as_millis(), "Poller started");
        Ok(())
    }

    /// Stop scheduling and wait for any in-flight cycle to finish.
    #[instrument(skip(self), fields(poller = %self.name()))]
    pub async fn stop(&self) {
        let handle = self.scheduler.lock().await.take();
        *self.inner.lifecycle.lock() = PollerLifecycle::Stopping;
        self.inner.cancel.lock().cancel();

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Poller scheduler task ended abnormally");
            }
        }
        // Manual `run_once` cycles are not owned by the scheduler.
        drop(self.inner.cycle_gate.lock().await);

        *self.inner.lifecycle.lock() = PollerLifecycle::Stopped;
        info!("Poller stopped");
    }

    /// Run one cycle now, unless one is already executing.
    ///
    /// Returns `None` when skipped (counted in `skipped`) or cancelled.
    pub async fn run_once(&self) -> Option<IngestResult<usize>> {
        let Ok(_guard) = Arc::clone(&self.inner.cycle_gate).try_lock_owned() else {
            self.inner.stats.lock().skipped += 1;
            return None;
        };
        let cancel = self.inner.cancel.lock().clone();
        let cancel = if cancel.is_cancelled() {
            CancellationToken::new()
        } else {
            cancel
        };
        self.inner.execute_cycle(&cancel).await
    }

    /// Whether a cycle is executing right now.
    pub fn is_running(&self) -> bool {
        self.inner.cycle_gate.try_lock().is_err()
    }

    /// Current lifecycle position.
    pub fn lifecycle(&self) -> PollerLifecycle {
        *self.inner.lifecycle.lock()
    }

    /// Whether the schedule stopped itself after too many failures.
    pub fn is_halted(&self) -> bool {
        self.inner.halted.load(Ordering::SeqCst)
    }

    /// Consistent copy of the statistics.
    pub fn stats(&self) -> PollerStats {
        self.inner.stats.lock().clone()
    }

    /// Operator action: zero every counter.
    pub fn reset_stats(&self) {
        info!(poller = %self.name(), "Poller statistics reset");
        *self.inner.stats.lock() = PollerStats::default();
    }

    /// Started, not halted, and below the unhealthy failure streak.
    pub fn is_healthy(&self) -> bool {
        self.lifecycle() == PollerLifecycle::Started
            && !self.is_halted()
            && self.inner.stats.lock().consecutive_failures < self.inner.config.unhealthy_after
    }
}

async fn schedule(inner: Arc<PollerInner>, cancel: CancellationToken) {
    let mut cycles = JoinSet::new();
    let mut delay = Duration::ZERO;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
        delay = inner.config.next_delay();

        match Arc::clone(&inner.cycle_gate).try_lock_owned() {
            Ok(guard) => {
                let inner = Arc::clone(&inner);
                let cancel = cancel.clone();
                cycles.spawn(async move {
                    inner.execute_cycle(&cancel).await;
                    drop(guard);
                });
            }
            Err(_) => {
                let skipped = {
                    let mut stats = inner.stats.lock();
                    stats.skipped += 1;
                    stats.skipped
                };
                debug!(poller = %inner.job.name(), skipped, "Previous cycle still running, tick skipped");
            }
        }

        while cycles.try_join_next().is_some() {}
    }

    while let Some(result) = cycles.join_next().await {
        if let Err(e) = result {
            warn!(poller = %inner.job.name(), error = %e, "Poll cycle task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, AtomicUsize};

    use super::*;

    /// Job that sleeps for `work` and fails on configured call numbers.
    struct ScriptedJob {
        work: Duration,
        calls: AtomicU32,
        active: AtomicUsize,
        max_active: AtomicUsize,
        fail_on: Vec<u32>,
    }

    impl ScriptedJob {
        fn new(work: Duration, fail_on: Vec<u32>) -> Arc<Self> {
            Arc::new(Self {
                work,
                calls: AtomicU32::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                fail_on,
            })
        }
    }

    #[async_trait]
    impl PollJob for ScriptedJob {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn run(&self, cancel: &CancellationToken) -> IngestResult<usize> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);

            let result = tokio::select! {
                () = cancel.cancelled() => Err(IngestError::Cancelled),
                () = tokio::time::sleep(self.work) => {
                    if self.fail_on.contains(&call) {
                        Err(IngestError::TransientIo(format!("call {call} failed")))
                    } else {
                        Ok(1)
                    }
                }
            };
            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn config(interval_ms: u64) -> PollerConfig {
        PollerConfig::new(Duration::from_millis(interval_ms), 0.0).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_cycles_never_overlap() {
        let job = ScriptedJob::new(Duration::from_millis(250), vec![]);
        let poller = Poller::new(job.clone(), config(100));

        poller.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_050)).await;
        poller.stop().await;

        let stats = poller.stats();
        assert_eq!(job.max_active.load(Ordering::SeqCst), 1);
        assert!(stats.skipped > 0, "expected skipped ticks, got {stats:?}");
        assert_eq!(stats.runs, stats.successes + stats.failures);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_counted_and_schedule_continues() {
        let job = ScriptedJob::new(Duration::from_millis(1), vec![2, 3]);
        let poller = Poller::new(job.clone(), config(100));

        poller.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(450)).await;
        poller.stop().await;

        let stats = poller.stats();
        assert_eq!(stats.runs, 5);
        assert_eq!(stats.failures, 2);
        assert_eq!(stats.successes, 3);
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.last_error.as_deref(), Some("transient I/O error: call 3 failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_consecutive_failures_halts_schedule() {
        let job = ScriptedJob::new(Duration::from_millis(1), (1..=100).collect());
        let cfg = config(100).with_max_consecutive_failures(3).unwrap();
        let poller = Poller::new(job.clone(), cfg);

        poller.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(poller.is_halted());
        assert_eq!(poller.lifecycle(), PollerLifecycle::Halted);
        assert!(!poller.is_healthy());
        assert!(!poller.is_running());
        assert_eq!(job.calls.load(Ordering::SeqCst), 3);
        assert_eq!(poller.stats().consecutive_failures, 3);
        poller.stop().await;
        assert_eq!(poller.lifecycle(), PollerLifecycle::Stopped);

        // A fresh start clears the halt.
        poller.start().await.unwrap();
        assert_eq!(poller.lifecycle(), PollerLifecycle::Started);
        assert!(!poller.is_halted());
        poller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_in_flight_cycle() {
        let job = ScriptedJob::new(Duration::from_millis(500), vec![]);
        let poller = Poller::new(job.clone(), config(10_000));

        poller.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(poller.is_running());

        poller.stop().await;
        assert!(!poller.is_running());
        assert_eq!(poller.lifecycle(), PollerLifecycle::Stopped);
        assert_eq!(job.active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_once_skips_when_busy() {
        let job = ScriptedJob::new(Duration::from_millis(500), vec![]);
        let poller = Arc::new(Poller::new(job.clone(), config(10_000)));

        let first = {
            let poller = Arc::clone(&poller);
            tokio::spawn(async move { poller.run_once().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(poller.run_once().await.is_none());
        assert_eq!(first.await.unwrap(), Some(Ok(1)));
        assert_eq!(poller.stats().skipped, 1);
        assert_eq!(poller.stats().runs, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_stats_and_restart() {
        let job = ScriptedJob::new(Duration::from_millis(1), vec![1]);
        let poller = Poller::new(job, config(100));

        poller.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        poller.stop().await;
        assert!(poller.stats().runs >= 1);

        poller.reset_stats();
        assert_eq!(poller.stats(), PollerStats::default());

        poller.start().await.unwrap();
        assert_eq!(poller.lifecycle(), PollerLifecycle::Started);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(poller.is_healthy());
        poller.stop().await;
    }

    #[test]
    fn test_config_validation() {
        assert!(PollerConfig::new(Duration::ZERO, 0.0).is_err());
        assert!(PollerConfig::new(Duration::from_secs(1), 1.0).is_err());
        assert!(PollerConfig::new(Duration::from_secs(1), 0.2).is_ok());
    }
}

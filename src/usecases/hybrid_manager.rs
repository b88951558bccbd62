//! Hybrid Data Manager - One Read Path over Stream and Poll Sources
//!
//! Owns the quote cache and the components feeding it. Readers call
//! `get_quote` and never care which source produced the value.
//!
//! Background tasks while started:
//! - source arbiter: every `staleness_window / 2`, and on every stream
//!   state change, moves stale or orphaned instruments to the poll
//!   source and schedules a stream retry after `Failed`
//! - callback dispatcher: runs registered callbacks off the ingest path
//! - persistence drainer: forwards accepted quotes to the sink

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::quote::{InstrumentId, Quote};
use crate::domain::state::{ConnectionState, DataSourceStatus, PollHealth};
use crate::error::{IngestError, IngestResult};
use crate::ports::sinks::{AlertSink, PersistenceSink, QuoteSink, Severity};
use crate::usecases::poller::{Poller, PollerLifecycle};
use crate::usecases::quote_cache::{
    CacheStats, CallbackId, QuoteCache, QuoteCallback, run_callback_dispatcher,
    run_persistence_drainer,
};
use crate::usecases::stream_handler::StreamHandler;

/// Arbitration parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HybridConfig {
    staleness_window: Duration,
    stream_retry_cooldown: Duration,
    callback_queue: usize,
    persist_queue: usize,
}

impl HybridConfig {
    /// Validated configuration.
    pub fn new(staleness_window: Duration) -> IngestResult<Self> {
        if staleness_window < Duration::from_millis(2) {
            return Err(IngestError::config("staleness_window must be at least 2ms"));
        }
        Ok(Self {
            staleness_window,
            stream_retry_cooldown: Duration::from_secs(60),
            callback_queue: 1024,
            persist_queue: 4096,
        })
    }

    /// Delay before reconnecting a stream that reached `Failed`.
    pub fn with_stream_retry_cooldown(mut self, cooldown: Duration) -> IngestResult<Self> {
        if cooldown.is_zero() {
            return Err(IngestError::config("stream_retry_cooldown must be positive"));
        }
        self.stream_retry_cooldown = cooldown;
        Ok(self)
    }

    /// Bounded queue sizes for callback dispatch and persistence.
    pub fn with_queues(mut self, callback_queue: usize, persist_queue: usize) -> IngestResult<Self> {
        if callback_queue == 0 || persist_queue == 0 {
            return Err(IngestError::config("fan-out queue sizes must be >= 1"));
        }
        self.callback_queue = callback_queue;
        self.persist_queue = persist_queue;
        Ok(self)
    }

    pub const fn staleness_window(&self) -> Duration {
        self.staleness_window
    }
}

/// Fan-out receivers parked while the manager is stopped.
struct Parked {
    callbacks: Option<mpsc::Receiver<Quote>>,
    persistence: Option<mpsc::Receiver<Quote>>,
}

struct Running {
    arbiter_cancel: CancellationToken,
    arbiter: JoinHandle<()>,
    fanout_cancel: CancellationToken,
    dispatcher: JoinHandle<mpsc::Receiver<Quote>>,
    drainer: Option<JoinHandle<mpsc::Receiver<Quote>>>,
}

/// Stream-preferred, poll-backed quote service.
pub struct HybridDataManager {
    config: HybridConfig,
    cache: Arc<QuoteCache>,
    stream: Option<Arc<StreamHandler>>,
    pollers: Vec<Arc<Poller>>,
    persistence: Option<Arc<dyn PersistenceSink>>,
    alerts: Option<Arc<dyn AlertSink>>,
    parked: tokio::sync::Mutex<Parked>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl HybridDataManager {
    /// Create a manager with an empty cache.
    pub fn new(config: HybridConfig, persistence: Option<Arc<dyn PersistenceSink>>) -> Self {
        let persist_queue = persistence.as_ref().map(|_| config.persist_queue);
        let (cache, receivers) = QuoteCache::new(config.callback_queue, persist_queue);
        Self {
            config,
            cache: Arc::new(cache),
            stream: None,
            pollers: Vec::new(),
            persistence,
            alerts: None,
            parked: tokio::sync::Mutex::new(Parked {
                callbacks: Some(receivers.callbacks),
                persistence: receivers.persistence,
            }),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Ingestion entry point for pollers and stream handlers.
    pub fn ingress(&self) -> Arc<dyn QuoteSink> {
        Arc::clone(&self.cache) as Arc<dyn QuoteSink>
    }

    /// Attach a poller. Its interval must not exceed the staleness
    /// window, otherwise every check between two polls would fail over.
    pub fn with_poller(mut self, poller: Arc<Poller>) -> IngestResult<Self> {
        let interval = poller.config().interval();
        if self.config.staleness_window < interval {
            return Err(IngestError::config(format!(
                "staleness_window {:?} is shorter than the '{}' poll interval {interval:?}",
                self.config.staleness_window,
                poller.name()
            )));
        }
        self.pollers.push(poller);
        Ok(self)
    }

    /// Attach the stream handler.
    #[must_use]
    pub fn with_stream(mut self, stream: Arc<StreamHandler>) -> Self {
        self.stream = Some(stream);
        self
    }

    /// Attach an alert sink for failover and stream-loss notifications.
    #[must_use]
    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Most recently confirmed quote for an instrument.
    pub fn get_quote(&self, instrument_id: &str) -> Option<Quote> {
        self.cache.get(instrument_id)
    }

    /// Copy of the arbitration record for an instrument.
    pub fn source_status(&self, instrument_id: &str) -> Option<DataSourceStatus> {
        self.cache
            .status(instrument_id, self.stream_state(), self.poll_health())
    }

    /// Register a callback for every accepted quote.
    pub fn register_callback(&self, callback: QuoteCallback) -> CallbackId {
        self.cache.register_callback(callback)
    }

    /// Remove a callback. Returns whether it was registered.
    pub fn unregister_callback(&self, id: CallbackId) -> bool {
        self.cache.unregister_callback(id)
    }

    /// Cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Instruments observed so far.
    pub fn instruments(&self) -> Vec<InstrumentId> {
        self.cache.instruments()
    }

    /// Attached stream handler, if any.
    pub fn stream(&self) -> Option<&Arc<StreamHandler>> {
        self.stream.as_ref()
    }

    /// Attached pollers.
    pub fn pollers(&self) -> &[Arc<Poller>] {
        &self.pollers
    }

    /// Stream state, `Disconnected` when no stream is attached.
    pub fn stream_state(&self) -> ConnectionState {
        self.stream
            .as_ref()
            .map_or(ConnectionState::Disconnected, |s| s.state())
    }

    /// Aggregate health of the attached pollers.
    pub fn poll_health(&self) -> PollHealth {
        let active: Vec<_> = self
            .pollers
            .iter()
            .filter(|p| {
                matches!(p.lifecycle(), PollerLifecycle::Started | PollerLifecycle::Halted)
                    && p.stats().runs > 0
            })
            .collect();
        if active.is_empty() {
            PollHealth::Unknown
        } else if active.iter().all(|p| p.is_healthy()) {
            PollHealth::Healthy
        } else {
            PollHealth::Failing
        }
    }

    /// Whether `start` has been called without a matching `stop`.
    pub async fn is_started(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Start fan-out, sources and the arbiter. Subscribes the stream to
    /// `instruments`. A no-op when already started.
    #[instrument(skip(self, instruments), fields(instruments = instruments.len()))]
    pub async fn start(&self, instruments: &[InstrumentId]) -> IngestResult<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!("Hybrid manager already started");
            return Ok(());
        }

        // Sources first: a failed start must leave the fan-out queues parked.
        let mut parked = self.parked.lock().await;
        if parked.callbacks.is_none() {
            return Err(IngestError::FatalWorker("callback queue unavailable".into()));
        }
        if let Err(e) = self.start_sources(instruments).await {
            warn!(error = %e, "Hybrid manager start failed, sources rolled back");
            return Err(e);
        }

        let fanout_cancel = CancellationToken::new();
        let Some(callbacks) = parked.callbacks.take() else {
            return Err(IngestError::FatalWorker("callback queue unavailable".into()));
        };
        let dispatcher = tokio::spawn(run_callback_dispatcher(
            callbacks,
            self.cache.callback_list(),
            fanout_cancel.clone(),
        ));
        let drainer = match (parked.persistence.take(), &self.persistence) {
            (Some(rx), Some(sink)) => Some(tokio::spawn(run_persistence_drainer(
                rx,
                Arc::clone(sink),
                fanout_cancel.clone(),
            ))),
            (rx, _) => {
                parked.persistence = rx;
                None
            }
        };
        drop(parked);

        let arbiter_cancel = CancellationToken::new();
        let arbiter = Arbiter {
            cache: Arc::clone(&self.cache),
            stream: self.stream.clone(),
            alerts: self.alerts.clone(),
            staleness_window: self.config.staleness_window,
            retry_cooldown: self.config.stream_retry_cooldown,
        };
        let arbiter = tokio::spawn(arbiter.run(arbiter_cancel.clone()));

        *running = Some(Running {
            arbiter_cancel,
            arbiter,
            fanout_cancel,
            dispatcher,
            drainer,
        });
        info!(
            pollers = self.pollers.len(),
            stream = self.stream.is_some(),
            staleness_window_ms = self.config.staleness_window.as_millis(),
            "Hybrid data manager started"
        );
        Ok(())
    }

    /// Connect the stream and start every poller. On failure, whatever
    /// already started is stopped again.
    async fn start_sources(&self, instruments: &[InstrumentId]) -> IngestResult<()> {
        if let Some(stream) = &self.stream {
            stream.subscribe(instruments);
            stream.connect().await?;
        }
        for (started, poller) in self.pollers.iter().enumerate() {
            if let Err(e) = poller.start().await {
                for earlier in &self.pollers[..started] {
                    earlier.stop().await;
                }
                if let Some(stream) = &self.stream {
                    if let Err(close_err) = stream.close().await {
                        debug!(error = %close_err, "Stream close during rollback failed");
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Stop sources, the arbiter and fan-out, then clear the status
    /// table. Cached quotes stay readable.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> IngestResult<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        let mut first_error = None;

        running.arbiter_cancel.cancel();
        if let Err(e) = running.arbiter.await {
            warn!(error = %e, "Source arbiter ended abnormally");
        }

        if let Some(stream) = &self.stream {
            if let Err(e) = stream.close().await {
                warn!(error = %e, "Stream close failed");
                first_error.get_or_insert(e);
            }
        }
        for poller in &self.pollers {
            poller.stop().await;
        }

        running.fanout_cancel.cancel();
        let mut parked = self.parked.lock().await;
        match running.dispatcher.await {
            Ok(rx) => parked.callbacks = Some(rx),
            Err(e) => {
                error!(error = %e, "Callback dispatcher ended abnormally");
                first_error.get_or_insert(IngestError::FatalWorker(e.to_string()));
            }
        }
        if let Some(drainer) = running.drainer {
            match drainer.await {
                Ok(rx) => parked.persistence = Some(rx),
                Err(e) => error!(error = %e, "Persistence drainer ended abnormally"),
            }
        }
        drop(parked);

        self.cache.clear_status();
        info!("Hybrid data manager stopped");
        first_error.map_or(Ok(()), Err)
    }
}

enum Wake {
    Tick,
    StateChanged,
    StreamGone,
    Retry,
}

/// Background source arbitration.
struct Arbiter {
    cache: Arc<QuoteCache>,
    stream: Option<Arc<StreamHandler>>,
    alerts: Option<Arc<dyn AlertSink>>,
    staleness_window: Duration,
    retry_cooldown: Duration,
}

impl Arbiter {
    async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.staleness_window / 2);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut state_rx = self.stream.as_ref().map(|s| s.watch_state());
        let mut retry_at: Option<Instant> = None;
        let mut last_state: Option<ConnectionState> = None;

        loop {
            let wake = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = sleep_until(retry_at) => Wake::Retry,
                changed = state_changed(&mut state_rx) => {
                    if changed { Wake::StateChanged } else { Wake::StreamGone }
                }
                _ = ticker.tick() => Wake::Tick,
            };

            match wake {
                Wake::StreamGone => {
                    state_rx = None;
                    continue;
                }
                Wake::Retry => {
                    retry_at = None;
                    self.retry_stream().await;
                    continue;
                }
                Wake::Tick | Wake::StateChanged => {}
            }

            let Some(stream) = &self.stream else {
                continue;
            };
            let state = stream.state();
            if last_state != Some(state) {
                last_state = Some(state);
                if state == ConnectionState::Failed && retry_at.is_none() {
                    retry_at = Some(Instant::now() + self.retry_cooldown);
                    self.notify(
                        Severity::Warning,
                        &format!(
                            "stream '{}' failed, serving poll data; retry in {:?}",
                            stream.name(),
                            self.retry_cooldown
                        ),
                    )
                    .await;
                }
            }
            self.arbitrate(state);
        }
        debug!("Source arbiter stopped");
    }

    fn arbitrate(&self, state: ConnectionState) {
        let moved = if state == ConnectionState::Subscribed {
            self.cache.fail_over_stale(self.staleness_window, Instant::now())
        } else {
            self.cache.fail_over_all()
        };
        if !moved.is_empty() {
            warn!(
                stream_state = %state,
                count = moved.len(),
                instruments = ?moved,
                "Instruments failed over to poll"
            );
        }
    }

    async fn retry_stream(&self) {
        let Some(stream) = &self.stream else {
            return;
        };
        if stream.state() != ConnectionState::Failed {
            return;
        }
        info!(stream = %stream.name(), "Retrying failed stream after cooldown");
        if let Err(e) = stream.connect().await {
            error!(stream = %stream.name(), error = %e, "Stream retry failed");
        }
    }

    async fn notify(&self, severity: Severity, message: &str) {
        if let Some(alerts) = &self.alerts {
            alerts.notify(severity, message).await;
        }
    }
}

async fn state_changed(rx: &mut Option<watch::Receiver<ConnectionState>>) -> bool {
    match rx {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

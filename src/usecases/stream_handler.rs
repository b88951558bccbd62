//! Stream Handler - Persistent Connection with Reconnect Policy
//!
//! Drives a `StreamConnector` through
//! `Connecting -> Connected -> Authenticated -> Subscribed` and keeps it
//! there. Any failure moves to `Reconnecting`, waits a backoff delay and
//! replays the whole sequence, including every subscription made so
//! far. Too many consecutive failures (or too many rejected credentials)
//! park the handler in `Failed` until someone calls `connect()` again.
//!
//! Frames are decoded by a `FrameDecoder`; quotes go to the `QuoteSink`,
//! control frames are counted, malformed frames are dropped and counted.
//!
//! State changes are published on a `watch` channel so the hybrid
//! manager can react to them without polling.

use std::collections::BTreeSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::domain::backoff::BackoffPolicy;
use crate::domain::quote::{InstrumentId, QuoteSource};
use crate::domain::state::ConnectionState;
use crate::error::{IngestError, IngestResult};
use crate::ports::sinks::{AlertSink, QuoteSink, Severity};
use crate::ports::stream_connector::{FrameDecoder, StreamConnector, StreamFrame};

/// Reconnect and liveness parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamConfig {
    backoff: BackoffPolicy,
    max_reconnect_attempts: u32,
    auth_retry_budget: u32,
    stable_after: Duration,
    receive_timeout: Option<Duration>,
}

impl StreamConfig {
    /// Validated configuration. `max_reconnect_attempts` counts retries
    /// after the initial attempt.
    pub fn new(backoff: BackoffPolicy, max_reconnect_attempts: u32) -> IngestResult<Self> {
        if max_reconnect_attempts == 0 {
            return Err(IngestError::config("max_reconnect_attempts must be >= 1"));
        }
        Ok(Self {
            backoff,
            max_reconnect_attempts,
            auth_retry_budget: 2,
            stable_after: Duration::from_secs(30),
            receive_timeout: None,
        })
    }

    /// Retries allowed after rejected credentials.
    pub const fn with_auth_retry_budget(mut self, budget: u32) -> Self {
        self.auth_retry_budget = budget;
        self
    }

    /// How long a subscribed connection must survive before the backoff
    /// attempt counter resets.
    pub fn with_stable_after(mut self, stable_after: Duration) -> IngestResult<Self> {
        if stable_after.is_zero() {
            return Err(IngestError::config("stable_after must be positive"));
        }
        self.stable_after = stable_after;
        Ok(self)
    }

    /// Treat a silent connection as failed after this long.
    pub fn with_receive_timeout(mut self, timeout: Duration) -> IngestResult<Self> {
        if timeout.is_zero() {
            return Err(IngestError::config("receive_timeout must be positive"));
        }
        self.receive_timeout = Some(timeout);
        Ok(self)
    }

    pub const fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }
}

/// Counters for one stream handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub frames: u64,
    pub quotes: u64,
    pub control_frames: u64,
    pub malformed_frames: u64,
    pub reconnects: u64,
    pub auth_failures: u64,
    /// Failures since the last stable connection.
    pub consecutive_failures: u32,
}

#[derive(Debug, Default)]
struct Attempts {
    failures: u32,
    auth_failures: u32,
}

struct StreamInner {
    name: String,
    config: StreamConfig,
    decoder: Arc<dyn FrameDecoder>,
    sink: Arc<dyn QuoteSink>,
    alerts: Option<Arc<dyn AlertSink>>,
    state_tx: watch::Sender<ConnectionState>,
    subscriptions: Mutex<BTreeSet<InstrumentId>>,
    commands: Mutex<Option<mpsc::UnboundedSender<Vec<InstrumentId>>>>,
    stats: Mutex<StreamStats>,
}

enum Slot {
    Idle(Box<dyn StreamConnector>),
    Running {
        cancel: CancellationToken,
        handle: JoinHandle<Box<dyn StreamConnector>>,
    },
    /// Connector lost to an aborted session task.
    Empty,
}

/// Owner of one streaming connection.
pub struct StreamHandler {
    inner: Arc<StreamInner>,
    slot: tokio::sync::Mutex<Slot>,
}

impl StreamHandler {
    /// Create a disconnected handler.
    pub fn new(
        name: impl Into<String>,
        connector: Box<dyn StreamConnector>,
        decoder: Arc<dyn FrameDecoder>,
        sink: Arc<dyn QuoteSink>,
        config: StreamConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(StreamInner {
                name: name.into(),
                config,
                decoder,
                sink,
                alerts: None,
                state_tx,
                subscriptions: Mutex::new(BTreeSet::new()),
                commands: Mutex::new(None),
                stats: Mutex::new(StreamStats::default()),
            }),
            slot: tokio::sync::Mutex::new(Slot::Idle(connector)),
        }
    }

    /// Raise a critical alert when the handler gives up.
    ///
    /// Must be called before the handler is shared.
    #[must_use]
    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.alerts = Some(alerts);
        }
        self
    }

    /// Handler name used in logs.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> StreamStats {
        *self.inner.stats.lock()
    }

    /// Instruments replayed on every (re)connect.
    pub fn subscriptions(&self) -> Vec<InstrumentId> {
        self.inner.subscriptions.lock().iter().cloned().collect()
    }

    /// Add instruments to the subscription set.
    ///
    /// Already-subscribed instruments are ignored. New ones are sent to a
    /// live session immediately, and replayed after every reconnect.
    /// Returns how many instruments were new.
    pub fn subscribe(&self, instrument_ids: &[InstrumentId]) -> usize {
        let added: Vec<InstrumentId> = {
            let mut subscriptions = self.inner.subscriptions.lock();
            instrument_ids
                .iter()
                .filter(|id| subscriptions.insert((*id).clone()))
                .cloned()
                .collect()
        };
        if added.is_empty() {
            return 0;
        }
        debug!(stream = %self.inner.name, count = added.len(), "Subscriptions added");
        let count = added.len();
        if let Some(tx) = self.inner.commands.lock().as_ref() {
            // A closed channel means no live session; the set is replayed on connect.
            let _ = tx.send(added);
        }
        count
    }

    /// Start (or restart after `Failed`) the connection task.
    ///
    /// A no-op while a session task is alive.
    #[instrument(skip(self), fields(stream = %self.inner.name))]
    pub async fn connect(&self) -> IngestResult<()> {
        let mut slot = self.slot.lock().await;
        let connector = match std::mem::replace(&mut *slot, Slot::Empty) {
            Slot::Idle(connector) => connector,
            Slot::Running { handle, .. } if handle.is_finished() => match handle.await {
                Ok(connector) => connector,
                Err(e) => {
                    return Err(IngestError::FatalWorker(format!(
                        "stream session task lost its connector: {e}"
                    )));
                }
            },
            running @ Slot::Running { .. } => {
                *slot = running;
                return Ok(());
            }
            Slot::Empty => {
                return Err(IngestError::FatalWorker("stream connector unavailable".into()));
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.commands.lock() = Some(tx);
        let cancel = CancellationToken::new();
        self.inner.stats.lock().consecutive_failures = 0;
        self.inner.set_state(ConnectionState::Connecting);

        let handle = tokio::spawn(run(
            Arc::clone(&self.inner),
            connector,
            rx,
            cancel.clone(),
        ));
        *slot = Slot::Running { cancel, handle };
        info!("Stream connection task started");
        Ok(())
    }

    /// Stop the session, close the transport and settle in `Disconnected`.
    #[instrument(skip(self), fields(stream = %self.inner.name))]
    pub async fn close(&self) -> IngestResult<()> {
        let mut slot = self.slot.lock().await;
        self.inner.commands.lock().take();

        let result = match std::mem::replace(&mut *slot, Slot::Empty) {
            Slot::Running { cancel, handle } => {
                cancel.cancel();
                match handle.await {
                    Ok(connector) => {
                        *slot = Slot::Idle(connector);
                        Ok(())
                    }
                    Err(e) => Err(IngestError::FatalWorker(format!(
                        "stream session task failed: {e}"
                    ))),
                }
            }
            idle @ Slot::Idle(_) => {
                *slot = idle;
                Ok(())
            }
            Slot::Empty => Ok(()),
        };

        self.inner.set_state(ConnectionState::Disconnected);
        info!("Stream closed");
        result
    }
}

impl StreamInner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(stream = %self.name, from = %previous, to = %state, "Connection state changed");
        }
    }

    fn handle_frame(&self, raw: &str) {
        let decoded = self.decoder.decode(raw);
        let mut stats = self.stats.lock();
        stats.frames += 1;
        match decoded {
            Ok(StreamFrame::Quote(mut quote)) => {
                stats.quotes += 1;
                drop(stats);
                quote.source = QuoteSource::Stream;
                let instrument = quote.instrument_id.clone();
                let outcome = self.sink.ingest(quote);
                trace!(stream = %self.name, %instrument, ?outcome, "Stream quote ingested");
            }
            Ok(StreamFrame::Heartbeat) => {
                stats.control_frames += 1;
                trace!(stream = %self.name, "Heartbeat");
            }
            Ok(StreamFrame::Subscribed(ids)) => {
                stats.control_frames += 1;
                debug!(stream = %self.name, count = ids.len(), "Subscription acknowledged");
            }
            Ok(StreamFrame::Error(message)) => {
                stats.control_frames += 1;
                warn!(stream = %self.name, %message, "Upstream reported an error");
            }
            Err(e) => {
                stats.malformed_frames += 1;
                debug!(stream = %self.name, error = %e, "Malformed frame dropped");
            }
        }
    }

    /// One connect-to-failure session. `Ok(())` means cancelled.
    async fn session(
        &self,
        connector: &mut dyn StreamConnector,
        commands: &mut mpsc::UnboundedReceiver<Vec<InstrumentId>>,
        cancel: &CancellationToken,
        attempts: &mut Attempts,
    ) -> IngestResult<()> {
        self.set_state(ConnectionState::Connecting);
        cancellable(cancel, connector.connect()).await?;
        self.set_state(ConnectionState::Connected);

        cancellable(cancel, connector.authenticate()).await?;
        self.set_state(ConnectionState::Authenticated);

        // The full set below already covers anything queued so far.
        while commands.try_recv().is_ok() {}
        let snapshot: Vec<InstrumentId> = self.subscriptions.lock().iter().cloned().collect();
        if !snapshot.is_empty() {
            cancellable(cancel, connector.subscribe(&snapshot)).await?;
        }
        self.set_state(ConnectionState::Subscribed);
        info!(stream = %self.name, instruments = snapshot.len(), "Stream subscribed");

        let stable = tokio::time::sleep(self.config.stable_after);
        tokio::pin!(stable);
        let mut stable_pending = attempts.failures > 0 || attempts.auth_failures > 0;

        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                Some(ids) = commands.recv() => Event::Subscribe(ids),
                () = &mut stable, if stable_pending => Event::Stable,
                frame = receive(connector, self.config.receive_timeout) => Event::Frame(frame),
            };

            match event {
                Event::Subscribe(ids) => {
                    cancellable(cancel, connector.subscribe(&ids)).await?;
                    debug!(stream = %self.name, count = ids.len(), "Live subscription sent");
                }
                Event::Stable => {
                    stable_pending = false;
                    *attempts = Attempts::default();
                    self.stats.lock().consecutive_failures = 0;
                    info!(stream = %self.name, "Connection stable, backoff reset");
                }
                Event::Frame(frame) => match frame {
                    Ok(Some(raw)) => self.handle_frame(&raw),
                    Ok(None) => {
                        return Err(IngestError::TransientIo("stream closed by peer".into()));
                    }
                    // Unreadable message on a live transport; the session survives.
                    Err(IngestError::Protocol(e)) => {
                        let mut stats = self.stats.lock();
                        stats.frames += 1;
                        stats.malformed_frames += 1;
                        drop(stats);
                        warn!(stream = %self.name, error = %e, "Malformed transport frame dropped");
                    }
                    Err(e) => return Err(e),
                },
            }
        }
    }

    async fn raise(&self, message: &str) {
        if let Some(alerts) = &self.alerts {
            alerts.notify(Severity::Critical, message).await;
        }
    }
}

enum Event {
    Subscribe(Vec<InstrumentId>),
    Stable,
    Frame(IngestResult<Option<String>>),
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    operation: impl Future<Output = IngestResult<T>>,
) -> IngestResult<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(IngestError::Cancelled),
        result = operation => result,
    }
}

async fn receive(
    connector: &mut dyn StreamConnector,
    timeout: Option<Duration>,
) -> IngestResult<Option<String>> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, connector.receive())
            .await
            .map_err(|_| IngestError::TransientIo(format!("no frame received within {limit:?}")))?,
        None => connector.receive().await,
    }
}

/// Connection task: sessions separated by backoff until cancelled or
/// out of attempts. Hands the connector back for the next `connect()`.
async fn run(
    inner: Arc<StreamInner>,
    mut connector: Box<dyn StreamConnector>,
    mut commands: mpsc::UnboundedReceiver<Vec<InstrumentId>>,
    cancel: CancellationToken,
) -> Box<dyn StreamConnector> {
    let mut attempts = Attempts::default();

    loop {
        let result = AssertUnwindSafe(inner.session(
            connector.as_mut(),
            &mut commands,
            &cancel,
            &mut attempts,
        ))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(IngestError::FatalWorker("stream session panicked".into())));

        if let Err(e) = connector.close().await {
            debug!(stream = %inner.name, error = %e, "Transport close failed");
        }

        let error = match result {
            Ok(()) | Err(IngestError::Cancelled) => break,
            Err(e) => e,
        };

        attempts.failures = attempts.failures.saturating_add(1);
        let is_auth = matches!(error, IngestError::Auth(_));
        if is_auth {
            attempts.auth_failures = attempts.auth_failures.saturating_add(1);
        }
        {
            let mut stats = inner.stats.lock();
            stats.consecutive_failures = attempts.failures;
            if is_auth {
                stats.auth_failures += 1;
            }
        }

        let config = &inner.config;
        let auth_exhausted = is_auth && attempts.auth_failures > config.auth_retry_budget;
        if auth_exhausted || attempts.failures > config.max_reconnect_attempts {
            inner.set_state(ConnectionState::Failed);
            error!(
                stream = %inner.name,
                error = %error,
                failures = attempts.failures,
                auth_failures = attempts.auth_failures,
                "Stream failed, giving up on reconnects"
            );
            inner
                .raise(&format!("stream '{}' failed: {error}", inner.name))
                .await;
            break;
        }

        let delay = config.backoff.delay(attempts.failures - 1);
        inner.set_state(ConnectionState::Reconnecting);
        inner.stats.lock().reconnects += 1;
        warn!(
            stream = %inner.name,
            error = %error,
            attempt = attempts.failures,
            delay_ms = delay.as_millis(),
            "Stream disconnected, reconnecting"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    connector
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::time::Instant;

    use super::*;
    use crate::domain::quote::Quote;
    use crate::ports::sinks::IngestOutcome;

    type Script = Arc<Mutex<VecDeque<IngestResult<()>>>>;

    struct FakeConnector {
        connect_script: Script,
        auth_script: Script,
        frames: mpsc::UnboundedReceiver<IngestResult<Option<String>>>,
        subscribed: Arc<Mutex<Vec<Vec<InstrumentId>>>>,
        connects: Arc<AtomicU32>,
    }

    #[async_trait]
    impl StreamConnector for FakeConnector {
        async fn connect(&mut self) -> IngestResult<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.connect_script.lock().pop_front().unwrap_or(Ok(()))
        }

        async fn authenticate(&mut self) -> IngestResult<()> {
            self.auth_script.lock().pop_front().unwrap_or(Ok(()))
        }

        async fn subscribe(&mut self, instrument_ids: &[InstrumentId]) -> IngestResult<()> {
            self.subscribed.lock().push(instrument_ids.to_vec());
            Ok(())
        }

        async fn receive(&mut self) -> IngestResult<Option<String>> {
            match self.frames.recv().await {
                Some(frame) => frame,
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) -> IngestResult<()> {
            Ok(())
        }
    }

    /// `q:<id>:<value>` is a score quote, `hb` a heartbeat.
    struct LineDecoder;

    impl FrameDecoder for LineDecoder {
        fn decode(&self, raw: &str) -> IngestResult<StreamFrame> {
            if raw == "hb" {
                return Ok(StreamFrame::Heartbeat);
            }
            let mut parts = raw.split(':');
            match (parts.next(), parts.next(), parts.next()) {
                (Some("q"), Some(id), Some(value)) => {
                    let value = value
                        .parse()
                        .map_err(|_| IngestError::Protocol(format!("bad value in {raw}")))?;
                    Ok(StreamFrame::Quote(Quote::score(
                        id,
                        value,
                        QuoteSource::Poll,
                        Utc::now(),
                    )))
                }
                _ => Err(IngestError::Protocol(format!("unknown frame {raw}"))),
            }
        }
    }

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<Quote>>);

    impl QuoteSink for RecordingSink {
        fn ingest(&self, quote: Quote) -> IngestOutcome {
            self.0.lock().push(quote);
            IngestOutcome::Applied
        }
    }

    #[derive(Default)]
    struct RecordingAlerts(Mutex<Vec<(Severity, String)>>);

    #[async_trait]
    impl AlertSink for RecordingAlerts {
        async fn notify(&self, severity: Severity, message: &str) {
            self.0.lock().push((severity, message.to_string()));
        }
    }

    struct Harness {
        handler: StreamHandler,
        frames: mpsc::UnboundedSender<IngestResult<Option<String>>>,
        connect_script: Script,
        auth_script: Script,
        subscribed: Arc<Mutex<Vec<Vec<InstrumentId>>>>,
        connects: Arc<AtomicU32>,
        sink: Arc<RecordingSink>,
        alerts: Arc<RecordingAlerts>,
    }

    fn harness(config: StreamConfig) -> Harness {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let connect_script = Script::default();
        let auth_script = Script::default();
        let subscribed = Arc::new(Mutex::new(Vec::new()));
        let connects = Arc::new(AtomicU32::new(0));
        let connector = FakeConnector {
            connect_script: Arc::clone(&connect_script),
            auth_script: Arc::clone(&auth_script),
            frames: frames_rx,
            subscribed: Arc::clone(&subscribed),
            connects: Arc::clone(&connects),
        };
        let sink = Arc::new(RecordingSink::default());
        let alerts = Arc::new(RecordingAlerts::default());
        let handler = StreamHandler::new(
            "test-stream",
            Box::new(connector),
            Arc::new(LineDecoder),
            sink.clone(),
            config,
        )
        .with_alerts(alerts.clone());
        Harness {
            handler,
            frames: frames_tx,
            connect_script,
            auth_script,
            subscribed,
            connects,
            sink,
            alerts,
        }
    }

    fn config(max_reconnect_attempts: u32) -> StreamConfig {
        let backoff =
            BackoffPolicy::exponential(Duration::from_millis(100), Duration::from_secs(1)).unwrap();
        StreamConfig::new(backoff, max_reconnect_attempts).unwrap()
    }

    async fn wait_for(handler: &StreamHandler, state: ConnectionState) {
        let mut rx = handler.watch_state();
        rx.wait_for(|s| *s == state).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_and_frame_handling() {
        let h = harness(config(3));
        h.handler.subscribe(&["A".to_string(), "B".to_string()]);
        h.handler.connect().await.unwrap();
        wait_for(&h.handler, ConnectionState::Subscribed).await;

        h.frames.send(Ok(Some("q:A:1.5".into()))).unwrap();
        h.frames.send(Ok(Some("hb".into()))).unwrap();
        h.frames.send(Ok(Some("{garbage".into()))).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stats = h.handler.stats();
        assert_eq!(stats.frames, 3);
        assert_eq!(stats.quotes, 1);
        assert_eq!(stats.control_frames, 1);
        assert_eq!(stats.malformed_frames, 1);
        assert_eq!(h.handler.state(), ConnectionState::Subscribed);

        let ingested = h.sink.0.lock().clone();
        assert_eq!(ingested.len(), 1);
        assert_eq!(ingested[0].source, QuoteSource::Stream);
        assert_eq!(h.subscribed.lock()[0], vec!["A".to_string(), "B".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_transport_frame_keeps_session() {
        let h = harness(config(3));
        h.handler.subscribe(&["A".to_string()]);
        h.handler.connect().await.unwrap();
        wait_for(&h.handler, ConnectionState::Subscribed).await;

        h.frames
            .send(Err(IngestError::Protocol("binary frame is not utf-8".into())))
            .unwrap();
        h.frames.send(Ok(Some("q:A:2.0".into()))).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stats = h.handler.stats();
        assert_eq!(h.handler.state(), ConnectionState::Subscribed);
        assert_eq!(h.connects.load(Ordering::SeqCst), 1);
        assert_eq!(stats.reconnects, 0);
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.malformed_frames, 1);
        assert_eq!(stats.quotes, 1);
        assert_eq!(h.sink.0.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_then_fails() {
        let h = harness(config(3));
        for _ in 0..10 {
            h.connect_script
                .lock()
                .push_back(Err(IngestError::TransientIo("refused".into())));
        }

        let start = Instant::now();
        h.handler.connect().await.unwrap();
        wait_for(&h.handler, ConnectionState::Failed).await;

        // 100 + 200 + 400 ms between the four attempts.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(700), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(800), "elapsed {elapsed:?}");
        assert_eq!(h.connects.load(Ordering::SeqCst), 4);
        assert_eq!(h.handler.stats().reconnects, 3);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let alerts = h.alerts.0.lock().clone();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].0, Severity::Critical);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failures_use_separate_budget() {
        let h = harness(config(10).with_auth_retry_budget(1));
        for _ in 0..5 {
            h.auth_script
                .lock()
                .push_back(Err(IngestError::Auth("bad signature".into())));
        }

        h.handler.connect().await.unwrap();
        wait_for(&h.handler, ConnectionState::Failed).await;

        assert_eq!(h.connects.load(Ordering::SeqCst), 2);
        assert_eq!(h.handler.stats().auth_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscriptions_replayed_after_reconnect() {
        let h = harness(config(5));
        h.handler.subscribe(&["A".to_string()]);
        h.handler.connect().await.unwrap();
        wait_for(&h.handler, ConnectionState::Subscribed).await;

        h.frames.send(Ok(None)).unwrap();
        wait_for(&h.handler, ConnectionState::Reconnecting).await;
        wait_for(&h.handler, ConnectionState::Subscribed).await;

        assert_eq!(h.handler.subscribe(&["A".to_string(), "C".to_string()]), 1);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let calls = h.subscribed.lock().clone();
        assert_eq!(
            calls,
            vec![
                vec!["A".to_string()],
                vec!["A".to_string()],
                vec!["C".to_string()],
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stable_connection_resets_failures() {
        let cfg = config(5).with_stable_after(Duration::from_secs(1)).unwrap();
        let h = harness(cfg);
        h.connect_script
            .lock()
            .push_back(Err(IngestError::TransientIo("refused".into())));

        h.handler.connect().await.unwrap();
        wait_for(&h.handler, ConnectionState::Subscribed).await;
        assert_eq!(h.handler.stats().consecutive_failures, 1);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(h.handler.stats().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_settles_disconnected_and_reconnects() {
        let h = harness(config(3));
        h.handler.connect().await.unwrap();
        wait_for(&h.handler, ConnectionState::Subscribed).await;

        h.handler.close().await.unwrap();
        assert_eq!(h.handler.state(), ConnectionState::Disconnected);

        h.handler.connect().await.unwrap();
        wait_for(&h.handler, ConnectionState::Subscribed).await;
        assert_eq!(h.connects.load(Ordering::SeqCst), 2);
        h.handler.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_after_failed_restarts_session() {
        let h = harness(config(1));
        for _ in 0..2 {
            h.connect_script
                .lock()
                .push_back(Err(IngestError::TransientIo("refused".into())));
        }
        h.handler.connect().await.unwrap();
        wait_for(&h.handler, ConnectionState::Failed).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        h.handler.connect().await.unwrap();
        wait_for(&h.handler, ConnectionState::Subscribed).await;
        assert_eq!(h.connects.load(Ordering::SeqCst), 3);
    }
}

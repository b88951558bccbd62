//! Quote Cache - Source Arbitration and Fan-out
//!
//! Holds the served quote per instrument plus the latest value seen
//! from each source, and decides which one is authoritative:
//!
//! - stream quotes win while the instrument's active source is `Stream`
//! - poll quotes are kept as the backstop and only served once the
//!   instrument has failed over to `Poll`
//! - nothing older than the served value ever replaces it
//!
//! Each instrument has its own lock; the map lock is only held to find
//! or insert an entry. Accepted quotes are handed to bounded queues for
//! callback dispatch and persistence; ingestion never waits on either.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::domain::quote::{InstrumentId, Quote, QuoteSource};
use crate::domain::state::{ConnectionState, DataSourceStatus, PollHealth};
use crate::ports::sinks::{IngestOutcome, PersistenceSink, QuoteSink};

/// Maximum number of queued quotes handed to callbacks in one batch.
const DISPATCH_BATCH: usize = 64;

/// Subscriber invoked for every accepted quote.
pub type QuoteCallback = Arc<dyn Fn(&Quote) -> anyhow::Result<()> + Send + Sync>;

type CallbackList = Arc<RwLock<Vec<(CallbackId, QuoteCallback)>>>;

/// Handle returned by `register_callback`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(Uuid);

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug)]
struct Entry {
    current: Option<Quote>,
    latest_poll: Option<Quote>,
    /// False until the first observation after creation or `clear_status`.
    tracked: bool,
    active_source: QuoteSource,
    failover_count: u64,
    last_failover_at: Option<DateTime<Utc>>,
    last_stream_update_at: Option<DateTime<Utc>>,
    last_stream_seen: Option<Instant>,
    last_poll_update_at: Option<DateTime<Utc>>,
}

impl Default for Entry {
    fn default() -> Self {
        Self {
            current: None,
            latest_poll: None,
            tracked: false,
            active_source: QuoteSource::Poll,
            failover_count: 0,
            last_failover_at: None,
            last_stream_update_at: None,
            last_stream_seen: None,
            last_poll_update_at: None,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    applied: AtomicU64,
    retained: AtomicU64,
    stale: AtomicU64,
    rejected: AtomicU64,
    failovers: AtomicU64,
    callback_dropped: AtomicU64,
    persist_dropped: AtomicU64,
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub applied: u64,
    pub retained: u64,
    pub stale: u64,
    pub rejected: u64,
    pub failovers: u64,
    /// Accepted quotes not delivered to callbacks because the queue was full.
    pub callback_dropped: u64,
    /// Accepted quotes not persisted because the queue was full.
    pub persist_dropped: u64,
}

/// Receiving ends of the fan-out queues, owned by the background tasks.
pub struct FanOutReceivers {
    pub callbacks: mpsc::Receiver<Quote>,
    pub persistence: Option<mpsc::Receiver<Quote>>,
}

/// Per-instrument quote store.
pub struct QuoteCache {
    entries: RwLock<HashMap<InstrumentId, Arc<Mutex<Entry>>>>,
    callbacks: CallbackList,
    callback_tx: mpsc::Sender<Quote>,
    persist_tx: Option<mpsc::Sender<Quote>>,
    counters: Counters,
}

impl QuoteCache {
    /// Build an empty cache and its fan-out queues.
    ///
    /// The persistence queue only exists when `persist_queue` is given.
    pub fn new(callback_queue: usize, persist_queue: Option<usize>) -> (Self, FanOutReceivers) {
        let (callback_tx, callback_rx) = mpsc::channel(callback_queue.max(1));
        let (persist_tx, persist_rx) = match persist_queue {
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };
        (
            Self {
                entries: RwLock::new(HashMap::new()),
                callbacks: Arc::new(RwLock::new(Vec::new())),
                callback_tx,
                persist_tx,
                counters: Counters::default(),
            },
            FanOutReceivers {
                callbacks: callback_rx,
                persistence: persist_rx,
            },
        )
    }

    fn entry(&self, instrument_id: &str) -> Arc<Mutex<Entry>> {
        if let Some(entry) = self.entries.read().get(instrument_id) {
            return Arc::clone(entry);
        }
        let mut entries = self.entries.write();
        Arc::clone(entries.entry(instrument_id.to_string()).or_default())
    }

    fn existing(&self, instrument_id: &str) -> Option<Arc<Mutex<Entry>>> {
        self.entries.read().get(instrument_id).map(Arc::clone)
    }

    fn snapshot_entries(&self) -> Vec<(InstrumentId, Arc<Mutex<Entry>>)> {
        self.entries
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
            .collect()
    }

    /// Most recently confirmed value, regardless of source.
    pub fn get(&self, instrument_id: &str) -> Option<Quote> {
        self.existing(instrument_id)?.lock().current.clone()
    }

    /// Every instrument observed so far.
    pub fn instruments(&self) -> Vec<InstrumentId> {
        self.entries.read().keys().cloned().collect()
    }

    /// Arbitration record for one instrument, decorated with the given
    /// component states. `None` before the first observation.
    pub fn status(
        &self,
        instrument_id: &str,
        stream_state: ConnectionState,
        poll_health: PollHealth,
    ) -> Option<DataSourceStatus> {
        let entry = self.existing(instrument_id)?;
        let e = entry.lock();
        e.tracked.then(|| DataSourceStatus {
            active_source: e.active_source,
            stream_state,
            poll_health,
            last_failover_at: e.last_failover_at,
            failover_count: e.failover_count,
            last_stream_update_at: e.last_stream_update_at,
            last_poll_update_at: e.last_poll_update_at,
        })
    }

    /// Register a subscriber for accepted quotes.
    pub fn register_callback(&self, callback: QuoteCallback) -> CallbackId {
        let id = CallbackId(Uuid::new_v4());
        self.callbacks.write().push((id, callback));
        debug!(callback = %id, "Quote callback registered");
        id
    }

    /// Remove a subscriber. Returns whether it was registered.
    pub fn unregister_callback(&self, id: CallbackId) -> bool {
        let mut callbacks = self.callbacks.write();
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        before != callbacks.len()
    }

    pub(crate) fn callback_list(&self) -> CallbackList {
        Arc::clone(&self.callbacks)
    }

    /// Fail over every stream-served instrument whose last stream update
    /// is at least `window` old. Returns the instruments that moved.
    pub fn fail_over_stale(&self, window: Duration, now: Instant) -> Vec<InstrumentId> {
        self.fail_over_where(|e| {
            e.last_stream_seen
                .is_none_or(|seen| now.saturating_duration_since(seen) >= window)
        })
    }

    /// Fail over every stream-served instrument (stream left `Subscribed`).
    pub fn fail_over_all(&self) -> Vec<InstrumentId> {
        self.fail_over_where(|_| true)
    }

    fn fail_over_where(&self, stale: impl Fn(&Entry) -> bool) -> Vec<InstrumentId> {
        let mut moved = Vec::new();
        for (id, entry) in self.snapshot_entries() {
            let mut e = entry.lock();
            if !e.tracked || e.active_source != QuoteSource::Stream || !stale(&e) {
                continue;
            }
            e.active_source = QuoteSource::Poll;
            e.failover_count += 1;
            e.last_failover_at = Some(Utc::now());
            self.counters.failovers.fetch_add(1, Ordering::Relaxed);

            let backstop = e
                .latest_poll
                .clone()
                .filter(|poll| e.current.as_ref().is_none_or(|cur| poll.supersedes(cur)));
            let served_backstop = backstop.is_some();
            if let Some(poll) = backstop {
                self.publish(&mut e, poll);
            }
            info!(
                instrument = %id,
                failover_count = e.failover_count,
                served_backstop,
                "Failed over to poll source"
            );
            moved.push(id);
        }
        moved
    }

    /// Forget arbitration state; served quotes are kept.
    pub fn clear_status(&self) {
        for (_, entry) in self.snapshot_entries() {
            let mut e = entry.lock();
            let current = e.current.take();
            *e = Entry {
                current,
                ..Entry::default()
            };
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            applied: c.applied.load(Ordering::Relaxed),
            retained: c.retained.load(Ordering::Relaxed),
            stale: c.stale.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            failovers: c.failovers.load(Ordering::Relaxed),
            callback_dropped: c.callback_dropped.load(Ordering::Relaxed),
            persist_dropped: c.persist_dropped.load(Ordering::Relaxed),
        }
    }

    /// Serve `quote` and enqueue it for fan-out. Caller holds the entry lock.
    fn publish(&self, entry: &mut Entry, quote: Quote) {
        if !self.callbacks.read().is_empty() && self.callback_tx.try_send(quote.clone()).is_err() {
            self.counters.callback_dropped.fetch_add(1, Ordering::Relaxed);
            trace!(instrument = %quote.instrument_id, "Callback queue full, update dropped");
        }
        if let Some(tx) = &self.persist_tx {
            if tx.try_send(quote.clone()).is_err() {
                self.counters.persist_dropped.fetch_add(1, Ordering::Relaxed);
                trace!(instrument = %quote.instrument_id, "Persistence queue full, update dropped");
            }
        }
        entry.current = Some(quote);
    }

    fn ingest_stream(&self, e: &mut Entry, quote: Quote) -> IngestOutcome {
        if e.current.as_ref().is_some_and(|cur| !quote.supersedes(cur)) {
            return IngestOutcome::Stale;
        }
        if e.active_source == QuoteSource::Poll {
            info!(instrument = %quote.instrument_id, "Stream recovered, serving stream quotes");
            e.active_source = QuoteSource::Stream;
        }
        e.last_stream_update_at = Some(Utc::now());
        e.last_stream_seen = Some(Instant::now());
        self.publish(e, quote);
        IngestOutcome::Applied
    }

    fn ingest_poll(&self, e: &mut Entry, quote: Quote) -> IngestOutcome {
        if e.latest_poll.as_ref().is_some_and(|prev| !quote.supersedes(prev)) {
            return IngestOutcome::Stale;
        }
        e.latest_poll = Some(quote.clone());
        e.last_poll_update_at = Some(Utc::now());

        if e.active_source == QuoteSource::Stream {
            return IngestOutcome::Retained;
        }
        if e.current.as_ref().is_some_and(|cur| !quote.supersedes(cur)) {
            return IngestOutcome::Stale;
        }
        self.publish(e, quote);
        IngestOutcome::Applied
    }
}

impl QuoteSink for QuoteCache {
    fn ingest(&self, quote: Quote) -> IngestOutcome {
        if !quote.value.is_valid() {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(instrument = %quote.instrument_id, value = ?quote.value, "Invalid quote rejected");
            return IngestOutcome::Rejected;
        }

        let entry = self.entry(&quote.instrument_id);
        let mut e = entry.lock();
        if !e.tracked {
            e.tracked = true;
            e.active_source = quote.source;
        }
        let outcome = match quote.source {
            QuoteSource::Stream => self.ingest_stream(&mut e, quote),
            QuoteSource::Poll => self.ingest_poll(&mut e, quote),
        };
        drop(e);

        let counter = match outcome {
            IngestOutcome::Applied => &self.counters.applied,
            IngestOutcome::Retained => &self.counters.retained,
            IngestOutcome::Stale => &self.counters.stale,
            IngestOutcome::Rejected => &self.counters.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        outcome
    }
}

/// Deliver queued quotes to callbacks until cancelled, then hand the
/// receiver back so the manager can restart the dispatcher.
pub(crate) async fn run_callback_dispatcher(
    mut rx: mpsc::Receiver<Quote>,
    callbacks: CallbackList,
    cancel: CancellationToken,
) -> mpsc::Receiver<Quote> {
    let mut batch = Vec::with_capacity(DISPATCH_BATCH);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            received = rx.recv_many(&mut batch, DISPATCH_BATCH) => {
                if received == 0 {
                    break;
                }
            }
        }
        deliver(std::mem::take(&mut batch), &callbacks).await;
    }

    while let Ok(quote) = rx.try_recv() {
        batch.push(quote);
    }
    if !batch.is_empty() {
        deliver(batch, &callbacks).await;
    }
    rx
}

async fn deliver(batch: Vec<Quote>, callbacks: &CallbackList) {
    let handlers = callbacks.read().clone();
    if handlers.is_empty() {
        return;
    }
    let joined = tokio::task::spawn_blocking(move || {
        for quote in &batch {
            for (id, callback) in &handlers {
                match catch_unwind(AssertUnwindSafe(|| callback(quote))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(callback = %id, instrument = %quote.instrument_id, error = %e, "Quote callback failed");
                    }
                    Err(_) => {
                        error!(callback = %id, instrument = %quote.instrument_id, "Quote callback panicked");
                    }
                }
            }
        }
    })
    .await;
    if let Err(e) = joined {
        error!(error = %e, "Callback dispatch task failed");
    }
}

/// Forward accepted quotes to the persistence sink until cancelled.
pub(crate) async fn run_persistence_drainer(
    mut rx: mpsc::Receiver<Quote>,
    sink: Arc<dyn PersistenceSink>,
    cancel: CancellationToken,
) -> mpsc::Receiver<Quote> {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(quote) => persist(sink.as_ref(), &quote).await,
                None => break,
            },
        }
    }
    while let Ok(quote) = rx.try_recv() {
        persist(sink.as_ref(), &quote).await;
    }
    rx
}

async fn persist(sink: &dyn PersistenceSink, quote: &Quote) {
    if let Err(e) = sink.upsert_quote(quote).await {
        warn!(instrument = %quote.instrument_id, error = %e, "Failed to persist quote");
    }
}

//! REST Poll Jobs - Scoreboard and Market Endpoints
//!
//! A `FeedPollJob` is one configured poll target: it waits for rate
//! limit tokens, executes the request through the authenticated
//! executor, classifies the status, decodes the body and pushes each
//! quote into the hybrid manager's ingress.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::types::{MarketPayload, ScoreboardPayload};
use crate::domain::quote::Quote;
use crate::error::{IngestError, IngestResult};
use crate::ports::request_executor::{PollRequest, PollResponse, RequestExecutor};
use crate::ports::sinks::{IngestOutcome, QuoteSink};
use crate::usecases::poller::PollJob;
use crate::usecases::rate_limiter::RateLimiter;

/// Which payload shape the endpoint returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    /// `{"events":[{"id","value","updated_at","sequence"}]}`
    Scoreboard,
    /// `{"quotes":[{"instrument_id","bid","ask","timestamp","sequence"}]}`
    Market,
}

impl FeedKind {
    /// Decode a successful response body into valid quotes.
    pub fn decode(self, response: &PollResponse) -> IngestResult<Vec<Quote>> {
        let received_at = response.received_at;
        let quotes: Vec<Quote> = match self {
            Self::Scoreboard => {
                let payload: ScoreboardPayload = serde_json::from_str(&response.body)
                    .map_err(|e| IngestError::Protocol(format!("scoreboard body: {e}")))?;
                payload
                    .events
                    .into_iter()
                    .filter_map(|event| event.into_quote(received_at))
                    .collect()
            }
            Self::Market => {
                let payload: MarketPayload = serde_json::from_str(&response.body)
                    .map_err(|e| IngestError::Protocol(format!("market body: {e}")))?;
                payload
                    .quotes
                    .into_iter()
                    .filter_map(|row| row.into_quote(received_at))
                    .collect()
            }
        };
        Ok(quotes)
    }
}

/// One polled endpoint.
pub struct FeedPollJob {
    name: String,
    kind: FeedKind,
    request: PollRequest,
    executor: Arc<dyn RequestExecutor>,
    limiter: Arc<RateLimiter>,
    sink: Arc<dyn QuoteSink>,
    /// Tokens taken from the limiter per request.
    cost: u32,
}

impl FeedPollJob {
    pub fn new(
        name: impl Into<String>,
        kind: FeedKind,
        request: PollRequest,
        executor: Arc<dyn RequestExecutor>,
        limiter: Arc<RateLimiter>,
        sink: Arc<dyn QuoteSink>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            request,
            executor,
            limiter,
            sink,
            cost: 1,
        }
    }

    /// Weight of one request against the shared bucket.
    #[must_use]
    pub const fn with_cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }

    pub const fn kind(&self) -> FeedKind {
        self.kind
    }
}

#[async_trait]
impl PollJob for FeedPollJob {
    fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of quotes the cache applied.
    #[instrument(skip(self, cancel), fields(job = %self.name, path = %self.request.path))]
    async fn run(&self, cancel: &CancellationToken) -> IngestResult<usize> {
        self.limiter.acquire(self.cost, cancel).await?;

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(IngestError::Cancelled),
            result = self.executor.execute(&self.request) => result?,
        };
        response.check_status()?;

        let quotes = self.kind.decode(&response)?;
        let decoded = quotes.len();
        let mut applied = 0usize;
        for quote in quotes {
            if self.sink.ingest(quote) == IngestOutcome::Applied {
                applied += 1;
            }
        }

        debug!(decoded, applied, "Poll cycle ingested");
        Ok(applied)
    }
}

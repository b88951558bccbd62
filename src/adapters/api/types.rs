//! Feed REST Payloads
//!
//! Response shapes of the two polled endpoints and their conversion to
//! `Quote`s. Entries that cannot form a valid quote are dropped one by
//! one; a body that is not the expected shape fails as a whole.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::domain::quote::{Quote, QuoteSource};

/// Scoreboard endpoint: `{"events": [...]}`.
#[derive(Debug, Deserialize)]
pub struct ScoreboardPayload {
    #[serde(default)]
    pub events: Vec<ScoreboardEvent>,
}

/// One scoreboard row.
#[derive(Debug, Deserialize)]
pub struct ScoreboardEvent {
    pub id: String,
    pub value: f64,
    /// RFC 3339; receipt time is used when missing.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sequence: Option<u64>,
}

impl ScoreboardEvent {
    pub fn into_quote(self, received_at: DateTime<Utc>) -> Option<Quote> {
        if self.id.is_empty() {
            return None;
        }
        let quote = Quote::score(
            self.id,
            self.value,
            QuoteSource::Poll,
            self.updated_at.unwrap_or(received_at),
        );
        let quote = match self.sequence {
            Some(seq) => quote.with_sequence(seq),
            None => quote,
        };
        quote.value.is_valid().then_some(quote)
    }
}

/// Market endpoint: `{"quotes": [...]}`.
#[derive(Debug, Deserialize)]
pub struct MarketPayload {
    #[serde(default)]
    pub quotes: Vec<MarketQuote>,
}

/// One top-of-book row.
#[derive(Debug, Deserialize)]
pub struct MarketQuote {
    pub instrument_id: String,
    pub bid: f64,
    pub ask: f64,
    /// Unix milliseconds; receipt time is used when missing.
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub sequence: Option<u64>,
}

impl MarketQuote {
    pub fn into_quote(self, received_at: DateTime<Utc>) -> Option<Quote> {
        if self.instrument_id.is_empty() {
            return None;
        }
        let observed_at = self
            .timestamp
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or(received_at);
        let quote = Quote::book(
            self.instrument_id,
            self.bid,
            self.ask,
            QuoteSource::Poll,
            observed_at,
        );
        let quote = match self.sequence {
            Some(seq) => quote.with_sequence(seq),
            None => quote,
        };
        quote.value.is_valid().then_some(quote)
    }
}

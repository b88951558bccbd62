//! Quote Types - The Unit of Cached State
//!
//! A `Quote` is the latest confirmed observation for one instrument,
//! either a two-sided book (market data) or a single value
//! (scoreboard-style data). Quotes are plain values: the cache hands
//! out clones, never references into its storage.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Instrument identifier (market ticker, event id, token id).
pub type InstrumentId = String;

/// Which ingestion path produced a quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuoteSource {
    /// Persistent streaming connection.
    Stream,
    /// Interval-driven REST polling.
    Poll,
}

impl QuoteSource {
    /// Label used in logs and metrics.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Poll => "poll",
        }
    }
}

impl fmt::Display for QuoteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed state for an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuoteValue {
    /// Best bid and best ask.
    Book {
        /// Highest resting buy price.
        bid: f64,
        /// Lowest resting sell price.
        ask: f64,
    },
    /// Single scalar (score, win probability, index level).
    Score {
        /// Reported value.
        value: f64,
    },
}

impl QuoteValue {
    /// Mid price for books, the value itself for scores.
    pub fn mid(&self) -> f64 {
        match *self {
            Self::Book { bid, ask } => (bid + ask) / 2.0,
            Self::Score { value } => value,
        }
    }

    /// Finite numbers and a non-crossed book.
    pub fn is_valid(&self) -> bool {
        match *self {
            Self::Book { bid, ask } => bid.is_finite() && ask.is_finite() && bid <= ask,
            Self::Score { value } => value.is_finite(),
        }
    }
}

/// Latest confirmed observation for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    /// Instrument this quote belongs to.
    pub instrument_id: InstrumentId,
    /// Book or scalar value.
    pub value: QuoteValue,
    /// Producing ingestion path.
    pub source: QuoteSource,
    /// Feed-reported time, or receipt time when the feed has none.
    pub observed_at: DateTime<Utc>,
    /// Per-instrument monotonic sequence, when the feed provides one.
    pub sequence: Option<u64>,
}

impl Quote {
    /// Build a two-sided book quote.
    pub fn book(
        instrument_id: impl Into<InstrumentId>,
        bid: f64,
        ask: f64,
        source: QuoteSource,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            instrument_id: instrument_id.into(),
            value: QuoteValue::Book { bid, ask },
            source,
            observed_at,
            sequence: None,
        }
    }

    /// Build a scalar quote.
    pub fn score(
        instrument_id: impl Into<InstrumentId>,
        value: f64,
        source: QuoteSource,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            instrument_id: instrument_id.into(),
            value: QuoteValue::Score { value },
            source,
            observed_at,
            sequence: None,
        }
    }

    /// Attach a feed sequence number.
    #[must_use]
    pub const fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Whether this quote is not older than `current`.
    ///
    /// Sequence numbers are only comparable within one source; across
    /// sources (or when either side lacks one) `observed_at` decides.
    /// Equal positions count as "not older".
    pub fn supersedes(&self, current: &Self) -> bool {
        match (self.sequence, current.sequence) {
            (Some(incoming), Some(cached)) if self.source == current.source => incoming >= cached,
            _ => self.observed_at >= current.observed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(offset_ms: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000 + offset_ms).unwrap()
    }

    #[test]
    fn test_book_mid() {
        let q = Quote::book("X", 0.40, 0.44, QuoteSource::Stream, at(0));
        assert!((q.value.mid() - 0.42).abs() < 1e-12);
    }

    #[test]
    fn test_crossed_book_is_invalid() {
        assert!(!QuoteValue::Book { bid: 0.5, ask: 0.4 }.is_valid());
        assert!(!QuoteValue::Score { value: f64::NAN }.is_valid());
        assert!(QuoteValue::Score { value: 3.0 }.is_valid());
    }

    #[test]
    fn test_supersedes_by_timestamp() {
        let old = Quote::score("G1", 1.0, QuoteSource::Poll, at(0));
        let new = Quote::score("G1", 2.0, QuoteSource::Stream, at(0) + Duration::milliseconds(5));
        assert!(new.supersedes(&old));
        assert!(!old.supersedes(&new));
        assert!(old.supersedes(&old.clone()));
    }

    #[test]
    fn test_sequence_wins_within_same_source() {
        // Later timestamp but lower sequence: the feed's sequence is authoritative.
        let cached = Quote::book("X", 0.4, 0.5, QuoteSource::Stream, at(0)).with_sequence(10);
        let late = Quote::book("X", 0.3, 0.5, QuoteSource::Stream, at(100)).with_sequence(9);
        assert!(!late.supersedes(&cached));
    }

    #[test]
    fn test_sequence_ignored_across_sources() {
        let cached = Quote::book("X", 0.4, 0.5, QuoteSource::Stream, at(100)).with_sequence(10);
        let poll = Quote::book("X", 0.4, 0.5, QuoteSource::Poll, at(50)).with_sequence(99);
        assert!(!poll.supersedes(&cached));
    }

    #[test]
    fn test_source_serializes_uppercase() {
        let json = serde_json::to_string(&QuoteSource::Stream).unwrap();
        assert_eq!(json, "\"STREAM\"");
    }
}

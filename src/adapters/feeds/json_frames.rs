//! JSON Frame Decoder
//!
//! Decodes the generic JSON framing used by the stream connector:
//!
//! - `{"type":"quote","instrument_id":..,"bid":..,"ask":..}` or with
//!   `"value"` for scalar feeds; optional `timestamp` (Unix ms) and
//!   `sequence`
//! - `{"type":"heartbeat"}`
//! - `{"type":"subscribed","instruments":[..]}`
//! - `{"type":"error","message":..}`

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::domain::quote::{InstrumentId, Quote, QuoteSource};
use crate::error::{IngestError, IngestResult};
use crate::ports::stream_connector::{FrameDecoder, StreamFrame};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireFrame {
    Quote {
        instrument_id: InstrumentId,
        #[serde(default)]
        bid: Option<f64>,
        #[serde(default)]
        ask: Option<f64>,
        #[serde(default)]
        value: Option<f64>,
        #[serde(default)]
        timestamp: Option<i64>,
        #[serde(default)]
        sequence: Option<u64>,
    },
    Heartbeat,
    Subscribed {
        #[serde(default)]
        instruments: Vec<InstrumentId>,
    },
    Error {
        #[serde(default)]
        message: String,
    },
}

/// Stateless decoder; safe to share across connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonFrameDecoder;

impl FrameDecoder for JsonFrameDecoder {
    fn decode(&self, raw: &str) -> IngestResult<StreamFrame> {
        let frame: WireFrame = serde_json::from_str(raw)
            .map_err(|e| IngestError::Protocol(format!("undecodable frame: {e}")))?;

        match frame {
            WireFrame::Quote {
                instrument_id,
                bid,
                ask,
                value,
                timestamp,
                sequence,
            } => {
                if instrument_id.is_empty() {
                    return Err(IngestError::Protocol("quote frame without instrument".into()));
                }
                let observed_at = timestamp
                    .and_then(DateTime::<Utc>::from_timestamp_millis)
                    .unwrap_or_else(Utc::now);
                let quote = match (bid, ask, value) {
                    (Some(bid), Some(ask), _) => {
                        Quote::book(instrument_id, bid, ask, QuoteSource::Stream, observed_at)
                    }
                    (None, None, Some(value)) => {
                        Quote::score(instrument_id, value, QuoteSource::Stream, observed_at)
                    }
                    _ => {
                        return Err(IngestError::Protocol(format!(
                            "quote frame for '{instrument_id}' has neither bid/ask nor value"
                        )));
                    }
                };
                Ok(StreamFrame::Quote(match sequence {
                    Some(seq) => quote.with_sequence(seq),
                    None => quote,
                }))
            }
            WireFrame::Heartbeat => Ok(StreamFrame::Heartbeat),
            WireFrame::Subscribed { instruments } => Ok(StreamFrame::Subscribed(instruments)),
            WireFrame::Error { message } => Ok(StreamFrame::Error(message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::quote::QuoteValue;

    #[test]
    fn test_book_frame() {
        let frame = JsonFrameDecoder
            .decode(r#"{"type":"quote","instrument_id":"X","bid":0.4,"ask":0.5,"timestamp":1700000000000,"sequence":3}"#)
            .unwrap();
        let StreamFrame::Quote(quote) = frame else {
            panic!("expected quote, got {frame:?}");
        };
        assert_eq!(quote.value, QuoteValue::Book { bid: 0.4, ask: 0.5 });
        assert_eq!(quote.sequence, Some(3));
        assert_eq!(quote.observed_at.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_score_frame() {
        let frame = JsonFrameDecoder
            .decode(r#"{"type":"quote","instrument_id":"G1","value":14}"#)
            .unwrap();
        assert!(matches!(
            frame,
            StreamFrame::Quote(Quote { value: QuoteValue::Score { .. }, .. })
        ));
    }

    #[test]
    fn test_control_frames() {
        assert_eq!(
            JsonFrameDecoder.decode(r#"{"type":"heartbeat"}"#).unwrap(),
            StreamFrame::Heartbeat
        );
        assert_eq!(
            JsonFrameDecoder
                .decode(r#"{"type":"subscribed","instruments":["A","B"]}"#)
                .unwrap(),
            StreamFrame::Subscribed(vec!["A".to_string(), "B".to_string()])
        );
        assert_eq!(
            JsonFrameDecoder
                .decode(r#"{"type":"error","message":"slow consumer"}"#)
                .unwrap(),
            StreamFrame::Error("slow consumer".to_string())
        );
    }

    #[test]
    fn test_malformed_frames() {
        assert!(JsonFrameDecoder.decode("not json").is_err());
        assert!(JsonFrameDecoder.decode(r#"{"type":"trade"}"#).is_err());
        assert!(JsonFrameDecoder
            .decode(r#"{"type":"quote","instrument_id":"X","bid":0.4}"#)
            .is_err());
    }
}

//! Stream Connector Port - Authenticated Streaming Capability
//!
//! The stream handler drives a connector through
//! connect → authenticate → subscribe → receive… → close and owns the
//! reconnect policy. The connector only moves bytes; decoding frames
//! into quotes is the job of a `FrameDecoder`.

use async_trait::async_trait;

use crate::domain::quote::{InstrumentId, Quote};
use crate::error::IngestResult;

/// Transport for one persistent streaming connection.
///
/// `receive` must be cancel-safe: the handler races it against shutdown
/// and subscription commands, and a dropped `receive` future must not
/// lose a frame that was already read from the socket.
#[async_trait]
pub trait StreamConnector: Send + 'static {
  /// Open the transport and complete the protocol handshake.
  async fn connect(&mut self) -> IngestResult<()>;

  /// Present credentials. Connectors without auth return `Ok(())`.
  async fn authenticate(&mut self) -> IngestResult<()>;

  /// Subscribe to additional instruments.
  async fn subscribe(&mut self, instrument_ids: &[InstrumentId]) -> IngestResult<()>;

  /// Next text frame; `Ok(None)` when the peer closed the stream.
  async fn receive(&mut self) -> IngestResult<Option<String>>;

  /// Close the transport. Must be safe to call on a closed connector.
  async fn close(&mut self) -> IngestResult<()>;
}

/// A decoded stream frame.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
  /// Market or scoreboard update.
  Quote(Quote),
  /// Keep-alive with no payload.
  Heartbeat,
  /// Upstream acknowledged a subscription.
  Subscribed(Vec<InstrumentId>),
  /// Upstream reported a non-fatal error.
  Error(String),
}

/// Parses raw frames into `StreamFrame`s.
///
/// Returns `IngestError::Protocol` for anything it cannot interpret; the
/// handler drops and counts such frames.
pub trait FrameDecoder: Send + Sync + 'static {
  /// Decode one raw text frame.
  fn decode(&self, raw: &str) -> IngestResult<StreamFrame>;
}

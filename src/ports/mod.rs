//! Ports Layer - Hexagonal Architecture Boundaries
//!
//! Defines the capabilities the ingestion core consumes from the
//! outside world. Adapters implement these traits.
//!
//! Port categories:
//! - `RequestExecutor`: authenticated REST calls for poll cycles
//! - `StreamConnector` / `FrameDecoder`: authenticated streaming transport
//! - `QuoteSink`, `PersistenceSink`, `AlertSink`: outbound state
//! - `Worker`: units owned by the supervisor

pub mod request_executor;
pub mod sinks;
pub mod stream_connector;
pub mod worker;

pub use request_executor::{PollRequest, PollResponse, RequestExecutor, RequestMethod};
pub use sinks::{AlertSink, IngestOutcome, PersistenceSink, QuoteSink, Severity};
pub use stream_connector::{FrameDecoder, StreamConnector, StreamFrame};
pub use worker::{HealthStatus, Worker};

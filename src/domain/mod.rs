//! Domain layer - Core ingestion types and policies.
//!
//! Pure values and state machines with no I/O: quotes, connection and
//! service states, the shared backoff policy and the restart circuit
//! breaker. Everything here is testable in isolation.

pub mod backoff;
pub mod circuit_breaker;
pub mod quote;
pub mod state;

// Re-export core types for convenience
pub use backoff::BackoffPolicy;
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use quote::{InstrumentId, Quote, QuoteSource, QuoteValue};
pub use state::{
    ConnectionState, DataSourceStatus, HealthReport, PollHealth, ServiceState, WorkerSnapshot,
};

//! Use Cases Layer - Ingestion Components
//!
//! Orchestrates domain types with port interfaces. Each component owns
//! its state and exposes snapshot copies to everyone else.
//!
//! Components:
//! - `RateLimiter`: Token bucket shared per upstream API
//! - `Poller`: Interval-driven execution of a `PollJob`
//! - `StreamHandler`: Persistent connection with reconnect policy
//! - `QuoteCache`: Per-instrument source arbitration and fan-out
//! - `HybridDataManager`: Stream-preferred, poll-backed read path
//! - `Supervisor`: Health checks, restarts and circuit breaking
//! - `PollerWorker` / `HybridWorker`: Supervised wrappers

pub mod hybrid_manager;
pub mod poller;
pub mod quote_cache;
pub mod rate_limiter;
pub mod stream_handler;
pub mod supervisor;
pub mod workers;

pub use hybrid_manager::{HybridConfig, HybridDataManager};
pub use poller::{PollJob, Poller, PollerConfig, PollerLifecycle, PollerStats};
pub use quote_cache::{CacheStats, CallbackId, QuoteCache, QuoteCallback};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use stream_handler::{StreamConfig, StreamHandler, StreamStats};
pub use supervisor::{StopReport, Supervisor, SupervisorConfig};
pub use workers::{HybridWorker, PollerWorker};

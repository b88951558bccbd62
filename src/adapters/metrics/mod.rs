//! Metrics and Monitoring Adapters
//!
//! Prometheus gauges on `/metrics`, health endpoints (`/live`,
//! `/ready`, `/health`) via axum 0.7, and the default alert sink.

pub mod alerts;
pub mod health;
pub mod prometheus;

pub use alerts::TracingAlertSink;
pub use health::HealthServer;
pub use prometheus::MetricsRegistry;

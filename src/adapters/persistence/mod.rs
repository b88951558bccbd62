//! Persistence Adapters - JSONL-based File Storage
//!
//! Implements the `PersistenceSink` port with append-only JSONL quote
//! history and an atomically replaced health snapshot.
//! No database dependency.

pub mod jsonl_sink;

pub use jsonl_sink::{JsonlSink, QuoteRecord};

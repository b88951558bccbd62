//! Feed Ingest - Library Root
//!
//! Hybrid stream/poll ingestion into an authoritative quote cache,
//! kept alive by a supervisor with restart backoff and circuit breaking.
//! Re-exports all modules for integration tests and benchmarks.

pub mod adapters;
pub mod config;
pub mod domain;
pub mod error;
pub mod ports;
pub mod usecases;

pub use error::{IngestError, IngestResult};

//! Adapters Layer - Hexagonal Architecture Outer Ring
//!
//! Implements the port traits defined in `crate::ports` with concrete
//! external dependencies (HTTP, WebSockets, file I/O, Prometheus).
//! Each sub-module groups adapters by infrastructure concern.
//!
//! Adapter categories:
//! - `api`: REST executor, request signing and poll jobs
//! - `feeds`: WebSocket connector and JSON frame decoder
//! - `metrics`: Prometheus export, health endpoints and alerts
//! - `persistence`: JSONL quote history and health snapshots

pub mod api;
pub mod feeds;
pub mod metrics;
pub mod persistence;

//! Feed REST API Adapter
//!
//! Implements the `RequestExecutor` port over HTTP and the two
//! `PollJob`s that feed the hybrid manager from REST endpoints.
//!
//! Sub-modules:
//! - `auth`: HMAC-SHA256 request signing
//! - `client`: reqwest executor with a concurrency cap
//! - `poll_jobs`: scoreboard and market poll jobs
//! - `types`: response payload definitions

pub mod auth;
pub mod client;
pub mod poll_jobs;
pub mod types;

pub use auth::FeedAuth;
pub use client::{HttpExecutor, HttpExecutorConfig};
pub use poll_jobs::{FeedKind, FeedPollJob};

//! Configuration Module - TOML-based Ingest Configuration
//!
//! Loads and validates configuration from `config.toml`. Credentials
//! never live here; they come from environment variables.
//!
//! Each section converts into the typed config of the component it
//! drives. Those constructors enforce the component invariants and
//! return `IngestError::Configuration`; the loader only adds
//! cross-section checks.

pub mod loader;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::adapters::api::poll_jobs::FeedKind;
use crate::domain::backoff::BackoffPolicy;
use crate::error::IngestResult;
use crate::usecases::hybrid_manager::HybridConfig;
use crate::usecases::poller::PollerConfig;
use crate::usecases::rate_limiter::RateLimiterConfig;
use crate::usecases::stream_handler::StreamConfig;
use crate::usecases::supervisor::SupervisorConfig;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
  /// Process identity and logging.
  pub app: AppSection,
  /// REST endpoint shared by every poller.
  pub api: ApiConfig,
  /// Named token buckets, referenced by pollers.
  #[serde(default)]
  pub rate_limits: Vec<RateLimitConfig>,
  /// One hybrid manager per feed.
  pub feeds: Vec<FeedConfig>,
  #[serde(default)]
  pub supervisor: SupervisorSection,
  #[serde(default)]
  pub persistence: PersistenceConfig,
  #[serde(default)]
  pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
  pub name: String,
  /// Used when RUST_LOG is unset.
  #[serde(default = "default_log_level")]
  pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  pub base_url: String,
  #[serde(default = "default_timeout_ms")]
  pub timeout_ms: u64,
  #[serde(default = "default_max_concurrent")]
  pub max_concurrent: usize,
  /// Sign requests with FEED_API_KEY / FEED_API_SECRET.
  #[serde(default = "default_true")]
  pub authenticated: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
  pub name: String,
  pub capacity: f64,
  pub refill_per_sec: f64,
}

impl RateLimitConfig {
  pub const fn to_limiter_config(&self) -> RateLimiterConfig {
    RateLimiterConfig {
      capacity: self.capacity,
      refill_per_sec: self.refill_per_sec,
    }
  }
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BackoffSection {
  #[serde(default = "default_backoff_base_ms")]
  pub base_ms: u64,
  #[serde(default = "default_backoff_multiplier")]
  pub multiplier: f64,
  #[serde(default = "default_backoff_max_ms")]
  pub max_ms: u64,
  #[serde(default = "default_backoff_jitter")]
  pub jitter: f64,
}

impl Default for BackoffSection {
  fn default() -> Self {
    Self {
      base_ms: default_backoff_base_ms(),
      multiplier: default_backoff_multiplier(),
      max_ms: default_backoff_max_ms(),
      jitter: default_backoff_jitter(),
    }
  }
}

impl BackoffSection {
  pub fn to_policy(&self) -> IngestResult<BackoffPolicy> {
    BackoffPolicy::new(
      Duration::from_millis(self.base_ms),
      self.multiplier,
      Duration::from_millis(self.max_ms),
      self.jitter,
    )
  }
}

/// One data domain: an optional stream plus its backing pollers.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
  pub name: String,
  /// Instruments subscribed on the stream at start.
  #[serde(default)]
  pub instruments: Vec<String>,
  pub staleness_window_ms: u64,
  #[serde(default = "default_stream_retry_cooldown")]
  pub stream_retry_cooldown_secs: u64,
  #[serde(default = "default_callback_queue")]
  pub callback_queue: usize,
  #[serde(default = "default_persist_queue")]
  pub persist_queue: usize,
  #[serde(default)]
  pub stream: Option<StreamSection>,
  #[serde(default)]
  pub pollers: Vec<PollerSection>,
}

impl FeedConfig {
  pub fn to_hybrid_config(&self) -> IngestResult<HybridConfig> {
    HybridConfig::new(Duration::from_millis(self.staleness_window_ms))?
      .with_stream_retry_cooldown(Duration::from_secs(self.stream_retry_cooldown_secs))?
      .with_queues(self.callback_queue, self.persist_queue)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamSection {
  pub url: String,
  /// Send a signed login frame after connecting.
  #[serde(default = "default_true")]
  pub authenticated: bool,
  #[serde(default = "default_max_reconnect_attempts")]
  pub max_reconnect_attempts: u32,
  #[serde(default = "default_auth_retry_budget")]
  pub auth_retry_budget: u32,
  #[serde(default = "default_stable_after")]
  pub stable_after_secs: u64,
  /// Treat the connection as dead after this much silence.
  #[serde(default)]
  pub receive_timeout_secs: Option<u64>,
  #[serde(default = "default_handshake_timeout")]
  pub handshake_timeout_secs: u64,
  #[serde(default)]
  pub backoff: BackoffSection,
}

impl StreamSection {
  pub fn to_stream_config(&self) -> IngestResult<StreamConfig> {
    let config = StreamConfig::new(self.backoff.to_policy()?, self.max_reconnect_attempts)?
      .with_auth_retry_budget(self.auth_retry_budget)
      .with_stable_after(Duration::from_secs(self.stable_after_secs))?;
    match self.receive_timeout_secs {
      Some(secs) => config.with_receive_timeout(Duration::from_secs(secs)),
      None => Ok(config),
    }
  }
}

/// Payload shape of a polled endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollKind {
  Scoreboard,
  Market,
}

impl From<PollKind> for FeedKind {
  fn from(kind: PollKind) -> Self {
    match kind {
      PollKind::Scoreboard => Self::Scoreboard,
      PollKind::Market => Self::Market,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollerSection {
  pub name: String,
  pub kind: PollKind,
  /// Path appended to `api.base_url`.
  pub path: String,
  #[serde(default)]
  pub query: BTreeMap<String, String>,
  /// Name of a `[[rate_limits]]` entry.
  pub limiter: String,
  /// Tokens per request.
  #[serde(default = "default_cost")]
  pub cost: u32,
  pub interval_ms: u64,
  #[serde(default = "default_poll_jitter")]
  pub jitter: f64,
  /// Halt after this many failed cycles in a row; unlimited when unset.
  #[serde(default)]
  pub max_consecutive_failures: Option<u32>,
  #[serde(default = "default_unhealthy_after")]
  pub unhealthy_after: u32,
}

impl PollerSection {
  pub fn to_poller_config(&self) -> IngestResult<PollerConfig> {
    let config = PollerConfig::new(Duration::from_millis(self.interval_ms), self.jitter)?
      .with_unhealthy_after(self.unhealthy_after)?;
    match self.max_consecutive_failures {
      Some(max) => config.with_max_consecutive_failures(max),
      None => Ok(config),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSection {
  #[serde(default = "default_health_check_interval")]
  pub health_check_interval_ms: u64,
  #[serde(default = "default_failure_threshold")]
  pub failure_threshold: u32,
  #[serde(default = "default_open_duration")]
  pub open_duration_secs: u64,
  #[serde(default)]
  pub startup_grace_ms: Option<u64>,
  #[serde(default)]
  pub probe_timeout_ms: Option<u64>,
  #[serde(default = "default_report_interval")]
  pub report_interval_secs: u64,
  #[serde(default = "default_stop_timeout")]
  pub stop_timeout_secs: u64,
  #[serde(default)]
  pub restart_backoff: BackoffSection,
}

impl Default for SupervisorSection {
  fn default() -> Self {
    Self {
      health_check_interval_ms: default_health_check_interval(),
      failure_threshold: default_failure_threshold(),
      open_duration_secs: default_open_duration(),
      startup_grace_ms: None,
      probe_timeout_ms: None,
      report_interval_secs: default_report_interval(),
      stop_timeout_secs: default_stop_timeout(),
      restart_backoff: BackoffSection::default(),
    }
  }
}

impl SupervisorSection {
  pub fn to_supervisor_config(&self) -> IngestResult<SupervisorConfig> {
    let mut config = SupervisorConfig::new(
      Duration::from_millis(self.health_check_interval_ms),
      self.restart_backoff.to_policy()?,
      self.failure_threshold,
      Duration::from_secs(self.open_duration_secs),
    )?
    .with_report_interval(Duration::from_secs(self.report_interval_secs))?
    .with_stop_timeout(Duration::from_secs(self.stop_timeout_secs))?;
    if let Some(grace) = self.startup_grace_ms {
      config = config.with_startup_grace(Duration::from_millis(grace));
    }
    if let Some(timeout) = self.probe_timeout_ms {
      config = config.with_probe_timeout(Duration::from_millis(timeout))?;
    }
    Ok(config)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
  /// Attach the JSONL sink to every feed and the supervisor.
  #[serde(default = "default_true")]
  pub enabled: bool,
  #[serde(default = "default_data_dir")]
  pub data_dir: String,
}

impl Default for PersistenceConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      data_dir: default_data_dir(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
  #[serde(default = "default_true")]
  pub enabled: bool,
  #[serde(default = "default_metrics_addr")]
  pub bind_address: String,
  #[serde(default = "default_health_addr")]
  pub health_bind_address: String,
  #[serde(default = "default_collect_interval")]
  pub collect_interval_ms: u64,
}

impl Default for MetricsConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      bind_address: default_metrics_addr(),
      health_bind_address: default_health_addr(),
      collect_interval_ms: default_collect_interval(),
    }
  }
}

// Default value functions for serde

fn default_log_level() -> String {
  "info".to_string()
}

const fn default_true() -> bool {
  true
}

const fn default_timeout_ms() -> u64 {
  10_000
}

const fn default_max_concurrent() -> usize {
  8
}

const fn default_backoff_base_ms() -> u64 {
  500
}

const fn default_backoff_multiplier() -> f64 {
  2.0
}

const fn default_backoff_max_ms() -> u64 {
  30_000
}

const fn default_backoff_jitter() -> f64 {
  0.2
}

const fn default_stream_retry_cooldown() -> u64 {
  60
}

const fn default_callback_queue() -> usize {
  1024
}

const fn default_persist_queue() -> usize {
  4096
}

const fn default_max_reconnect_attempts() -> u32 {
  10
}

const fn default_auth_retry_budget() -> u32 {
  2
}

const fn default_stable_after() -> u64 {
  30
}

const fn default_handshake_timeout() -> u64 {
  10
}

const fn default_cost() -> u32 {
  1
}

const fn default_poll_jitter() -> f64 {
  0.1
}

const fn default_unhealthy_after() -> u32 {
  3
}

const fn default_health_check_interval() -> u64 {
  5_000
}

const fn default_failure_threshold() -> u32 {
  3
}

const fn default_open_duration() -> u64 {
  60
}

const fn default_report_interval() -> u64 {
  30
}

const fn default_stop_timeout() -> u64 {
  10
}

fn default_data_dir() -> String {
  "data".to_string()
}

fn default_metrics_addr() -> String {
  "0.0.0.0:9090".to_string()
}

fn default_health_addr() -> String {
  "0.0.0.0:8080".to_string()
}

const fn default_collect_interval() -> u64 {
  5_000
}

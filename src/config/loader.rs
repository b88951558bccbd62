//! Configuration Loader - File Loading and Validation
//!
//! Handles loading `config.toml`, validating all parameters,
//! and providing clear error messages for misconfiguration.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use super::AppConfig;

/// Load and validate configuration from a TOML file.
///
/// # Errors
/// Returns detailed error if:
/// - File doesn't exist or can't be read
/// - TOML parsing fails
/// - Validation rules are violated
pub fn load_config(path: impl AsRef<Path>) -> Result<AppConfig> {
  let path = path.as_ref();

  let content = std::fs::read_to_string(path)
    .with_context(|| format!("Failed to read config file: {}", path.display()))?;

  let config = parse_config(&content)
    .with_context(|| format!("Invalid configuration in {}", path.display()))?;

  info!(
    feeds = config.feeds.len(),
    rate_limits = config.rate_limits.len(),
    "Configuration loaded successfully"
  );

  Ok(config)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<AppConfig> {
  let config: AppConfig = toml::from_str(content).context("Failed to parse TOML")?;
  validate_config(&config)?;
  Ok(config)
}

/// Validate cross-section references and every component config.
///
/// Checks for:
/// - At least one feed, unique feed/poller/limiter names
/// - Each feed has a stream or at least one poller
/// - Pollers reference an existing rate limit they can satisfy
/// - A feed's staleness window covers each of its poll intervals
fn validate_config(config: &AppConfig) -> Result<()> {
  anyhow::ensure!(!config.feeds.is_empty(), "At least one feed must be configured");

  let mut limiter_names = HashSet::new();
  for limit in &config.rate_limits {
    anyhow::ensure!(
      limiter_names.insert(limit.name.as_str()),
      "Duplicate rate limit name '{}'",
      limit.name
    );
    crate::usecases::rate_limiter::RateLimiter::new(limit.name.clone(), limit.to_limiter_config())
      .with_context(|| format!("Rate limit '{}'", limit.name))?;
  }

  let mut feed_names = HashSet::new();
  let mut poller_names = HashSet::new();
  for feed in &config.feeds {
    anyhow::ensure!(
      feed_names.insert(feed.name.as_str()),
      "Duplicate feed name '{}'",
      feed.name
    );
    anyhow::ensure!(
      feed.stream.is_some() || !feed.pollers.is_empty(),
      "Feed '{}' has neither a stream nor a poller",
      feed.name
    );
    feed
      .to_hybrid_config()
      .with_context(|| format!("Feed '{}'", feed.name))?;

    if let Some(stream) = &feed.stream {
      anyhow::ensure!(!stream.url.is_empty(), "Feed '{}' has an empty stream url", feed.name);
      stream
        .to_stream_config()
        .with_context(|| format!("Feed '{}' stream", feed.name))?;
      if feed.instruments.is_empty() {
        warn!(feed = %feed.name, "Stream configured without instruments");
      }
    }

    for poller in &feed.pollers {
      anyhow::ensure!(
        poller_names.insert(poller.name.as_str()),
        "Duplicate poller name '{}'",
        poller.name
      );
      poller
        .to_poller_config()
        .with_context(|| format!("Poller '{}'", poller.name))?;

      let limit = config
        .rate_limits
        .iter()
        .find(|l| l.name == poller.limiter)
        .with_context(|| {
          format!(
            "Poller '{}' references unknown rate limit '{}'",
            poller.name, poller.limiter
          )
        })?;
      anyhow::ensure!(
        f64::from(poller.cost) <= limit.capacity,
        "Poller '{}' costs {} tokens but '{}' holds only {}",
        poller.name,
        poller.cost,
        limit.name,
        limit.capacity
      );
      anyhow::ensure!(
        feed.staleness_window_ms >= poller.interval_ms,
        "Feed '{}' staleness window ({}ms) is shorter than poller '{}' interval ({}ms)",
        feed.name,
        feed.staleness_window_ms,
        poller.name,
        poller.interval_ms
      );
    }
  }

  if config.feeds.iter().any(|f| !f.pollers.is_empty()) {
    anyhow::ensure!(!config.api.base_url.is_empty(), "API base URL must not be empty");
  }
  anyhow::ensure!(config.api.max_concurrent > 0, "api.max_concurrent must be positive");

  config
    .supervisor
    .to_supervisor_config()
    .context("Supervisor")?;

  anyhow::ensure!(
    config.metrics.collect_interval_ms > 0,
    "metrics.collect_interval_ms must be positive"
  );

  Ok(())
}

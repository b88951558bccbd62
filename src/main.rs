//! Feed Ingest - Entry Point
//!
//! Initializes configuration and logging, wires every feed into a
//! supervised hybrid manager, and runs until SIGINT.
//!
//! Wiring sequence:
//! 1. Load config.toml + validate
//! 2. Init tracing (JSON structured logging)
//! 3. Load feed credentials from env vars (FEED_API_KEY, FEED_API_SECRET)
//! 4. Create the REST executor and the named rate limiters
//! 5. Build one HybridDataManager per feed (pollers + optional stream)
//! 6. Register one HybridWorker per feed with the Supervisor
//! 7. Spawn health (/live, /ready, /health) and metrics (/metrics) servers
//! 8. start_all, wait for SIGINT, stop_all in reverse order

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use feed_ingest::adapters::api::{FeedAuth, FeedPollJob, HttpExecutor, HttpExecutorConfig};
use feed_ingest::adapters::feeds::{JsonFrameDecoder, WsConnector};
use feed_ingest::adapters::metrics::{HealthServer, MetricsRegistry, TracingAlertSink};
use feed_ingest::adapters::persistence::JsonlSink;
use feed_ingest::config::{self, AppConfig, FeedConfig};
use feed_ingest::domain::quote::Quote;
use feed_ingest::ports::request_executor::{PollRequest, RequestExecutor};
use feed_ingest::ports::sinks::{AlertSink, PersistenceSink};
use feed_ingest::usecases::{
  HybridDataManager, HybridWorker, Poller, RateLimiter, StreamHandler, Supervisor,
};

/// Shared adapters every feed is built from.
struct Wiring {
  executor: Arc<dyn RequestExecutor>,
  auth: Option<Arc<FeedAuth>>,
  limiters: HashMap<String, Arc<RateLimiter>>,
  persistence: Option<Arc<dyn PersistenceSink>>,
  alerts: Arc<dyn AlertSink>,
}

#[tokio::main]
async fn main() -> Result<()> {
  // ── 1. Load configuration ───────────────────────────────
  let config_path = std::env::args()
    .nth(1)
    .unwrap_or_else(|| "config.toml".to_string());
  let config = config::loader::load_config(&config_path).context("Failed to load configuration")?;

  // ── 2. Initialize structured JSON logging ───────────────
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.app.log_level)),
    )
    .json()
    .init();

  info!(
    name = %config.app.name,
    version = env!("CARGO_PKG_VERSION"),
    feeds = config.feeds.len(),
    "Starting feed ingest"
  );

  // ── 3-4. Credentials, executor, rate limiters ───────────
  let wiring = build_wiring(&config).await?;

  // ── 5-6. Feeds and supervisor ───────────────────────────
  let mut supervisor = Supervisor::new(config.supervisor.to_supervisor_config()?)
    .with_alerts(Arc::clone(&wiring.alerts))?;
  if let Some(persistence) = &wiring.persistence {
    supervisor = supervisor.with_persistence(Arc::clone(persistence))?;
  }

  let mut managers = Vec::with_capacity(config.feeds.len());
  for feed in &config.feeds {
    let manager = Arc::new(
      build_feed(feed, &config, &wiring).with_context(|| format!("Failed to build feed '{}'", feed.name))?,
    );
    let feed_name = feed.name.clone();
    manager.register_callback(Arc::new(move |quote: &Quote| -> anyhow::Result<()> {
      debug!(feed = %feed_name, instrument = %quote.instrument_id, source = %quote.source, "Quote accepted");
      Ok(())
    }));
    supervisor = supervisor.with_worker(Arc::new(HybridWorker::new(
      feed.name.clone(),
      Arc::clone(&manager),
      feed.instruments.clone(),
    )))?;
    managers.push((feed.name.clone(), manager));
  }
  let supervisor = Arc::new(supervisor);

  // ── 7. Health and metrics servers ───────────────────────
  let servers_cancel = CancellationToken::new();
  let mut server_handles = Vec::new();
  if config.metrics.enabled {
    let health = HealthServer::new(
      supervisor.watch_reports(),
      config.metrics.health_bind_address.clone(),
    );
    let cancel = servers_cancel.clone();
    server_handles.push(tokio::spawn(async move {
      if let Err(e) = health.run(cancel).await {
        error!(error = %e, "Health server failed");
      }
    }));

    let metrics = Arc::new(MetricsRegistry::new().context("Failed to create metrics registry")?);
    server_handles.push(Arc::clone(&metrics).spawn_collector(
      managers.clone(),
      wiring.limiters.values().cloned().collect(),
      supervisor.watch_reports(),
      Duration::from_millis(config.metrics.collect_interval_ms),
      servers_cancel.clone(),
    ));
    let bind = config.metrics.bind_address.clone();
    let cancel = servers_cancel.clone();
    server_handles.push(tokio::spawn(async move {
      if let Err(e) = metrics.serve(bind, cancel).await {
        error!(error = %e, "Metrics server failed");
      }
    }));
  }

  // ── 8. Run until SIGINT ─────────────────────────────────
  supervisor.start_all().await.context("Failed to start workers")?;
  info!("All workers started, ingest is running");

  signal::ctrl_c().await.context("Failed to listen for SIGINT")?;
  info!("SIGINT received, initiating graceful shutdown");

  let report = supervisor.stop_all().await;
  for (worker, failure) in &report.failures {
    warn!(%worker, %failure, "Worker did not stop cleanly");
  }

  servers_cancel.cancel();
  for handle in server_handles {
    if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
      warn!("Server task did not finish within 5s");
    }
  }

  info!(stopped = report.stopped.len(), "Shutdown complete");
  report.into_result().context("Shutdown incomplete")
}

async fn build_wiring(config: &AppConfig) -> Result<Wiring> {
  let needs_auth = config.api.authenticated
    || config
      .feeds
      .iter()
      .any(|f| f.stream.as_ref().is_some_and(|s| s.authenticated));
  let auth = if needs_auth {
    Some(Arc::new(
      FeedAuth::from_env().context("Failed to load feed credentials from env")?,
    ))
  } else {
    None
  };

  let executor = HttpExecutor::new(
    if config.api.authenticated { auth.clone() } else { None },
    HttpExecutorConfig {
      base_url: config.api.base_url.clone(),
      timeout: Duration::from_millis(config.api.timeout_ms),
      max_concurrent: config.api.max_concurrent,
    },
  )
  .context("Failed to create HTTP executor")?;

  let mut limiters = HashMap::new();
  for limit in &config.rate_limits {
    let limiter = RateLimiter::new(limit.name.clone(), limit.to_limiter_config())?;
    limiters.insert(limit.name.clone(), Arc::new(limiter));
  }

  let persistence: Option<Arc<dyn PersistenceSink>> = if config.persistence.enabled {
    let sink = JsonlSink::new(&config.persistence.data_dir)
      .await
      .context("Failed to open persistence directory")?;
    Some(Arc::new(sink))
  } else {
    None
  };

  Ok(Wiring {
    executor: Arc::new(executor),
    auth,
    limiters,
    persistence,
    alerts: Arc::new(TracingAlertSink::new()),
  })
}

/// One hybrid manager with its pollers and optional stream.
fn build_feed(feed: &FeedConfig, config: &AppConfig, wiring: &Wiring) -> Result<HybridDataManager> {
  let mut manager = HybridDataManager::new(feed.to_hybrid_config()?, wiring.persistence.clone())
    .with_alerts(Arc::clone(&wiring.alerts));
  let ingress = manager.ingress();

  for section in &feed.pollers {
    let limiter = wiring
      .limiters
      .get(&section.limiter)
      .with_context(|| format!("Unknown rate limit '{}'", section.limiter))?;
    let request = section
      .query
      .iter()
      .fold(PollRequest::get(section.path.clone()), |req, (k, v)| {
        req.with_query(k.clone(), v.clone())
      });
    let job = FeedPollJob::new(
      section.name.clone(),
      section.kind.into(),
      request,
      Arc::clone(&wiring.executor),
      Arc::clone(limiter),
      Arc::clone(&ingress),
    )
    .with_cost(section.cost);
    let poller = Poller::new(Arc::new(job), section.to_poller_config()?);
    manager = manager.with_poller(Arc::new(poller))?;
  }

  if let Some(section) = &feed.stream {
    let auth = if section.authenticated {
      wiring.auth.clone()
    } else {
      None
    };
    let connector = WsConnector::new(section.url.clone(), auth)
      .with_handshake_timeout(Duration::from_secs(section.handshake_timeout_secs));
    let handler = StreamHandler::new(
      format!("{}-stream", feed.name),
      Box::new(connector),
      Arc::new(JsonFrameDecoder),
      Arc::clone(&ingress),
      section.to_stream_config()?,
    )
    .with_alerts(Arc::clone(&wiring.alerts));
    manager = manager.with_stream(Arc::new(handler));
  }

  info!(
    feed = %feed.name,
    pollers = feed.pollers.len(),
    stream = feed.stream.is_some(),
    api = %config.api.base_url,
    "Feed wired"
  );
  Ok(manager)
}

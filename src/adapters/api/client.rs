//! Feed HTTP Client - Authenticated REST Request Executor
//!
//! Wraps reqwest with request signing and a concurrency cap. Status
//! classification is left to the caller: any HTTP response, including
//! 4xx/5xx, is returned as a `PollResponse`. Only transport failures
//! become errors here.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::auth::FeedAuth;
use crate::error::{IngestError, IngestResult};
use crate::ports::request_executor::{PollRequest, PollResponse, RequestExecutor, RequestMethod};

/// Configuration for the HTTP executor.
#[derive(Debug, Clone)]
pub struct HttpExecutorConfig {
  /// Base URL every request path is appended to.
  pub base_url: String,
  /// Whole-request timeout.
  pub timeout: Duration,
  /// Maximum in-flight requests.
  pub max_concurrent: usize,
}

impl Default for HttpExecutorConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:8000".to_string(),
      timeout: Duration::from_secs(10),
      max_concurrent: 10,
    }
  }
}

/// `RequestExecutor` over reqwest.
pub struct HttpExecutor {
  http: Client,
  /// `None` for public endpoints.
  auth: Option<Arc<FeedAuth>>,
  config: HttpExecutorConfig,
  semaphore: Arc<Semaphore>,
}

impl HttpExecutor {
  pub fn new(auth: Option<Arc<FeedAuth>>, config: HttpExecutorConfig) -> Result<Self> {
    anyhow::ensure!(config.max_concurrent > 0, "max_concurrent must be positive");

    let http = Client::builder()
      .timeout(config.timeout)
      .pool_max_idle_per_host(5)
      .build()
      .context("Failed to build HTTP client")?;

    let semaphore = Arc::new(Semaphore::new(config.max_concurrent));

    Ok(Self {
      http,
      auth,
      config,
      semaphore,
    })
  }

  fn url(&self, path: &str) -> String {
    format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
  }
}

#[async_trait]
impl RequestExecutor for HttpExecutor {
  async fn execute(&self, request: &PollRequest) -> IngestResult<PollResponse> {
    let _permit = self
      .semaphore
      .acquire()
      .await
      .map_err(|_| IngestError::Cancelled)?;

    let url = self.url(&request.path);
    let body = request.body.clone().unwrap_or_default();

    let mut req = match request.method {
      RequestMethod::Get => self.http.get(&url),
      RequestMethod::Post => self
        .http
        .post(&url)
        .header("Content-Type", "application/json")
        .body(body.clone()),
    };
    if !request.query.is_empty() {
      req = req.query(&request.query);
    }

    if let Some(auth) = &self.auth {
      let headers = auth.auth_headers(request.method.as_str(), &request.path, &body);
      req = req
        .header("FEED-API-KEY", headers.api_key)
        .header("FEED-TIMESTAMP", headers.timestamp)
        .header("FEED-SIGNATURE", headers.signature)
        .header("FEED-NONCE", headers.nonce.to_string());
    }

    let response = req.send().await.map_err(|e| {
      warn!(error = %e, path = %request.path, "Request failed");
      IngestError::TransientIo(e.to_string())
    })?;

    let status = response.status().as_u16();
    let text = response
      .text()
      .await
      .map_err(|e| IngestError::TransientIo(format!("failed to read body: {e}")))?;

    debug!(status, path = %request.path, bytes = text.len(), "Response received");

    Ok(PollResponse {
      status,
      body: text,
      received_at: Utc::now(),
    })
  }
}

//! Request Executor Port - Authenticated REST Capability
//!
//! Pollers never talk HTTP directly. They hand a `PollRequest` to an
//! authenticated executor and classify the `PollResponse` themselves.
//! Signing, connection pooling and TLS live behind this trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{IngestError, IngestResult};

/// HTTP verb for a poll request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMethod {
  Get,
  Post,
}

impl RequestMethod {
  /// Upper-case verb used for request signing.
  pub const fn as_str(self) -> &'static str {
    match self {
      Self::Get => "GET",
      Self::Post => "POST",
    }
  }
}

/// A single outbound request issued by a poll cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollRequest {
  /// HTTP verb.
  pub method: RequestMethod,
  /// Path relative to the executor's base URL.
  pub path: String,
  /// Query string parameters.
  pub query: Vec<(String, String)>,
  /// Optional JSON body.
  pub body: Option<String>,
}

impl PollRequest {
  /// GET request with no parameters.
  pub fn get(path: impl Into<String>) -> Self {
    Self {
      method: RequestMethod::Get,
      path: path.into(),
      query: Vec::new(),
      body: None,
    }
  }

  /// Append a query parameter.
  #[must_use]
  pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.query.push((key.into(), value.into()));
    self
  }
}

/// Raw response returned by the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollResponse {
  /// HTTP status code.
  pub status: u16,
  /// Response body as text.
  pub body: String,
  /// When the response was received.
  pub received_at: DateTime<Utc>,
}

impl PollResponse {
  /// Successful response received now.
  pub fn ok(body: impl Into<String>) -> Self {
    Self {
      status: 200,
      body: body.into(),
      received_at: Utc::now(),
    }
  }

  /// Map the status code onto the error taxonomy.
  ///
  /// 2xx passes; 401/403 are credential failures; 408, 429 and 5xx are
  /// transient; any other status means the request itself is wrong.
  pub fn check_status(&self) -> IngestResult<()> {
    match self.status {
      200..=299 => Ok(()),
      401 | 403 => Err(IngestError::Auth(format!("upstream returned {}", self.status))),
      408 | 429 | 500..=599 => Err(IngestError::TransientIo(format!(
        "upstream returned {}",
        self.status
      ))),
      status => Err(IngestError::Protocol(format!(
        "unexpected status {status}: {}",
        truncate(&self.body, 200)
      ))),
    }
  }
}

fn truncate(text: &str, max: usize) -> &str {
  match text.char_indices().nth(max) {
    Some((idx, _)) => &text[..idx],
    None => text,
  }
}

/// Authenticated request executor consumed by poll jobs.
///
/// Implementations return `Ok` for any HTTP response that arrived and
/// reserve `Err` for transport failures (`TransientIo`) or local signing
/// failures (`Auth`).
#[async_trait]
pub trait RequestExecutor: Send + Sync + 'static {
  /// Execute one request.
  async fn execute(&self, request: &PollRequest) -> IngestResult<PollResponse>;
}

#[cfg(test)]
mod tests {
  use super::*;

  fn response(status: u16) -> PollResponse {
    PollResponse {
      status,
      body: "{}".to_string(),
      received_at: Utc::now(),
    }
  }

  #[test]
  fn test_status_classification() {
    assert!(response(200).check_status().is_ok());
    assert!(matches!(response(401).check_status(), Err(IngestError::Auth(_))));
    assert!(matches!(response(429).check_status(), Err(IngestError::TransientIo(_))));
    assert!(matches!(response(503).check_status(), Err(IngestError::TransientIo(_))));
    assert!(matches!(response(404).check_status(), Err(IngestError::Protocol(_))));
  }

  #[test]
  fn test_request_builder() {
    let req = PollRequest::get("/scoreboard").with_query("league", "nba");
    assert_eq!(req.method.as_str(), "GET");
    assert_eq!(req.query, vec![("league".to_string(), "nba".to_string())]);
  }
}

//! WebSocket Stream Connector
//!
//! `StreamConnector` over tokio-tungstenite. Only moves text frames;
//! the stream handler owns reconnects and the frame decoder owns the
//! payload format.
//!
//! Login convention: the connector sends
//! `{"op":"auth","key":..,"timestamp":..,"signature":..}` and expects
//! `{"type":"authenticated"}` back. An `{"type":"error"}` reply is an
//! authentication failure; other frames arriving first are skipped.
//! Connectors built without credentials skip the exchange.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, instrument, warn};

use crate::adapters::api::auth::FeedAuth;
use crate::domain::quote::InstrumentId;
use crate::error::{IngestError, IngestResult};
use crate::ports::stream_connector::StreamConnector;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Path component signed in the login frame.
const AUTH_PATH: &str = "/stream";

#[derive(Debug, Deserialize)]
struct AuthReply {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum LoginReply {
    Accepted,
    Rejected(String),
    Unrelated,
}

fn login_reply(raw: &str) -> LoginReply {
    match serde_json::from_str::<AuthReply>(raw) {
        Ok(reply) if reply.kind == "authenticated" => LoginReply::Accepted,
        Ok(reply) if reply.kind == "error" => LoginReply::Rejected(
            reply.message.unwrap_or_else(|| "login rejected".to_string()),
        ),
        _ => LoginReply::Unrelated,
    }
}

/// WebSocket transport for one stream handler.
pub struct WsConnector {
    url: String,
    auth: Option<Arc<FeedAuth>>,
    handshake_timeout: Duration,
    ws: Option<WsStream>,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, auth: Option<Arc<FeedAuth>>) -> Self {
        Self {
            url: url.into(),
            auth,
            handshake_timeout: Duration::from_secs(10),
            ws: None,
        }
    }

    /// Bound for the transport handshake and the login reply.
    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    fn stream(&mut self) -> IngestResult<&mut WsStream> {
        self.ws
            .as_mut()
            .ok_or_else(|| IngestError::TransientIo("websocket is not connected".into()))
    }

    /// Read frames until the login is accepted or rejected. Heartbeats,
    /// echoes and anything else that is not a login reply are skipped.
    async fn await_login_reply(&mut self) -> IngestResult<()> {
        loop {
            let raw = self
                .receive()
                .await?
                .ok_or_else(|| IngestError::TransientIo("stream closed during login".into()))?;
            match login_reply(&raw) {
                LoginReply::Accepted => {
                    debug!("Stream login accepted");
                    return Ok(());
                }
                LoginReply::Rejected(message) => return Err(IngestError::Auth(message)),
                LoginReply::Unrelated => debug!(len = raw.len(), "Frame before login reply skipped"),
            }
        }
    }

    async fn send_json(&mut self, payload: &serde_json::Value) -> IngestResult<()> {
        let text = payload.to_string();
        self.stream()?
            .send(Message::text(text))
            .await
            .map_err(|e| IngestError::TransientIo(format!("websocket send failed: {e}")))
    }
}

#[async_trait]
impl StreamConnector for WsConnector {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn connect(&mut self) -> IngestResult<()> {
        self.ws = None;
        let (ws, _) = tokio::time::timeout(self.handshake_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| IngestError::TransientIo("websocket handshake timed out".into()))?
            .map_err(|e| IngestError::TransientIo(format!("websocket connect failed: {e}")))?;
        self.ws = Some(ws);
        info!("WebSocket connected");
        Ok(())
    }

    async fn authenticate(&mut self) -> IngestResult<()> {
        let Some(auth) = self.auth.clone() else {
            return Ok(());
        };

        let timestamp = FeedAuth::timestamp();
        let signature = auth.sign(&timestamp, "GET", AUTH_PATH, "");
        self.send_json(&json!({
            "op": "auth",
            "key": auth.api_key(),
            "timestamp": timestamp,
            "signature": signature,
        }))
        .await?;

        let deadline = self.handshake_timeout;
        tokio::time::timeout(deadline, self.await_login_reply())
            .await
            .map_err(|_| IngestError::TransientIo("no reply to login frame".into()))?
    }

    async fn subscribe(&mut self, instrument_ids: &[InstrumentId]) -> IngestResult<()> {
        if instrument_ids.is_empty() {
            return Ok(());
        }
        self.send_json(&json!({
            "op": "subscribe",
            "instruments": instrument_ids,
        }))
        .await
    }

    /// Cancel-safe: each await point is a single `next()` on the stream.
    async fn receive(&mut self) -> IngestResult<Option<String>> {
        let ws = self.stream()?;
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.to_string())),
                Some(Ok(Message::Binary(bytes))) => {
                    return String::from_utf8(bytes.to_vec())
                        .map(Some)
                        .map_err(|e| IngestError::Protocol(format!("non-utf8 binary frame: {e}")));
                }
                Some(Ok(Message::Ping(data))) => {
                    // Pong is handled automatically by tungstenite
                    debug!(len = data.len(), "Ping received");
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Close frame received");
                    return Ok(None);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return Err(IngestError::TransientIo(format!("websocket error: {e}")));
                }
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) -> IngestResult<()> {
        if let Some(mut ws) = self.ws.take() {
            if let Err(e) = ws.close(None).await {
                warn!(error = %e, "WebSocket close handshake failed");
            }
        }
        Ok(())
    }
}

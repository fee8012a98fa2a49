//! Streamable-HTTP transport.
//!
//! Every message is one POST to the server URL. Request replies come back
//! in the response body, either as a single JSON object or as a short
//! `text/event-stream`. The `Mcp-Session-Id` header is echoed once issued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::sse::parse_sse_events;
use super::{HandlerSlot, Transport, TransportHandlers};
use crate::config::{ServerConfig, ServerType};
use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::{JsonRpcMessage, MessageKind};

const SESSION_HEADER: &str = "mcp-session-id";

/// Upper bound on a single health probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Request/response HTTP transport.
pub struct HttpTransport {
    config: ServerConfig,
    url: reqwest::Url,
    client: reqwest::Client,
    handlers: Arc<HandlerSlot>,
    session_id: Mutex<Option<String>>,
    connected: AtomicBool,
}

impl HttpTransport {
    pub fn new(config: &ServerConfig) -> Result<Self, McpError> {
        Ok(Self {
            url: super::parse_server_url(config)?,
            client: super::build_http_client(config)?,
            config: config.clone(),
            handlers: Arc::new(HandlerSlot::default()),
            session_id: Mutex::new(None),
            connected: AtomicBool::new(false),
        })
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    /// HEAD the server URL, falling back to GET when HEAD is not allowed.
    ///
    /// Anything below 500 counts as reachable.
    async fn probe(&self) -> Result<reqwest::StatusCode, reqwest::Error> {
        let head = self
            .client
            .head(self.url.clone())
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?;
        if head.status() != reqwest::StatusCode::METHOD_NOT_ALLOWED {
            return Ok(head.status());
        }
        let get = self
            .client
            .get(self.url.clone())
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?;
        Ok(get.status())
    }

    /// Pick the reply out of a response body, dispatching anything else.
    fn decode_reply(
        &self,
        content_type: &str,
        body: &str,
    ) -> Result<Option<JsonRpcMessage>, McpError> {
        if content_type.contains("text/event-stream") {
            let mut reply = None;
            for event in parse_sse_events(body) {
                if event.event_type() != "message" || event.data.trim().is_empty() {
                    continue;
                }
                let message: JsonRpcMessage = serde_json::from_str(&event.data).map_err(|e| {
                    McpError::connection(self.name(), format!("invalid JSON-RPC in event: {e}"))
                })?;
                if reply.is_none() && message.kind() == MessageKind::Response {
                    reply = Some(message);
                } else {
                    self.handlers.get().dispatch(message);
                }
            }
            return Ok(reply);
        }

        serde_json::from_str::<JsonRpcMessage>(body)
            .map(Some)
            .map_err(|e| McpError::connection(self.name(), format!("invalid JSON-RPC response: {e}")))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    /// Verifies the server is reachable; no persistent connection is held.
    async fn connect(&self) -> Result<(), McpError> {
        match self.probe().await {
            Ok(status) if status.as_u16() < 500 => {
                self.connected.store(true, Ordering::SeqCst);
                Ok(())
            }
            Ok(status) => Err(McpError::connection(
                self.name(),
                format!("server unavailable: HTTP {status}"),
            )),
            Err(e) => Err(McpError::connection(
                self.name(),
                format!("failed to reach server: {e}"),
            )),
        }
    }

    async fn disconnect(&self) -> Result<(), McpError> {
        self.connected.store(false, Ordering::SeqCst);
        *self.session_id.lock().await = None;
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<Option<JsonRpcMessage>, McpError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(McpError::connection(self.name(), "transport is not connected"));
        }

        let mut request = self
            .client
            .post(self.url.clone())
            .header(
                reqwest::header::ACCEPT,
                "application/json, text/event-stream",
            )
            .json(&message);
        if let Some(session) = self.session_id.lock().await.as_deref() {
            request = request.header(SESSION_HEADER, session);
        }

        tracing::debug!(
            server = %self.name(),
            method = ?message.method,
            id = ?message.id,
            "sending JSON-RPC message via HTTP POST"
        );

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                McpError::Timeout {
                    server: self.name().to_string(),
                    operation: message.method.clone().unwrap_or_default(),
                    timeout_ms: self.config.settings.timeout_duration().as_millis() as u64,
                }
            } else {
                McpError::connection(self.name(), format!("HTTP request failed: {e}"))
            }
        })?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut guard = self.session_id.lock().await;
            if guard.as_deref() != Some(session) {
                tracing::debug!(server = %self.name(), session_id = session, "captured MCP session ID");
                *guard = Some(session.to_string());
            }
        }

        let status = response.status();
        if !status.is_success() {
            return Err(McpError::connection(
                self.name(),
                format!("server returned HTTP {status}"),
            ));
        }

        // Notifications get an empty 202; nothing to decode.
        if message.id.is_none() {
            return Ok(None);
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response
            .text()
            .await
            .map_err(|e| McpError::connection(self.name(), format!("failed to read response body: {e}")))?;

        if body.trim().is_empty() {
            return Err(McpError::connection(
                self.name(),
                "empty response body for request",
            ));
        }
        self.decode_reply(&content_type, &body)
    }

    async fn is_healthy(&self) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        match self.probe().await {
            Ok(status) => status.as_u16() < 500,
            Err(e) => {
                tracing::debug!(server = %self.name(), error = %e, "health probe failed");
                false
            }
        }
    }

    fn set_handlers(&self, handlers: TransportHandlers) {
        self.handlers.set(handlers);
    }

    fn kind(&self) -> ServerType {
        ServerType::StreamableHttp
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

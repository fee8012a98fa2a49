//! Wire transports for MCP servers.
//!
//! One implementation per protocol, all behind the [`Transport`] trait:
//! - `stdio`: child process, newline-delimited JSON on stdin/stdout
//! - `sse`: one long-lived event stream plus POSTs to the announced endpoint
//! - `http`: plain request/response POSTs
//!
//! Streaming transports deliver inbound messages through the registered
//! [`TransportHandlers`]. The HTTP transport answers inline from `send`.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::errors::McpError;
use super::types::JsonRpcMessage;
use crate::config::{ServerConfig, ServerType};

pub mod http;
#[cfg(test)]
pub mod mock;
pub mod sse;
pub mod stdio;

pub use http::HttpTransport;
pub use sse::SseTransport;
pub use stdio::StdioTransport;

// ─── Handlers ────────────────────────────────────────────────────────────────

/// Callback for inbound JSON-RPC messages.
pub type MessageHandler = Arc<dyn Fn(JsonRpcMessage) + Send + Sync>;

/// Callback for asynchronous transport failures (dropped stream, dead process).
pub type ErrorHandler = Arc<dyn Fn(McpError) + Send + Sync>;

/// Inbound callbacks registered by the owning client.
#[derive(Clone, Default)]
pub struct TransportHandlers {
    on_message: Option<MessageHandler>,
    on_error: Option<ErrorHandler>,
}

impl TransportHandlers {
    pub fn new(on_message: MessageHandler, on_error: ErrorHandler) -> Self {
        Self {
            on_message: Some(on_message),
            on_error: Some(on_error),
        }
    }

    pub fn dispatch(&self, message: JsonRpcMessage) {
        match &self.on_message {
            Some(handler) => handler(message),
            None => tracing::debug!(method = ?message.method, "no message handler registered"),
        }
    }

    pub fn report(&self, error: McpError) {
        match &self.on_error {
            Some(handler) => handler(error),
            None => tracing::warn!(error = %error, "transport error with no handler registered"),
        }
    }
}

/// Shared slot holding the current handlers; readable from background tasks.
#[derive(Default)]
pub struct HandlerSlot(RwLock<TransportHandlers>);

impl HandlerSlot {
    pub fn set(&self, handlers: TransportHandlers) {
        match self.0.write() {
            Ok(mut guard) => *guard = handlers,
            Err(poisoned) => *poisoned.into_inner() = handlers,
        }
    }

    pub fn get(&self) -> TransportHandlers {
        match self.0.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

// ─── Transport Trait ─────────────────────────────────────────────────────────

/// Connect/disconnect/send/health contract shared by every wire protocol.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection (spawn the process, open the stream, ...).
    async fn connect(&self) -> Result<(), McpError>;

    /// Tear the connection down. Idempotent.
    async fn disconnect(&self) -> Result<(), McpError>;

    /// Send one message.
    ///
    /// Request/response transports return the reply as `Some`. Streaming
    /// transports return `None` and deliver the reply to the message handler.
    async fn send(&self, message: JsonRpcMessage) -> Result<Option<JsonRpcMessage>, McpError>;

    /// Transport-level liveness probe.
    async fn is_healthy(&self) -> bool;

    /// Register inbound message/error callbacks.
    fn set_handlers(&self, handlers: TransportHandlers);

    fn kind(&self) -> ServerType;
}

// ─── Factory ─────────────────────────────────────────────────────────────────

/// Builds a transport for a server config. Swappable so tests can inject fakes.
pub trait TransportFactory: Send + Sync {
    fn create(&self, config: &ServerConfig) -> Result<Arc<dyn Transport>, McpError>;
}

/// Picks the real transport from `config.server_type`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, config: &ServerConfig) -> Result<Arc<dyn Transport>, McpError> {
        let transport: Arc<dyn Transport> = match config.server_type {
            ServerType::Stdio => Arc::new(StdioTransport::new(config)?),
            ServerType::Sse => Arc::new(SseTransport::new(config)?),
            ServerType::StreamableHttp => Arc::new(HttpTransport::new(config)?),
        };
        Ok(transport)
    }
}

// ─── Shared Helpers ──────────────────────────────────────────────────────────

/// Parse a configured URL, accepting only http(s).
pub(crate) fn parse_server_url(config: &ServerConfig) -> Result<reqwest::Url, McpError> {
    let raw = config.url.as_deref().ok_or_else(|| {
        McpError::connection(&config.name, format!("{} server has no url", config.server_type))
    })?;
    let url = reqwest::Url::parse(raw)
        .map_err(|e| McpError::connection(&config.name, format!("invalid url '{raw}': {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(McpError::connection(
            &config.name,
            format!("unsupported url scheme '{other}'"),
        )),
    }
}

/// Build the reusable header map from configured headers, skipping invalid ones.
pub(crate) fn build_header_map(config: &ServerConfig) -> reqwest::header::HeaderMap {
    let mut headers = reqwest::header::HeaderMap::new();
    for (key, value) in &config.headers {
        match (
            reqwest::header::HeaderName::from_bytes(key.as_bytes()),
            reqwest::header::HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(val)) => {
                headers.insert(name, val);
            }
            _ => tracing::warn!(server = %config.name, header = %key, "skipping invalid header"),
        }
    }
    headers
}

/// Build the HTTP client used by network transports.
pub(crate) fn build_http_client(config: &ServerConfig) -> Result<reqwest::Client, McpError> {
    reqwest::Client::builder()
        .connect_timeout(config.settings.timeout_duration())
        .default_headers(build_header_map(config))
        .build()
        .map_err(|e| McpError::connection(&config.name, format!("failed to build HTTP client: {e}")))
}

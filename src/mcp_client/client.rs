//! Per-server MCP session.
//!
//! `McpServerClient` owns one transport and layers the protocol on top:
//! - connection state machine
//! - request/response correlation through a pending table of one-shot senders
//! - the `initialize` handshake (once per connection)
//! - cached tool discovery and tool invocation
//! - cached health checks and reconnect with exponential backoff

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use super::errors::McpError;
use super::lifecycle::backoff_delay;
use super::transport::{Transport, TransportHandlers};
use super::types::{
    methods, ConnectionState, InitializeResult, JsonRpcMessage, ListToolsResult, MessageKind,
    ServerInfo, Tool, CLIENT_NAME, PROTOCOL_VERSION,
};
use crate::config::ServerConfig;

// ─── Constants ───────────────────────────────────────────────────────────────

/// How long a discovered tool list stays fresh.
pub const TOOL_CACHE_TTL: Duration = Duration::from_secs(300);

/// Safety stop for servers that keep returning a `nextCursor`.
const MAX_LIST_PAGES: usize = 64;

/// Tool-name prefixes that belong to the host or its UI, never proxied.
const INTERNAL_TOOL_PREFIXES: &[&str] = &["_", "ui/", "internal/"];

type PendingSender = oneshot::Sender<Result<Value, McpError>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ─── Shared State ────────────────────────────────────────────────────────────

/// State touched by transport callbacks as well as by the client itself.
struct Shared {
    server: String,
    state: RwLock<ConnectionState>,
    pending: Mutex<HashMap<u64, PendingSender>>,
    tools_stale: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        match self.state.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let mut guard = match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *guard != next {
            tracing::debug!(server = %self.server, from = %*guard, to = %next, "connection state change");
            *guard = next;
        }
    }

    fn record_error(&self, error: &McpError) {
        *lock(&self.last_error) = Some(error.to_string());
    }

    /// Route an inbound message: responses resolve pending requests,
    /// notifications are handled here and never touch the pending table.
    fn handle_message(&self, message: JsonRpcMessage) {
        match message.kind() {
            MessageKind::Response => {
                let Some(id) = message.id_as_u64() else {
                    tracing::warn!(server = %self.server, id = ?message.id, "response with unusable id");
                    return;
                };
                let Some(sender) = lock(&self.pending).remove(&id) else {
                    tracing::debug!(server = %self.server, id, "response for unknown or expired request");
                    return;
                };
                let _ = sender.send(extract_result(message));
            }
            MessageKind::Notification => {
                let method = message.method.as_deref().unwrap_or_default();
                if method == methods::TOOLS_LIST_CHANGED {
                    tracing::info!(server = %self.server, "server reported tool list change");
                    self.tools_stale.store(true, Ordering::SeqCst);
                } else {
                    tracing::debug!(server = %self.server, method, "ignoring notification");
                }
            }
            MessageKind::Request => {
                tracing::debug!(
                    server = %self.server,
                    method = ?message.method,
                    "ignoring server-initiated request"
                );
            }
            MessageKind::Invalid => {
                tracing::warn!(server = %self.server, "dropping malformed JSON-RPC message");
            }
        }
    }

    /// Asynchronous transport failure: mark failed and release every waiter.
    fn handle_transport_error(&self, error: McpError) {
        tracing::warn!(server = %self.server, error = %error, "transport error");
        self.record_error(&error);
        self.set_state(ConnectionState::Failed);
        self.fail_pending(&error.to_string());
    }

    fn fail_pending(&self, reason: &str) {
        let drained: Vec<PendingSender> = lock(&self.pending).drain().map(|(_, tx)| tx).collect();
        if !drained.is_empty() {
            tracing::debug!(server = %self.server, count = drained.len(), "rejecting pending requests");
        }
        for sender in drained {
            let _ = sender.send(Err(McpError::connection(&self.server, reason)));
        }
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcMessage) -> Result<Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: super::types::error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

/// Unwrap an MCP `tools/call` result.
///
/// The first content item's `text` (decoded when it holds a JSON object or
/// array) or `data` wins; anything else is returned unchanged.
pub fn unwrap_call_result(tool: &str, result: Value) -> Result<Value, McpError> {
    let is_error = result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let Some(content) = result.get("content").and_then(Value::as_array) else {
        return Ok(result);
    };

    if is_error {
        let message = content
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n");
        return Err(McpError::ToolExecution {
            tool: tool.to_string(),
            message: if message.is_empty() {
                "tool reported an error".into()
            } else {
                message
            },
        });
    }

    let Some(first) = content.first() else {
        return Ok(result);
    };
    if let Some(text) = first.get("text").and_then(Value::as_str) {
        return Ok(decode_json_text(text));
    }
    if let Some(data) = first.get("data") {
        return Ok(data.clone());
    }
    Ok(result)
}

fn decode_json_text(text: &str) -> Value {
    match serde_json::from_str::<Value>(text.trim()) {
        Ok(parsed) if parsed.is_object() || parsed.is_array() => parsed,
        _ => Value::String(text.to_string()),
    }
}

fn is_internal_tool(name: &str) -> bool {
    INTERNAL_TOOL_PREFIXES.iter().any(|p| name.starts_with(p))
}

// ─── Status ──────────────────────────────────────────────────────────────────

/// Point-in-time view of one client, for stats and introspection.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub name: String,
    pub server_type: String,
    pub state: ConnectionState,
    pub initialized: bool,
    pub cached_tools: usize,
    pub reconnect_count: u32,
    pub last_error: Option<String>,
    pub server_info: Option<ServerInfo>,
}

struct ToolCache {
    tools: Vec<Tool>,
    fetched_at: Instant,
}

// ─── Client ──────────────────────────────────────────────────────────────────

/// One session with one configured server.
pub struct McpServerClient {
    config: ServerConfig,
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    initialized: AtomicBool,
    server_info: RwLock<Option<ServerInfo>>,
    tool_cache: RwLock<Option<ToolCache>>,
    health: tokio::sync::Mutex<Option<(Instant, bool)>>,
    /// Serializes connect/initialize/reconnect.
    session_lock: tokio::sync::Mutex<()>,
    reconnect_count: AtomicU32,
}

impl McpServerClient {
    /// Wrap a transport and register this client's inbound handlers on it.
    pub fn new(config: ServerConfig, transport: Arc<dyn Transport>) -> Self {
        let shared = Arc::new(Shared {
            server: config.name.clone(),
            state: RwLock::new(ConnectionState::Disconnected),
            pending: Mutex::new(HashMap::new()),
            tools_stale: AtomicBool::new(false),
            last_error: Mutex::new(None),
        });

        let on_message = {
            let shared = shared.clone();
            Arc::new(move |message: JsonRpcMessage| shared.handle_message(message))
        };
        let on_error = {
            let shared = shared.clone();
            Arc::new(move |error: McpError| shared.handle_transport_error(error))
        };
        transport.set_handlers(TransportHandlers::new(on_message, on_error));

        Self {
            config,
            transport,
            shared,
            next_id: AtomicU64::new(1),
            initialized: AtomicBool::new(false),
            server_info: RwLock::new(None),
            tool_cache: RwLock::new(None),
            health: tokio::sync::Mutex::new(None),
            session_lock: tokio::sync::Mutex::new(()),
            reconnect_count: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        match self.server_info.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared.last_error).clone()
    }

    /// Tools from the last successful discovery, fresh or not.
    pub fn cached_tools(&self) -> Vec<Tool> {
        match self.tool_cache.read() {
            Ok(guard) => guard.as_ref().map(|c| c.tools.clone()).unwrap_or_default(),
            Err(poisoned) => poisoned
                .into_inner()
                .as_ref()
                .map(|c| c.tools.clone())
                .unwrap_or_default(),
        }
    }

    pub fn status(&self) -> ClientStatus {
        ClientStatus {
            name: self.config.name.clone(),
            server_type: self.config.server_type.to_string(),
            state: self.state(),
            initialized: self.is_initialized(),
            cached_tools: self.cached_tools().len(),
            reconnect_count: self.reconnect_count.load(Ordering::SeqCst),
            last_error: self.last_error(),
            server_info: self.server_info(),
        }
    }

    // ── Connection ──────────────────────────────────────────────────────────

    /// Connect the transport. No-op when already connected.
    pub async fn connect(&self) -> Result<(), McpError> {
        let _session = self.session_lock.lock().await;
        self.connect_locked().await
    }

    async fn connect_locked(&self) -> Result<(), McpError> {
        if self.is_connected() {
            return Ok(());
        }
        if self.state() != ConnectionState::Reconnecting {
            self.shared.set_state(ConnectionState::Connecting);
        }
        self.initialized.store(false, Ordering::SeqCst);

        match self.transport.connect().await {
            Ok(()) => {
                self.shared.set_state(ConnectionState::Connected);
                *self.health.lock().await = None;
                tracing::info!(
                    server = %self.name(),
                    transport = %self.config.server_type,
                    "connected"
                );
                Ok(())
            }
            Err(e) => {
                self.shared.record_error(&e);
                self.shared.set_state(ConnectionState::Failed);
                tracing::warn!(server = %self.name(), error = %e, "connect failed");
                Err(e)
            }
        }
    }

    /// Disconnect and reject every in-flight request.
    pub async fn disconnect(&self) -> Result<(), McpError> {
        let _session = self.session_lock.lock().await;
        self.disconnect_locked().await
    }

    async fn disconnect_locked(&self) -> Result<(), McpError> {
        let result = self.transport.disconnect().await;
        self.initialized.store(false, Ordering::SeqCst);
        self.shared.set_state(ConnectionState::Disconnected);
        self.shared.fail_pending("client disconnected");
        *self.health.lock().await = None;
        if let Err(e) = &result {
            tracing::warn!(server = %self.name(), error = %e, "disconnect reported an error");
        }
        result
    }

    /// Run the `initialize` handshake once per connection.
    pub async fn initialize_server(&self) -> Result<ServerInfo, McpError> {
        let _session = self.session_lock.lock().await;
        self.initialize_locked().await
    }

    async fn initialize_locked(&self) -> Result<ServerInfo, McpError> {
        if self.is_initialized() {
            if let Some(info) = self.server_info() {
                return Ok(info);
            }
        }

        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": CLIENT_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let result = self.request(methods::INITIALIZE, Some(params)).await?;

        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| McpError::InitFailed {
                name: self.name().to_string(),
                reason: format!("failed to parse initialize response: {e}"),
            })?;
        let info = ServerInfo::from_initialize(self.name(), init);

        self.notify(methods::INITIALIZED, None).await?;

        match self.server_info.write() {
            Ok(mut guard) => *guard = Some(info.clone()),
            Err(poisoned) => *poisoned.into_inner() = Some(info.clone()),
        }
        self.initialized.store(true, Ordering::SeqCst);

        tracing::info!(
            server = %self.name(),
            server_name = %info.name,
            version = %info.version,
            protocol = %info.protocol_version,
            "server initialized"
        );
        Ok(info)
    }

    /// Connect and initialize if either has not happened yet.
    pub async fn ensure_ready(&self) -> Result<(), McpError> {
        if self.is_connected() && self.is_initialized() {
            return Ok(());
        }
        let _session = self.session_lock.lock().await;
        self.connect_locked().await?;
        self.initialize_locked().await.map(|_| ())
    }

    // ── Requests ────────────────────────────────────────────────────────────

    /// Send a request and wait for the correlated response.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        if !self.is_connected() {
            return Err(McpError::connection(
                self.name(),
                format!("not connected (state: {})", self.state()),
            ));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(id, tx);

        match self
            .transport
            .send(JsonRpcMessage::request(id, method, params))
            .await
        {
            Ok(Some(reply)) => self.shared.handle_message(reply),
            Ok(None) => {}
            Err(e) => {
                lock(&self.shared.pending).remove(&id);
                self.shared.record_error(&e);
                if matches!(e, McpError::Connection { .. }) {
                    self.shared.set_state(ConnectionState::Failed);
                }
                return Err(e);
            }
        }

        let timeout = self.config.settings.timeout_duration();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpError::connection(
                self.name(),
                format!("request '{method}' was cancelled"),
            )),
            Err(_) => {
                lock(&self.shared.pending).remove(&id);
                let err = McpError::Timeout {
                    server: self.name().to_string(),
                    operation: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                };
                self.shared.record_error(&err);
                Err(err)
            }
        }
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let reply = self
            .transport
            .send(JsonRpcMessage::notification(method, params))
            .await?;
        if let Some(reply) = reply {
            self.shared.handle_message(reply);
        }
        Ok(())
    }

    // ── Tools ───────────────────────────────────────────────────────────────

    /// List the server's tools, from cache when fresh.
    ///
    /// The cache is bypassed when `force_refresh` is set, when it is older
    /// than [`TOOL_CACHE_TTL`], or after the server announced a list change.
    pub async fn discover_tools(&self, force_refresh: bool) -> Result<Vec<Tool>, McpError> {
        if !force_refresh && !self.shared.tools_stale.load(Ordering::SeqCst) {
            let cached = match self.tool_cache.read() {
                Ok(guard) => guard
                    .as_ref()
                    .filter(|c| c.fetched_at.elapsed() < TOOL_CACHE_TTL)
                    .map(|c| c.tools.clone()),
                Err(_) => None,
            };
            if let Some(tools) = cached {
                tracing::debug!(server = %self.name(), count = tools.len(), "using cached tools");
                return Ok(tools);
            }
        }

        self.ensure_ready().await?;
        self.shared.tools_stale.store(false, Ordering::SeqCst);

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let result = self.request(methods::TOOLS_LIST, params).await?;
            let page: ListToolsResult = serde_json::from_value(result).map_err(|e| {
                McpError::connection(self.name(), format!("malformed tools/list response: {e}"))
            })?;

            tools.extend(
                page.tools
                    .into_iter()
                    .filter(|def| !is_internal_tool(&def.name))
                    .map(|def| Tool::from_definition(self.name(), def)),
            );

            match page.next_cursor {
                Some(next) if !next.is_empty() && cursor.as_deref() != Some(next.as_str()) => {
                    cursor = Some(next);
                }
                _ => break,
            }
        }

        let fresh = ToolCache {
            tools: tools.clone(),
            fetched_at: Instant::now(),
        };
        match self.tool_cache.write() {
            Ok(mut guard) => *guard = Some(fresh),
            Err(poisoned) => *poisoned.into_inner() = Some(fresh),
        }

        tracing::info!(server = %self.name(), count = tools.len(), "discovered tools");
        Ok(tools)
    }

    /// Drop the cached tool list so the next discovery hits the server.
    pub fn invalidate_tools(&self) {
        self.shared.tools_stale.store(true, Ordering::SeqCst);
    }

    /// Invoke a tool by its server-side name and unwrap the result.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        self.ensure_ready().await?;
        let params = json!({ "name": name, "arguments": arguments });
        let result = self.request(methods::TOOLS_CALL, Some(params)).await?;
        unwrap_call_result(name, result)
    }

    // ── Health ──────────────────────────────────────────────────────────────

    /// Cached liveness check.
    ///
    /// Not connected means unhealthy without probing. Otherwise the transport
    /// is probed at most once per `health_check_interval`.
    pub async fn is_healthy(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        let mut cache = self.health.lock().await;
        if let Some((checked_at, healthy)) = *cache {
            if checked_at.elapsed() < self.config.settings.health_check_duration() {
                return healthy;
            }
        }
        let healthy = self.transport.is_healthy().await;
        if !healthy {
            tracing::warn!(server = %self.name(), "health check failed");
        }
        *cache = Some((Instant::now(), healthy));
        healthy
    }

    // ── Reconnect ───────────────────────────────────────────────────────────

    /// Reconnect with exponential backoff.
    ///
    /// Attempt `k` (1-based) waits `retry_delay * 2^(k-1)` first, tears the
    /// old connection down, then connects and re-initializes. Returns whether
    /// a session was re-established; the caller decides what happens to the
    /// server's tools on failure.
    pub async fn reconnect(&self) -> bool {
        let _session = self.session_lock.lock().await;
        let attempts = self.config.settings.retry_attempts;
        let base = self.config.settings.retry_delay_duration();

        for attempt in 1..=attempts {
            self.shared.set_state(ConnectionState::Reconnecting);
            let delay = backoff_delay(base, attempt);
            tracing::info!(
                server = %self.name(),
                attempt,
                max_attempts = attempts,
                delay_ms = delay.as_millis() as u64,
                "reconnecting"
            );
            tokio::time::sleep(delay).await;

            let _ = self.disconnect_locked().await;
            self.shared.set_state(ConnectionState::Reconnecting);

            let outcome = match self.connect_locked().await {
                Ok(()) => self.initialize_locked().await.map(|_| ()),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => {
                    self.reconnect_count.fetch_add(1, Ordering::SeqCst);
                    self.shared.tools_stale.store(true, Ordering::SeqCst);
                    tracing::info!(server = %self.name(), attempt, "reconnected");
                    return true;
                }
                Err(e) => {
                    self.shared.record_error(&e);
                    tracing::warn!(server = %self.name(), attempt, error = %e, "reconnect attempt failed");
                }
            }
        }

        self.shared.set_state(ConnectionState::Failed);
        let exhausted = McpError::ReconnectExhausted {
            name: self.name().to_string(),
            attempts,
        };
        self.shared.record_error(&exhausted);
        tracing::error!(server = %self.name(), attempts, "giving up on server");
        false
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

//! In-process fake server for unit tests.
//!
//! Answers `initialize`, `tools/list` and `tools/call` from a configurable
//! tool list, either inline (like HTTP) or through the message handler
//! (like stdio/SSE). Failure switches and counters let tests drive the
//! client state machine without real processes or sockets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{HandlerSlot, Transport, TransportFactory, TransportHandlers};
use crate::config::{ServerConfig, ServerType};
use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::{error_codes, methods, JsonRpcMessage};

pub struct MockTransport {
    name: String,
    kind: ServerType,
    tools: Mutex<Vec<Value>>,
    handlers: HandlerSlot,
    connected: AtomicBool,
    /// Reply through the handler instead of returning inline.
    streaming: bool,
    pub fail_connect: AtomicBool,
    pub fail_sends: AtomicBool,
    /// Swallow requests without ever replying.
    pub silent: AtomicBool,
    pub healthy: AtomicBool,
    pub connects: AtomicUsize,
    pub probes: AtomicUsize,
    pub connect_times: Mutex<Vec<tokio::time::Instant>>,
    pub sent: Mutex<Vec<JsonRpcMessage>>,
}

impl MockTransport {
    pub fn new(name: &str, kind: ServerType) -> Self {
        Self {
            name: name.to_string(),
            kind,
            tools: Mutex::new(Vec::new()),
            handlers: HandlerSlot::default(),
            connected: AtomicBool::new(false),
            streaming: kind != ServerType::StreamableHttp,
            fail_connect: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            silent: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            connects: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
            connect_times: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Add a tool with a simple object schema.
    pub fn with_tool(self, name: &str, schema: Value) -> Self {
        self.tools.lock().unwrap().push(json!({
            "name": name,
            "description": format!("{name} tool"),
            "inputSchema": schema,
        }));
        self
    }

    pub fn set_tools(&self, tools: Vec<Value>) {
        *self.tools.lock().unwrap() = tools;
    }

    /// Push a server-initiated message through the registered handler.
    pub fn push(&self, message: JsonRpcMessage) {
        self.handlers.get().dispatch(message);
    }

    /// Simulate the connection dropping underneath the client.
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.handlers
            .get()
            .report(McpError::connection(&self.name, "mock connection dropped"));
    }

    pub fn sent_methods(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| m.method.clone())
            .collect()
    }

    fn answer(&self, request: &JsonRpcMessage) -> Option<JsonRpcMessage> {
        let id = request.id_as_u64()?;
        let method = request.method.as_deref().unwrap_or_default();
        let params = request.params.clone().unwrap_or(Value::Null);

        let reply = match method {
            methods::INITIALIZE => JsonRpcMessage::response(
                id,
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {"listChanged": true}},
                    "serverInfo": {"name": self.name, "version": "0.1.0"},
                }),
            ),
            methods::TOOLS_LIST => JsonRpcMessage::response(
                id,
                json!({"tools": self.tools.lock().unwrap().clone()}),
            ),
            methods::TOOLS_CALL => self.call(id, &params),
            other => JsonRpcMessage::error_response(
                id,
                error_codes::METHOD_NOT_FOUND,
                &format!("method not found: {other}"),
            ),
        };
        Some(reply)
    }

    fn call(&self, id: u64, params: &Value) -> JsonRpcMessage {
        let tool = params["name"].as_str().unwrap_or_default();
        let args = params.get("arguments").cloned().unwrap_or(json!({}));
        let text = match tool {
            "sse_hello_world" => json!({
                "message": format!(
                    "Hello {} from SSE MCP Server!",
                    args["name"].as_str().unwrap_or("World")
                ),
                "server_type": "sse",
            })
            .to_string(),
            "fail_tool" => {
                return JsonRpcMessage::response(
                    id,
                    json!({"content": [{"type": "text", "text": "boom"}], "isError": true}),
                )
            }
            "plain_text" => "just words".to_string(),
            "empty_result" => return JsonRpcMessage::response(id, json!({})),
            _ => json!({"server": self.name, "tool": tool, "arguments": args}).to_string(),
        };
        JsonRpcMessage::response(id, json!({"content": [{"type": "text", "text": text}]}))
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<(), McpError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.connect_times
            .lock()
            .unwrap()
            .push(tokio::time::Instant::now());
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(McpError::connection(&self.name, "connection refused"));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), McpError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<Option<JsonRpcMessage>, McpError> {
        if !self.connected.load(Ordering::SeqCst) || self.fail_sends.load(Ordering::SeqCst) {
            return Err(McpError::connection(&self.name, "send failed"));
        }
        self.sent.lock().unwrap().push(message.clone());
        if self.silent.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let reply = self.answer(&message);
        if self.streaming {
            if let Some(reply) = reply {
                self.handlers.get().dispatch(reply);
            }
            Ok(None)
        } else {
            Ok(reply)
        }
    }

    async fn is_healthy(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.connected.load(Ordering::SeqCst) && self.healthy.load(Ordering::SeqCst)
    }

    fn set_handlers(&self, handlers: TransportHandlers) {
        self.handlers.set(handlers);
    }

    fn kind(&self) -> ServerType {
        self.kind
    }
}

/// Hands out pre-registered mocks by server name; unknown names get an empty mock.
#[derive(Default)]
pub struct MockFactory {
    transports: Mutex<HashMap<String, Arc<MockTransport>>>,
}

impl MockFactory {
    pub fn with(self, transport: MockTransport) -> Self {
        self.transports
            .lock()
            .unwrap()
            .insert(transport.name.clone(), Arc::new(transport));
        self
    }

    pub fn get(&self, name: &str) -> Arc<MockTransport> {
        self.transports.lock().unwrap()[name].clone()
    }
}

impl TransportFactory for MockFactory {
    fn create(&self, config: &ServerConfig) -> Result<Arc<dyn Transport>, McpError> {
        let transport: Arc<MockTransport> = self
            .transports
            .lock()
            .unwrap()
            .entry(config.name.clone())
            .or_insert_with(|| Arc::new(MockTransport::new(&config.name, config.server_type)))
            .clone();
        let transport: Arc<dyn Transport> = transport;
        Ok(transport)
    }
}

/// Object schema with the given required string properties.
pub fn string_schema(required: &[&str]) -> Value {
    let properties: serde_json::Map<String, Value> = required
        .iter()
        .map(|name| (name.to_string(), json!({"type": "string"})))
        .collect();
    json!({"type": "object", "properties": properties, "required": required})
}

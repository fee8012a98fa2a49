//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 envelopes, MCP protocol payloads and the proxy's own
//! bookkeeping records (tools, conflicts, discovery results).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

// ─── Protocol Constants ──────────────────────────────────────────────────────

/// MCP protocol revision sent in the `initialize` handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Client name advertised to servers.
pub const CLIENT_NAME: &str = "mcp-proxy";

/// The four protocol methods the proxy speaks.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    /// Server → client notification that the tool list changed.
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
}

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// Which of the three JSON-RPC shapes a message has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// `method` + `id`.
    Request,
    /// `id` + (`result` | `error`).
    Response,
    /// `method` without `id`.
    Notification,
    /// None of the above.
    Invalid,
}

/// JSON-RPC 2.0 envelope. Exactly one of request, response or notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcMessage {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    /// `Some(Null)` when the server sent `"result": null`; `None` when absent.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

fn jsonrpc_version() -> String {
    "2.0".to_string()
}

fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

impl JsonRpcMessage {
    /// Create a new JSON-RPC request.
    pub fn request(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id: Some(serde_json::Value::from(id)),
            method: Some(method.to_string()),
            params,
            result: None,
            error: None,
        }
    }

    /// Create a notification (no id, no response expected).
    pub fn notification(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id: None,
            method: Some(method.to_string()),
            params,
            result: None,
            error: None,
        }
    }

    /// Create a success response.
    pub fn response(id: u64, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id: Some(serde_json::Value::from(id)),
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error_response(id: u64, code: i32, message: &str) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id: Some(serde_json::Value::from(id)),
            method: None,
            params: None,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.to_string(),
                data: None,
            }),
        }
    }

    /// Classify the message.
    pub fn kind(&self) -> MessageKind {
        match (&self.method, &self.id) {
            (Some(_), Some(_)) => MessageKind::Request,
            (Some(_), None) => MessageKind::Notification,
            (None, Some(_)) if self.result.is_some() || self.error.is_some() => {
                MessageKind::Response
            }
            _ => MessageKind::Invalid,
        }
    }

    /// Numeric request id, accepting servers that echo ids as strings.
    pub fn id_as_u64(&self) -> Option<u64> {
        match self.id.as_ref()? {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn is_request(&self) -> bool {
        self.kind() == MessageKind::Request
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC / MCP error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Connection State ────────────────────────────────────────────────────────

/// Per-server connection state machine.
///
/// ```text
/// Disconnected → Connecting → Connected
///                    └──────→ Failed
/// Connected → Reconnecting → Connected | Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// Tool entry as returned by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "inputSchema")]
    pub input_schema: Option<serde_json::Value>,
}

/// `tools/list` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<McpToolDefinition>,
    #[serde(default, alias = "nextCursor")]
    pub next_cursor: Option<String>,
}

/// `initialize` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<Implementation>,
}

/// Name/version pair advertised by either side of the handshake.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Implementation {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// What a server told us about itself during the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub protocol_version: String,
    pub capabilities: serde_json::Value,
}

impl ServerInfo {
    /// Build from an `initialize` result, falling back to the configured name.
    pub fn from_initialize(server_name: &str, init: InitializeResult) -> Self {
        let implementation = init.server_info.unwrap_or_default();
        Self {
            name: implementation
                .name
                .unwrap_or_else(|| server_name.to_string()),
            version: implementation.version.unwrap_or_else(|| "unknown".into()),
            protocol_version: init
                .protocol_version
                .unwrap_or_else(|| PROTOCOL_VERSION.to_string()),
            capabilities: init.capabilities,
        }
    }
}

// ─── Proxy Records ───────────────────────────────────────────────────────────

/// A tool discovered on a server.
///
/// `name` is the registry key; it starts out equal to `original_name` and is
/// rewritten only by the registry while deconflicting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub server_name: String,
    pub original_name: String,
}

impl Tool {
    /// Convert a wire definition into a tool owned by `server_name`.
    pub fn from_definition(server_name: &str, def: McpToolDefinition) -> Self {
        let input_schema = match def.input_schema {
            Some(schema) if schema.is_object() => schema,
            _ => serde_json::json!({"type": "object", "properties": {}}),
        };
        Self {
            name: def.name.clone(),
            description: def.description.unwrap_or_default(),
            input_schema,
            server_name: server_name.to_string(),
            original_name: def.name,
        }
    }

    /// Names of required top-level parameters.
    pub fn required_params(&self) -> Vec<&str> {
        self.input_schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default()
    }
}

/// How a name collision between servers was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Each server's tool prefix already made the names distinct.
    Prefixed,
    /// At least one tool fell back to `server_original`.
    Renamed,
}

/// Two or more servers expose a tool with the same original name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolConflict {
    pub tool_name: String,
    /// Servers in registration order.
    pub servers: Vec<String>,
    /// Final registry names, parallel to `servers`.
    pub final_names: Vec<String>,
    pub resolution: ConflictResolution,
}

/// Outcome of one discovery attempt against one server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResult {
    pub server_name: String,
    pub success: bool,
    pub tools_discovered: usize,
    pub error_message: Option<String>,
    /// Wall time of the attempt in milliseconds.
    pub discovery_time_ms: u64,
    pub completed_at: DateTime<Utc>,
    pub server_info: Option<ServerInfo>,
}

impl DiscoveryResult {
    pub fn succeeded(
        server_name: &str,
        tools_discovered: usize,
        discovery_time_ms: u64,
        server_info: Option<ServerInfo>,
    ) -> Self {
        Self {
            server_name: server_name.to_string(),
            success: true,
            tools_discovered,
            error_message: None,
            discovery_time_ms,
            completed_at: Utc::now(),
            server_info,
        }
    }

    pub fn failed(server_name: &str, error: &str, discovery_time_ms: u64) -> Self {
        Self {
            server_name: server_name.to_string(),
            success: false,
            tools_discovered: 0,
            error_message: Some(error.to_string()),
            discovery_time_ms,
            completed_at: Utc::now(),
            server_info: None,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

//! MCP proxy error types.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors that can occur while talking to servers or serving proxied calls.
#[derive(Debug, Error)]
pub enum McpError {
    /// Configuration was invalid (fatal at load time).
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The initialization handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed { name: String, reason: String },

    /// Transport-level failure: connect, send, or the connection dropped.
    #[error("connection error for server '{server}': {reason}")]
    Connection { server: String, reason: String },

    /// A request exceeded the per-server timeout.
    #[error("request '{operation}' to server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        operation: String,
        timeout_ms: u64,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The tool ran but reported failure (`isError: true`).
    #[error("tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    /// Tool not found in the registry. `hint` lists close matches or the name's current owner.
    #[error("unknown tool: '{name}'{hint}")]
    UnknownTool { name: String, hint: String },

    /// Server name not configured.
    #[error("unknown server: '{name}'")]
    UnknownServer { name: String },

    /// Tool call arguments failed schema validation.
    #[error("invalid arguments for '{tool}': {reason}")]
    Validation { tool: String, reason: String },

    /// The tool result had an unusable shape.
    #[error("could not process result of '{tool}': {reason}")]
    Processing { tool: String, reason: String },

    /// An engine operation was invoked before `start()` (or after `stop()`).
    #[error("engine is not running: cannot {operation}")]
    NotRunning { operation: String },

    /// A lifecycle method was called in the wrong engine state.
    #[error("invalid engine state: {reason}")]
    InvalidState { reason: String },

    /// All reconnect attempts exhausted for a server.
    #[error("server '{name}' failed after {attempts} reconnect attempts")]
    ReconnectExhausted { name: String, attempts: u32 },

    /// The host tool registry rejected a registration.
    #[error("host registry rejected tool '{tool}': {reason}")]
    HostRegistration { tool: String, reason: String },
}

impl McpError {
    /// Stable category label, used by the timeline and in stats.
    pub fn kind(&self) -> &'static str {
        match self {
            McpError::Config(_) => "config",
            McpError::SpawnFailed { .. }
            | McpError::InitFailed { .. }
            | McpError::Connection { .. }
            | McpError::ReconnectExhausted { .. } => "connection",
            McpError::Timeout { .. } => "timeout",
            McpError::ServerError { .. } | McpError::ToolExecution { .. } => "server",
            McpError::Validation { .. } => "validation",
            McpError::Processing { .. } => "processing",
            McpError::UnknownTool { .. }
            | McpError::UnknownServer { .. }
            | McpError::NotRunning { .. }
            | McpError::InvalidState { .. }
            | McpError::HostRegistration { .. } => "misuse",
        }
    }

    /// Whether a reconnect-and-retry may help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, McpError::Connection { .. } | McpError::Timeout { .. })
    }

    /// Unknown-tool error carrying "did you mean" suggestions.
    pub fn unknown_tool(name: &str, suggestions: &[String]) -> Self {
        let hint = if suggestions.is_empty() {
            String::new()
        } else {
            format!(" (did you mean: {}?)", suggestions.join(", "))
        };
        McpError::UnknownTool {
            name: name.to_string(),
            hint,
        }
    }

    pub(crate) fn connection(server: &str, reason: impl Into<String>) -> Self {
        McpError::Connection {
            server: server.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels() {
        assert_eq!(McpError::connection("s", "down").kind(), "connection");
        assert_eq!(
            McpError::Validation {
                tool: "t".into(),
                reason: "r".into()
            }
            .kind(),
            "validation"
        );
        assert_eq!(
            McpError::NotRunning {
                operation: "call_tool".into()
            }
            .kind(),
            "misuse"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(McpError::connection("s", "down").is_retryable());
        assert!(McpError::Timeout {
            server: "s".into(),
            operation: "tools/call".into(),
            timeout_ms: 10
        }
        .is_retryable());
        assert!(!McpError::unknown_tool("x", &[]).is_retryable());
    }

    #[test]
    fn test_unknown_tool_hint() {
        assert_eq!(
            McpError::unknown_tool("gret", &[]).to_string(),
            "unknown tool: 'gret'"
        );
        assert_eq!(
            McpError::unknown_tool("gret", &["greet".into(), "get".into()]).to_string(),
            "unknown tool: 'gret' (did you mean: greet, get?)"
        );
    }

    #[test]
    fn test_config_error_transparent() {
        let err: McpError = ConfigError::Parse {
            reason: "bad".into(),
        }
        .into();
        assert_eq!(err.to_string(), "failed to parse config: bad");
    }
}

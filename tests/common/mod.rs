//! In-process MCP servers for integration tests.

#![allow(dead_code)]

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use mcp_proxy::config::{ServerConfig, ServerType};

pub const SESSION_ID: &str = "test-session-1";

/// Shell MCP server speaking newline-delimited JSON-RPC on stdio.
pub const STDIO_SERVER_SCRIPT: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"stdio-server","version":"1.0.0"}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"common_tool","description":"Shared tool","inputSchema":{"type":"object","properties":{}}},{"name":"shout","description":"Shout text","inputSchema":{"type":"object","properties":{"text":{"type":"string"}},"required":["text"]}}]}}\n' "$id" ;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"stdio says hi"}]}}\n' "$id" ;;
  esac
done
"#;

pub struct McpApp {
    pub name: String,
    pub tools: Vec<Value>,
    /// Requests that carried the session id handed out on `initialize`.
    pub session_requests: AtomicUsize,
    pub calls: AtomicUsize,
    events: broadcast::Sender<String>,
}

impl McpApp {
    fn new(name: &str, tools: Vec<Value>) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            name: name.to_string(),
            tools,
            session_requests: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            events,
        })
    }

    /// Reply to one JSON-RPC message; `None` for notifications.
    fn reply(&self, request: &Value) -> Option<Value> {
        let id = request.get("id").cloned().filter(|id| !id.is_null())?;
        let method = request["method"].as_str().unwrap_or_default();
        let body = match method {
            "initialize" => json!({
                "result": {
                    "protocolVersion": "2024-11-05",
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": self.name, "version": "1.0.0" }
                }
            }),
            "tools/list" => json!({ "result": { "tools": self.tools } }),
            "tools/call" => {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let tool = request["params"]["name"].as_str().unwrap_or_default();
                let args = &request["params"]["arguments"];
                match tool {
                    "sse_hello_world" => {
                        let name = args["name"].as_str().unwrap_or("World");
                        let payload = json!({
                            "message": format!("Hello {name} from SSE MCP Server!"),
                            "server_type": "sse",
                        });
                        json!({ "result": { "content": [{ "type": "text", "text": payload.to_string() }] } })
                    }
                    "explode" => json!({ "error": { "code": -32000, "message": "tool blew up" } }),
                    _ => {
                        let payload = json!({ "server": self.name, "tool": tool, "arguments": args });
                        json!({ "result": { "content": [{ "type": "text", "text": payload.to_string() }] } })
                    }
                }
            }
            other => json!({ "error": { "code": -32601, "message": format!("method not found: {other}") } }),
        };
        let mut reply = body;
        reply["jsonrpc"] = json!("2.0");
        reply["id"] = id;
        Some(reply)
    }
}

pub fn tool(name: &str, required: &[&str]) -> Value {
    let properties: serde_json::Map<String, Value> = required
        .iter()
        .map(|p| (p.to_string(), json!({ "type": "string" })))
        .collect();
    json!({
        "name": name,
        "description": format!("{name} tool"),
        "inputSchema": { "type": "object", "properties": properties, "required": required }
    })
}

async fn probe() -> StatusCode {
    StatusCode::OK
}

async fn http_rpc(
    State(app): State<Arc<McpApp>>,
    headers: HeaderMap,
    Json(request): Json<Value>,
) -> Response {
    if headers
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        == Some(SESSION_ID)
    {
        app.session_requests.fetch_add(1, Ordering::SeqCst);
    }
    match app.reply(&request) {
        Some(reply) => ([("mcp-session-id", SESSION_ID)], Json(reply)).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

async fn sse_stream(
    State(app): State<Arc<McpApp>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = app.events.subscribe();
    let endpoint =
        futures::stream::once(async { Ok::<_, Infallible>(Event::default().event("endpoint").data("/messages")) });
    let messages = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(data) => {
                    let event = Event::default().event("message").data(data);
                    return Some((Ok::<_, Infallible>(event), rx));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(endpoint.chain(messages)).keep_alive(KeepAlive::default())
}

async fn sse_post(State(app): State<Arc<McpApp>>, Json(request): Json<Value>) -> StatusCode {
    if let Some(reply) = app.reply(&request) {
        let _ = app.events.send(reply.to_string());
    }
    StatusCode::ACCEPTED
}

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// Streamable-HTTP MCP server at `<base>/mcp`.
pub async fn spawn_http_server(name: &str, tools: Vec<Value>) -> (String, Arc<McpApp>) {
    let app = McpApp::new(name, tools);
    let router = Router::new()
        .route("/mcp", get(probe).post(http_rpc))
        .with_state(app.clone());
    let base = serve(router).await;
    (format!("{base}/mcp"), app)
}

/// SSE MCP server: events on `<base>/sse`, requests to `<base>/messages`.
pub async fn spawn_sse_server(name: &str, tools: Vec<Value>) -> (String, Arc<McpApp>) {
    let app = McpApp::new(name, tools);
    let router = Router::new()
        .route("/sse", get(sse_stream))
        .route("/messages", post(sse_post))
        .with_state(app.clone());
    let base = serve(router).await;
    (format!("{base}/sse"), app)
}

/// A URL nothing is listening on.
pub async fn dead_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}/mcp")
}

pub fn network_server(name: &str, kind: ServerType, url: &str) -> ServerConfig {
    let mut config = ServerConfig::network(name, kind, url).with_prefix(&format!("{name}."));
    config.settings.timeout = 5;
    config.settings.retry_attempts = 0;
    config
}

pub fn stdio_server(name: &str) -> ServerConfig {
    let mut config = ServerConfig::stdio(name, "/bin/sh", &["-c", STDIO_SERVER_SCRIPT])
        .with_prefix(&format!("{name}."));
    config.settings.timeout = 5;
    config.settings.retry_attempts = 0;
    config
}

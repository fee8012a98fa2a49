//! HTTP Server-Sent-Events transport.
//!
//! The classic MCP SSE session:
//! - `GET <url>` with `Accept: text/event-stream` opens one long-lived stream
//! - the first `endpoint` event announces where to POST client messages
//! - every `message` event carries one JSON-RPC message from the server
//!
//! The stream multiplexes all responses and notifications for the server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use super::{HandlerSlot, Transport, TransportHandlers};
use crate::config::{ServerConfig, ServerType};
use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::JsonRpcMessage;

// ─── SSE Event Parser ────────────────────────────────────────────────────────

/// One parsed `text/event-stream` event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub id: Option<String>,
    /// The `event:` field; `None` means the default type, `message`.
    pub event: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: String,
}

impl SseEvent {
    pub fn event_type(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

/// Parse one event block (the text between blank lines).
fn parse_event_block(block: &str) -> Option<SseEvent> {
    let mut event = SseEvent::default();
    let mut has_data = false;

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.find(':') {
            Some(pos) => {
                let value = &line[pos + 1..];
                (&line[..pos], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };
        match field {
            "id" => event.id = Some(value.to_string()),
            "event" => event.event = Some(value.to_string()),
            "data" => {
                if has_data {
                    event.data.push('\n');
                }
                event.data.push_str(value);
                has_data = true;
            }
            // `retry` and unknown fields are ignored
            _ => {}
        }
    }

    has_data.then_some(event)
}

/// Parse a complete SSE body into events.
pub fn parse_sse_events(body: &str) -> Vec<SseEvent> {
    let mut decoder = SseDecoder::default();
    let mut events = decoder.push(body);
    events.extend(decoder.finish());
    events
}

/// Incremental decoder for a chunked event stream.
///
/// Buffers raw bytes and only decodes complete event blocks, so a UTF-8
/// sequence split across network chunks survives intact.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Feed a chunk; returns every event completed by it.
    pub fn push(&mut self, chunk: impl AsRef<[u8]>) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk.as_ref());
        normalize_crlf(&mut self.buffer);
        let mut events = Vec::new();
        while let Some(end) = find_block_end(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(event) = parse_event_block(&String::from_utf8_lossy(&block)) {
                events.push(event);
            }
        }
        events
    }

    /// Flush whatever remains once the stream has ended.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_event_block(String::from_utf8_lossy(&rest).trim())
    }
}

/// Collapse `\r\n` into `\n` in place. A trailing lone `\r` is kept until
/// the next chunk shows whether a `\n` follows.
fn normalize_crlf(buffer: &mut Vec<u8>) {
    if !buffer.windows(2).any(|w| w == b"\r\n") {
        return;
    }
    let mut out = Vec::with_capacity(buffer.len());
    let mut i = 0;
    while i < buffer.len() {
        if buffer[i] == b'\r' && buffer.get(i + 1) == Some(&b'\n') {
            i += 1;
            continue;
        }
        out.push(buffer[i]);
        i += 1;
    }
    *buffer = out;
}

fn find_block_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// An open event stream and the endpoint it announced.
struct SseSession {
    post_url: reqwest::Url,
    reader: JoinHandle<()>,
    connected: Arc<AtomicBool>,
}

/// Persistent SSE session transport.
pub struct SseTransport {
    config: ServerConfig,
    url: reqwest::Url,
    client: reqwest::Client,
    handlers: Arc<HandlerSlot>,
    session: Mutex<Option<SseSession>>,
    closing: Arc<AtomicBool>,
}

impl SseTransport {
    pub fn new(config: &ServerConfig) -> Result<Self, McpError> {
        Ok(Self {
            url: super::parse_server_url(config)?,
            client: super::build_http_client(config)?,
            config: config.clone(),
            handlers: Arc::new(HandlerSlot::default()),
            session: Mutex::new(None),
            closing: Arc::new(AtomicBool::new(false)),
        })
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    /// Read the stream until it ends, routing `endpoint` and `message` events.
    fn spawn_reader(
        &self,
        response: reqwest::Response,
        endpoint_tx: oneshot::Sender<String>,
        connected: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let server = self.config.name.clone();
        let handlers = self.handlers.clone();
        let closing = self.closing.clone();

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut decoder = SseDecoder::default();
            let mut endpoint_tx = Some(endpoint_tx);

            let reason = loop {
                let events = match stream.next().await {
                    Some(Ok(bytes)) => decoder.push(&bytes),
                    Some(Err(e)) => break format!("event stream error: {e}"),
                    None => {
                        // Stream ended; flush any trailing event before stopping.
                        let tail = decoder.finish().into_iter().collect::<Vec<_>>();
                        route_events(&server, tail, &mut endpoint_tx, &handlers);
                        break "event stream closed by server".to_string();
                    }
                };
                route_events(&server, events, &mut endpoint_tx, &handlers);
            };

            connected.store(false, Ordering::SeqCst);
            if !closing.load(Ordering::SeqCst) {
                tracing::warn!(server = %server, reason = %reason, "SSE reader stopped");
                handlers.get().report(McpError::connection(&server, reason));
            }
        })
    }
}

fn route_events(
    server: &str,
    events: Vec<SseEvent>,
    endpoint_tx: &mut Option<oneshot::Sender<String>>,
    handlers: &HandlerSlot,
) {
    for event in events {
        match event.event_type() {
            "endpoint" => match endpoint_tx.take() {
                Some(tx) => {
                    let _ = tx.send(event.data.trim().to_string());
                }
                None => tracing::debug!(server = %server, "ignoring repeated endpoint event"),
            },
            "message" => {
                if event.data.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<JsonRpcMessage>(&event.data) {
                    Ok(message) => handlers.get().dispatch(message),
                    Err(e) => tracing::warn!(
                        server = %server,
                        error = %e,
                        "failed to parse SSE event data as JSON-RPC message"
                    ),
                }
            }
            other => tracing::debug!(server = %server, event = %other, "ignoring SSE event"),
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn connect(&self) -> Result<(), McpError> {
        let mut guard = self.session.lock().await;
        if guard
            .as_ref()
            .is_some_and(|s| s.connected.load(Ordering::SeqCst))
        {
            return Ok(());
        }
        if let Some(stale) = guard.take() {
            stale.reader.abort();
        }
        self.closing.store(false, Ordering::SeqCst);

        let response = self
            .client
            .get(self.url.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| McpError::connection(self.name(), format!("failed to open event stream: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(McpError::connection(
                self.name(),
                format!("event stream rejected with HTTP {status}"),
            ));
        }

        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let connected = Arc::new(AtomicBool::new(true));
        let reader = self.spawn_reader(response, endpoint_tx, connected.clone());

        let timeout = self.config.settings.timeout_duration();
        let endpoint = match tokio::time::timeout(timeout, endpoint_rx).await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(_)) => {
                reader.abort();
                return Err(McpError::connection(
                    self.name(),
                    "event stream ended before announcing an endpoint",
                ));
            }
            Err(_) => {
                reader.abort();
                return Err(McpError::Timeout {
                    server: self.name().to_string(),
                    operation: "sse endpoint".into(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };

        let post_url = self.url.join(&endpoint).map_err(|e| {
            reader.abort();
            McpError::connection(self.name(), format!("invalid endpoint '{endpoint}': {e}"))
        })?;

        tracing::info!(server = %self.name(), endpoint = %post_url, "SSE session established");
        *guard = Some(SseSession {
            post_url,
            reader,
            connected,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), McpError> {
        if let Some(session) = self.session.lock().await.take() {
            self.closing.store(true, Ordering::SeqCst);
            session.connected.store(false, Ordering::SeqCst);
            session.reader.abort();
            tracing::debug!(server = %self.name(), "SSE session closed");
        }
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<Option<JsonRpcMessage>, McpError> {
        let post_url = {
            let guard = self.session.lock().await;
            match guard.as_ref() {
                Some(session) if session.connected.load(Ordering::SeqCst) => {
                    session.post_url.clone()
                }
                _ => return Err(McpError::connection(self.name(), "SSE session is not connected")),
            }
        };

        let response = self
            .client
            .post(post_url)
            .json(&message)
            .send()
            .await
            .map_err(|e| {
                let err = McpError::connection(self.name(), format!("POST failed: {e}"));
                self.handlers
                    .get()
                    .report(McpError::connection(self.name(), e.to_string()));
                err
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(McpError::connection(
                self.name(),
                format!("server rejected message with HTTP {status}"),
            ));
        }
        // The reply arrives on the event stream.
        Ok(None)
    }

    async fn is_healthy(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| s.connected.load(Ordering::SeqCst))
    }

    fn set_handlers(&self, handlers: TransportHandlers) {
        self.handlers.set(handlers);
    }

    fn kind(&self) -> ServerType {
        ServerType::Sse
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_event() {
        let events = parse_sse_events("event: endpoint\ndata: /messages?session=abc\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), "endpoint");
        assert_eq!(events[0].data, "/messages?session=abc");
    }

    #[test]
    fn test_default_event_type_is_message() {
        let events = parse_sse_events("data: {\"jsonrpc\":\"2.0\"}\n\n");
        assert_eq!(events[0].event_type(), "message");
    }

    #[test]
    fn test_multiline_data_and_comments() {
        let events = parse_sse_events(": keepalive\nid: 9\ndata: line1\ndata: line2\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id.as_deref(), Some("9"));
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn test_comment_only_block_yields_nothing() {
        assert!(parse_sse_events(": ping\n\n").is_empty());
    }

    #[test]
    fn test_decoder_handles_split_chunks_and_crlf() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push("event: mess").is_empty());
        assert!(decoder.push("age\r\ndata: {\"a\":").is_empty());
        let events = decoder.push("1}\r\n\r\ndata: next");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"a\":1}");
        let last = decoder.finish().unwrap();
        assert_eq!(last.data, "next");
    }

    #[test]
    fn test_decoder_keeps_utf8_split_across_chunks() {
        let body = "event: message\ndata: {\"name\":\"José\"}\n\n".as_bytes();
        let split = body.iter().position(|&b| b == 0xC3).unwrap() + 1;

        let mut decoder = SseDecoder::default();
        assert!(decoder.push(&body[..split]).is_empty());
        let events = decoder.push(&body[split..]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"name\":\"José\"}");
    }

    #[test]
    fn test_decoder_crlf_split_between_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push("data: one\r").is_empty());
        assert!(decoder.push("\n\r").is_empty());
        let events = decoder.push("\ndata: two\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "one");
        assert_eq!(events[1].data, "two");
    }

    #[test]
    fn test_route_events_sends_endpoint_once() {
        let (tx, mut rx) = oneshot::channel();
        let mut slot = Some(tx);
        let handlers = HandlerSlot::default();
        let events = parse_sse_events(
            "event: endpoint\ndata: /a\n\nevent: endpoint\ndata: /b\n\n",
        );
        route_events("srv", events, &mut slot, &handlers);
        assert!(slot.is_none());
        assert_eq!(rx.try_recv().unwrap(), "/a");
    }

    #[tokio::test]
    async fn test_send_without_session_fails() {
        let cfg = ServerConfig::network("s", ServerType::Sse, "http://127.0.0.1:9/sse");
        let transport = SseTransport::new(&cfg).unwrap();
        assert!(!transport.is_healthy().await);
        let err = transport
            .send(JsonRpcMessage::notification("x", None))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Connection { .. }));
    }
}

//! End-to-end: the engine against real HTTP, SSE and stdio MCP servers.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::json;

use common::{dead_url, network_server, spawn_http_server, spawn_sse_server, tool};
use mcp_proxy::config::{ProxyConfig, ServerType};
use mcp_proxy::mcp_client::{ConflictResolution, DefaultTransportFactory};
use mcp_proxy::timeline::{CallStatus, MemorySink, TimelineEvent, TimelineLogger};
use mcp_proxy::{EngineState, InMemoryHostRegistry, McpError, ProxyEngine};

fn engine(config: ProxyConfig, timeline: Arc<TimelineLogger>) -> Arc<ProxyEngine> {
    Arc::new(ProxyEngine::with_parts(
        config,
        Arc::new(DefaultTransportFactory),
        timeline,
    ))
}

#[tokio::test]
async fn test_sse_hello_world() {
    let (url, app) = spawn_sse_server(
        "sse-server",
        vec![tool("sse_hello_world", &["name"]), tool("common_tool", &[])],
    )
    .await;
    let config = ProxyConfig::from_servers(vec![network_server("sse-server", ServerType::Sse, &url)]);
    let engine = engine(config, Arc::new(TimelineLogger::disabled()));
    engine.start().await.unwrap();

    let out = engine
        .call_tool("sse-server.sse_hello_world", json!({"name": "E2E Test"}))
        .await
        .unwrap();
    assert_eq!(out["message"], "Hello E2E Test from SSE MCP Server!");
    assert_eq!(out["server_type"], "sse");
    assert_eq!(app.calls.load(Ordering::SeqCst), 1);

    let details = engine.get_server_info("sse-server").await.unwrap();
    assert_eq!(details.tools.len(), 2);
    assert_eq!(
        details.server_info.map(|info| info.name),
        Some("sse-server".to_string())
    );

    engine.stop().await.unwrap();
    assert_eq!(engine.state(), EngineState::Stopped);
}

#[tokio::test]
async fn test_http_session_id_is_echoed() {
    let (url, app) = spawn_http_server("http-server", vec![tool("lookup", &["key"])]).await;
    let config = ProxyConfig::from_servers(vec![network_server(
        "http-server",
        ServerType::StreamableHttp,
        &url,
    )]);
    let engine = engine(config, Arc::new(TimelineLogger::disabled()));
    engine.start().await.unwrap();

    let out = engine
        .call_tool("http-server.lookup", json!({"key": "abc"}))
        .await
        .unwrap();
    assert_eq!(out["server"], "http-server");
    assert_eq!(out["tool"], "lookup");
    assert_eq!(out["arguments"]["key"], "abc");

    // Everything after `initialize` carries the session header.
    assert!(app.session_requests.load(Ordering::SeqCst) >= 2);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_validation_stops_bad_calls_before_the_server() {
    let (url, app) = spawn_http_server("http-server", vec![tool("lookup", &["key"])]).await;
    let config = ProxyConfig::from_servers(vec![network_server(
        "http-server",
        ServerType::StreamableHttp,
        &url,
    )]);
    let engine = engine(config, Arc::new(TimelineLogger::disabled()));
    engine.start().await.unwrap();

    let err = engine
        .call_tool("http-server.lookup", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::Validation { .. }));
    assert_eq!(app.calls.load(Ordering::SeqCst), 0);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_server_error_surfaces() {
    let (url, _app) = spawn_http_server("http-server", vec![tool("explode", &[])]).await;
    let config = ProxyConfig::from_servers(vec![network_server(
        "http-server",
        ServerType::StreamableHttp,
        &url,
    )]);
    let engine = engine(config, Arc::new(TimelineLogger::disabled()));
    engine.start().await.unwrap();

    let err = engine
        .call_tool("http-server.explode", json!({}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("tool blew up"), "{err}");
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_conflicts_across_transports() {
    let (sse_url, _) = spawn_sse_server(
        "sse-server",
        vec![tool("sse_hello_world", &["name"]), tool("common_tool", &[])],
    )
    .await;
    let (http_url, _) = spawn_http_server("http-server", vec![tool("common_tool", &[])]).await;
    let config = ProxyConfig::from_servers(vec![
        network_server("sse-server", ServerType::Sse, &sse_url),
        network_server("http-server", ServerType::StreamableHttp, &http_url),
    ]);
    let engine = engine(config, Arc::new(TimelineLogger::disabled()));
    engine.start().await.unwrap();

    let names: Vec<String> = engine
        .list_tools()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert!(names.contains(&"sse-server.common_tool".to_string()));
    assert!(names.contains(&"http-server.common_tool".to_string()));
    assert!(names.contains(&"sse-server.sse_hello_world".to_string()));

    let conflicts = engine.conflicts().await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].tool_name, "common_tool");
    assert_eq!(conflicts[0].resolution, ConflictResolution::Prefixed);

    let out = engine
        .call_tool("http-server.common_tool", json!({}))
        .await
        .unwrap();
    assert_eq!(out["server"], "http-server");
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_server_does_not_block_others() {
    let (http_url, _) = spawn_http_server("http-server", vec![tool("lookup", &["key"])]).await;
    let config = ProxyConfig::from_servers(vec![
        network_server("http-server", ServerType::StreamableHttp, &http_url),
        network_server("down-server", ServerType::StreamableHttp, &dead_url().await),
    ]);
    let engine = engine(config, Arc::new(TimelineLogger::disabled()));
    engine.start().await.unwrap();

    let results = engine.discovery_results().await.unwrap();
    assert_eq!(results.len(), 2);
    let down = results.iter().find(|r| r.server_name == "down-server").unwrap();
    assert!(!down.success);
    assert!(down.error_message.is_some());
    let up = results.iter().find(|r| r.server_name == "http-server").unwrap();
    assert!(up.success);
    assert_eq!(up.tools_discovered, 1);

    let stats = engine.get_stats().await.unwrap();
    assert_eq!(stats.servers_configured, 2);
    assert_eq!(stats.servers_connected, 1);
    assert_eq!(stats.tools_discovered, 1);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_host_registration_and_timeline() {
    let (url, _) = spawn_http_server("http-server", vec![tool("lookup", &["key"])]).await;
    let config = ProxyConfig::from_servers(vec![network_server(
        "http-server",
        ServerType::StreamableHttp,
        &url,
    )]);
    let sink = MemorySink::new();
    let timeline = Arc::new(TimelineLogger::new(vec![Box::new(sink.clone())]));
    let engine = engine(config, timeline.clone());
    engine.start().await.unwrap();

    let host = Arc::new(InMemoryHostRegistry::new());
    assert_eq!(engine.register_proxy_tools(host.clone()).await.unwrap(), 1);
    assert_eq!(host.names(), vec!["http-server.lookup"]);

    let out = host
        .call("http-server.lookup", json!({"key": "k1"}))
        .await
        .unwrap();
    assert_eq!(out["arguments"]["key"], "k1");

    engine.stop().await.unwrap();
    assert!(host.is_empty());

    timeline.flush().await;
    let events = sink.events();
    assert!(events.iter().any(|e| matches!(
        e,
        TimelineEvent::CallStarted(call) if call.tool_name == "http-server.lookup"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        TimelineEvent::CallFinished(call) if call.status == CallStatus::Succeeded
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, TimelineEvent::Discovery(d) if d.success)));
}

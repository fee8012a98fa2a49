//! Proxy engine: Top-level orchestration.
//!
//! Lifecycle: `Uninitialized → Initialized → Running → Stopped`.
//!
//! `initialize` validates the config and builds the discovery service and
//! proxy generator. `start` runs the first discovery, generates proxies,
//! and schedules periodic health sweeps and re-discovery. Both loops resync
//! proxies and host registrations after each pass. `stop` cancels the loops, withdraws host registrations, disconnects every server
//! and clears generated proxies. Everything else requires `Running`.

pub mod host;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{loader::validate_config, ProxyConfig};
use crate::mcp_client::client::ClientStatus;
use crate::mcp_client::discovery::{ConfigChanges, DiscoveryService};
use crate::mcp_client::errors::McpError;
use crate::mcp_client::transport::{DefaultTransportFactory, TransportFactory};
use crate::mcp_client::types::{DiscoveryResult, ServerInfo, Tool, ToolConflict};
use crate::proxy::{GenerationDiff, ProxyFunction, ProxyFunctionMetadata, ProxyGenerator};
use crate::timeline::{TimelineError, TimelineLogger};

pub use host::{HostTool, HostToolRegistry, InMemoryHostRegistry};

// ─── Types ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Uninitialized,
    Initialized,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub state: EngineState,
    pub servers_configured: usize,
    pub servers_connected: usize,
    pub tools_discovered: usize,
    pub proxy_functions: usize,
    pub tools_registered: usize,
    pub conflicts: usize,
    pub uptime_secs: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_discovery: Option<DateTime<Utc>>,
    pub timeline_dropped_events: u64,
}

/// Everything known about one tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub tool: Tool,
    pub proxy: Option<ProxyFunctionMetadata>,
    pub signature: Option<String>,
    pub documentation: Option<String>,
    pub registered: bool,
}

/// Everything known about one server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerDetails {
    pub status: ClientStatus,
    pub server_info: Option<ServerInfo>,
    pub tools: Vec<String>,
    pub last_discovery: Option<DiscoveryResult>,
}

/// Outcome of a global refresh.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub results: Vec<DiscoveryResult>,
    pub changes: GenerationDiff,
}

struct Services {
    discovery: Arc<DiscoveryService>,
    generator: Arc<Mutex<ProxyGenerator>>,
}

#[derive(Debug, Clone, Copy)]
enum LoopKind {
    Discovery,
    Health,
}

struct BackgroundLoop {
    kind: LoopKind,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

// ─── ProxyEngine ─────────────────────────────────────────────────────────────

pub struct ProxyEngine {
    config: RwLock<ProxyConfig>,
    state: RwLock<EngineState>,
    factory: Arc<dyn TransportFactory>,
    timeline: Arc<TimelineLogger>,
    services: RwLock<Option<Services>>,
    host: Mutex<Option<Arc<dyn HostToolRegistry>>>,
    /// Names currently registered with the host.
    registered: Mutex<BTreeSet<String>>,
    loops: Mutex<Vec<BackgroundLoop>>,
    started: RwLock<Option<(Instant, DateTime<Utc>)>>,
    /// Serializes start/stop/refresh/reload.
    lifecycle: Mutex<()>,
}

impl ProxyEngine {
    /// Engine with real transports and a timeline per `enable_timeline_logging`.
    pub fn new(config: ProxyConfig) -> Self {
        let timeline = if config.global_settings.enable_timeline_logging {
            TimelineLogger::from_settings(true, None).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "timeline unavailable");
                TimelineLogger::disabled()
            })
        } else {
            TimelineLogger::disabled()
        };
        Self::with_parts(config, Arc::new(DefaultTransportFactory), Arc::new(timeline))
    }

    /// Engine with a timeline database at `path` (when timeline logging is enabled).
    pub fn with_timeline_db(config: ProxyConfig, path: &Path) -> Result<Self, TimelineError> {
        let timeline =
            TimelineLogger::from_settings(config.global_settings.enable_timeline_logging, Some(path))?;
        Ok(Self::with_parts(
            config,
            Arc::new(DefaultTransportFactory),
            Arc::new(timeline),
        ))
    }

    pub fn with_parts(
        config: ProxyConfig,
        factory: Arc<dyn TransportFactory>,
        timeline: Arc<TimelineLogger>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            state: RwLock::new(EngineState::Uninitialized),
            factory,
            timeline,
            services: RwLock::new(None),
            host: Mutex::new(None),
            registered: Mutex::new(BTreeSet::new()),
            loops: Mutex::new(Vec::new()),
            started: RwLock::new(None),
            lifecycle: Mutex::new(()),
        }
    }

    // ── State helpers ───────────────────────────────────────────────────────

    pub fn state(&self) -> EngineState {
        match self.state.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_state(&self, state: EngineState) {
        match self.state.write() {
            Ok(mut guard) => *guard = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
        tracing::debug!(state = ?state, "engine state changed");
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    pub fn config(&self) -> ProxyConfig {
        match self.config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_config(&self, config: ProxyConfig) {
        match self.config.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }

    pub fn timeline(&self) -> &Arc<TimelineLogger> {
        &self.timeline
    }

    fn services(&self) -> Option<(Arc<DiscoveryService>, Arc<Mutex<ProxyGenerator>>)> {
        let guard = match self.services.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard
            .as_ref()
            .map(|s| (s.discovery.clone(), s.generator.clone()))
    }

    fn set_services(&self, services: Option<Services>) {
        match self.services.write() {
            Ok(mut guard) => *guard = services,
            Err(poisoned) => *poisoned.into_inner() = services,
        }
    }

    /// The running services, or `NotRunning` naming `operation`.
    fn running(
        &self,
        operation: &str,
    ) -> Result<(Arc<DiscoveryService>, Arc<Mutex<ProxyGenerator>>), McpError> {
        if !self.is_running() {
            return Err(McpError::NotRunning {
                operation: operation.to_string(),
            });
        }
        self.services().ok_or_else(|| McpError::NotRunning {
            operation: operation.to_string(),
        })
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Validate the config and build services. Nothing connects yet.
    pub async fn initialize(&self) -> Result<(), McpError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.initialize_locked()
    }

    fn initialize_locked(&self) -> Result<(), McpError> {
        match self.state() {
            EngineState::Uninitialized | EngineState::Stopped => {}
            other => {
                return Err(McpError::InvalidState {
                    reason: format!("cannot initialize from {other:?}"),
                })
            }
        }

        let config = self.config();
        validate_config(&config)?;

        let discovery = Arc::new(DiscoveryService::new(
            &config,
            self.factory.clone(),
            self.timeline.clone(),
        )?);
        let generator = ProxyGenerator::new(discovery.clone(), self.timeline.clone());
        self.set_services(Some(Services {
            discovery,
            generator: Arc::new(Mutex::new(generator)),
        }));
        self.set_state(EngineState::Initialized);

        tracing::info!(
            servers = config.enabled_servers().count(),
            timeline = self.timeline.is_enabled(),
            "proxy engine initialized"
        );
        Ok(())
    }

    /// Discover, generate proxies, and start the background loops.
    ///
    /// Server failures during the first discovery are reported in
    /// [`Self::discovery_results`] and do not fail the start.
    pub async fn start(self: &Arc<Self>) -> Result<(), McpError> {
        let _lifecycle = self.lifecycle.lock().await;
        match self.state() {
            EngineState::Uninitialized | EngineState::Stopped => self.initialize_locked()?,
            EngineState::Initialized => {}
            EngineState::Running => {
                return Err(McpError::InvalidState {
                    reason: "engine is already running".into(),
                })
            }
        }
        let Some((discovery, generator)) = self.services() else {
            return Err(McpError::InvalidState {
                reason: "services missing after initialize".into(),
            });
        };

        let results = discovery.discover_all(false).await;
        let tools = discovery.list_tools().await;
        generator.lock().await.sync(&tools);

        self.spawn_loops().await;

        let now = (Instant::now(), Utc::now());
        match self.started.write() {
            Ok(mut guard) => *guard = Some(now),
            Err(poisoned) => *poisoned.into_inner() = Some(now),
        }
        self.set_state(EngineState::Running);

        tracing::info!(
            servers = results.len(),
            healthy = results.iter().filter(|r| r.success).count(),
            tools = tools.len(),
            "proxy engine started"
        );
        Ok(())
    }

    async fn spawn_loops(self: &Arc<Self>) {
        let settings = self.config().global_settings;
        let mut loops = self.loops.lock().await;
        for old in loops.drain(..) {
            old.token.cancel();
        }
        loops.push(self.spawn_loop(LoopKind::Health, settings.health_check_duration()));
        loops.push(self.spawn_loop(LoopKind::Discovery, settings.discovery_duration()));
    }

    fn spawn_loop(self: &Arc<Self>, kind: LoopKind, period: Duration) -> BackgroundLoop {
        let token = CancellationToken::new();
        let child = token.clone();
        let engine = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(engine) = engine.upgrade() else { break };
                        let outcome = match kind {
                            LoopKind::Discovery => engine.refresh_tools(false).await.map(|_| ()),
                            LoopKind::Health => engine.check_health().await.map(|_| ()),
                        };
                        if let Err(e) = outcome {
                            tracing::warn!(error = %e, ?kind, "background pass failed");
                        }
                    }
                }
            }
            tracing::debug!(?kind, "background loop stopped");
        });

        BackgroundLoop { kind, token, handle }
    }

    /// Cancel loops, withdraw host registrations, disconnect and clear.
    ///
    /// Stopping an engine that is not running is a no-op.
    pub async fn stop(&self) -> Result<(), McpError> {
        // The loops take the lifecycle lock on every pass; stop them first.
        let loops: Vec<BackgroundLoop> = self.loops.lock().await.drain(..).collect();
        for running in loops {
            running.token.cancel();
            running.handle.abort();
            if let Err(e) = running.handle.await {
                if !e.is_cancelled() {
                    tracing::warn!(error = %e, kind = ?running.kind, "background loop task failed");
                }
            }
        }

        let _lifecycle = self.lifecycle.lock().await;
        if !matches!(self.state(), EngineState::Running | EngineState::Initialized) {
            return Ok(());
        }

        let withdrawn = self.withdraw_all().await;

        if let Some((discovery, generator)) = self.services() {
            discovery.shutdown().await;
            generator.lock().await.clear();
        }
        self.set_services(None);
        self.timeline.flush().await;
        self.set_state(EngineState::Stopped);

        tracing::info!(unregistered = withdrawn, "proxy engine stopped");
        Ok(())
    }

    // ── Host registration ───────────────────────────────────────────────────

    /// Register every generated proxy with `host`. Returns the number registered.
    ///
    /// Attaching a new host withdraws registrations from the previous one.
    pub async fn register_proxy_tools(
        &self,
        host: Arc<dyn HostToolRegistry>,
    ) -> Result<usize, McpError> {
        let (_, generator) = self.running("register proxy tools")?;
        let _lifecycle = self.lifecycle.lock().await;

        self.withdraw_all().await;
        *self.host.lock().await = Some(host.clone());

        let functions = generator.lock().await.functions();
        let mut registered = self.registered.lock().await;
        for function in functions {
            let name = function.name().to_string();
            host.register_tool(HostTool::new(function))?;
            registered.insert(name);
        }

        tracing::info!(tools = registered.len(), "proxy tools registered with host");
        Ok(registered.len())
    }

    /// Unregister everything from the attached host. Returns how many.
    async fn withdraw_all(&self) -> usize {
        let host = self.host.lock().await.clone();
        let mut registered = self.registered.lock().await;
        let count = registered.len();
        if let Some(host) = host {
            for name in registered.iter() {
                host.unregister_tool(name);
            }
        }
        registered.clear();
        count
    }

    /// Apply a generation diff to the attached host, touching only those names.
    async fn apply_host_diff(
        &self,
        diff: &GenerationDiff,
        generator: &Mutex<ProxyGenerator>,
    ) -> Result<(), McpError> {
        let Some(host) = self.host.lock().await.clone() else {
            return Ok(());
        };
        let mut registered = self.registered.lock().await;

        for name in diff.removed.iter().chain(&diff.updated) {
            if registered.remove(name) {
                host.unregister_tool(name);
            }
        }

        let generator = generator.lock().await;
        for name in diff.added.iter().chain(&diff.updated) {
            if let Some(function) = generator.get(name) {
                host.register_tool(HostTool::new(function))?;
                registered.insert(name.clone());
            }
        }

        if !diff.is_empty() {
            tracing::debug!(
                added = diff.added.len(),
                removed = diff.removed.len(),
                updated = diff.updated.len(),
                "host registrations updated"
            );
        }
        Ok(())
    }

    async fn regenerate(
        &self,
        discovery: &DiscoveryService,
        generator: &Mutex<ProxyGenerator>,
    ) -> Result<GenerationDiff, McpError> {
        let tools = discovery.list_tools().await;
        let diff = generator.lock().await.sync(&tools);
        self.apply_host_diff(&diff, generator).await?;
        Ok(diff)
    }

    // ── Refresh ─────────────────────────────────────────────────────────────

    /// Rediscover every server and resync proxies and host registrations.
    pub async fn refresh_tools(&self, force_discovery: bool) -> Result<RefreshSummary, McpError> {
        let (discovery, generator) = self.running("refresh tools")?;
        let _lifecycle = self.lifecycle.lock().await;

        let results = discovery.discover_all(force_discovery).await;
        let changes = self.regenerate(&discovery, &generator).await?;
        Ok(RefreshSummary { results, changes })
    }

    /// Rediscover one server; other servers' proxies stay untouched.
    pub async fn refresh_server_tools(
        &self,
        server_name: &str,
    ) -> Result<DiscoveryResult, McpError> {
        let (discovery, generator) = self.running("refresh server tools")?;
        let _lifecycle = self.lifecycle.lock().await;

        let result = discovery.discover_server(server_name, true).await?;
        self.regenerate(&discovery, &generator).await?;
        Ok(result)
    }

    /// Probe every server, reconnecting or purging the unhealthy ones, then
    /// resync proxies and host registrations with what survived.
    ///
    /// Returns each server's health after the sweep.
    pub async fn check_health(&self) -> Result<BTreeMap<String, bool>, McpError> {
        let (discovery, generator) = self.running("check health")?;
        let _lifecycle = self.lifecycle.lock().await;

        let report = discovery.health_check_all().await;
        let diff = self.regenerate(&discovery, &generator).await?;
        if !diff.is_empty() {
            tracing::info!(
                removed = diff.removed.len(),
                added = diff.added.len(),
                updated = diff.updated.len(),
                "health sweep changed proxies"
            );
        }
        Ok(report)
    }

    /// Swap in a new configuration.
    ///
    /// While running, removed servers are dropped, new and changed servers
    /// are (re)connected and rediscovered, and proxies are resynced. The
    /// call-concurrency bound is fixed for the engine's lifetime.
    pub async fn reload_config(&self, config: ProxyConfig) -> Result<ConfigChanges, McpError> {
        validate_config(&config)?;
        let _lifecycle = self.lifecycle.lock().await;

        let services = match self.state() {
            EngineState::Running | EngineState::Initialized => self.services(),
            _ => None,
        };
        let Some((discovery, generator)) = services else {
            self.set_config(config);
            return Ok(ConfigChanges::default());
        };

        let changes = discovery.apply_config(&config).await?;
        self.set_config(config);

        if self.is_running() {
            for name in changes.touched() {
                discovery.discover_server(name, true).await?;
            }
            self.regenerate(&discovery, &generator).await?;
        }
        tracing::info!(
            added = ?changes.added,
            removed = ?changes.removed,
            changed = ?changes.changed,
            "configuration reloaded"
        );
        Ok(changes)
    }

    // ── Calls ───────────────────────────────────────────────────────────────

    /// Call a proxied tool by its final name.
    pub async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<Value, McpError> {
        let (discovery, generator) = self.running("call tool")?;
        let function = generator.lock().await.get(tool_name);
        match function {
            Some(function) => function.call(arguments).await,
            None => Err(McpError::unknown_tool(
                tool_name,
                &discovery.similar_tools(tool_name, 3).await,
            )),
        }
    }

    /// The generated callable for `tool_name`, if any.
    pub async fn proxy_function(&self, tool_name: &str) -> Result<Option<Arc<ProxyFunction>>, McpError> {
        let (_, generator) = self.running("get proxy function")?;
        let function = generator.lock().await.get(tool_name);
        Ok(function)
    }

    // ── Introspection ───────────────────────────────────────────────────────

    pub async fn get_stats(&self) -> Result<EngineStats, McpError> {
        let (discovery, generator) = self.running("get stats")?;
        let discovered = discovery.stats().await;
        let proxy_functions = generator.lock().await.len();
        let tools_registered = self.registered.lock().await.len();
        let started = match self.started.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        };

        Ok(EngineStats {
            state: self.state(),
            servers_configured: discovered.servers_configured,
            servers_connected: discovered.servers_connected,
            tools_discovered: discovered.total_tools,
            proxy_functions,
            tools_registered,
            conflicts: discovered.conflicts,
            uptime_secs: started.map(|(at, _)| at.elapsed().as_secs()).unwrap_or(0),
            started_at: started.map(|(_, at)| at),
            last_discovery: discovered.last_discovery,
            timeline_dropped_events: self.timeline.dropped_events(),
        })
    }

    pub async fn get_tool_info(&self, tool_name: &str) -> Result<ToolInfo, McpError> {
        let (discovery, generator) = self.running("get tool info")?;
        let Some(tool) = discovery.get_tool(tool_name).await else {
            return Err(McpError::unknown_tool(
                tool_name,
                &discovery.similar_tools(tool_name, 3).await,
            ));
        };
        let function = generator.lock().await.get(tool_name);
        let registered = self.registered.lock().await.contains(tool_name);

        Ok(ToolInfo {
            tool,
            proxy: function.as_ref().map(|f| f.metadata().clone()),
            signature: function.as_ref().map(|f| f.signature()),
            documentation: function.as_ref().map(|f| f.documentation().to_string()),
            registered,
        })
    }

    pub async fn get_server_info(&self, server_name: &str) -> Result<ServerDetails, McpError> {
        let (discovery, _) = self.running("get server info")?;
        let client = discovery.client(server_name).await?;
        let tools = discovery
            .tools_for_server(server_name)
            .await
            .into_iter()
            .map(|t| t.name)
            .collect();
        let last_discovery = discovery
            .discovery_results()
            .await
            .into_iter()
            .find(|r| r.server_name == server_name);

        Ok(ServerDetails {
            status: client.status(),
            server_info: client.server_info(),
            tools,
            last_discovery,
        })
    }

    pub async fn list_tools(&self) -> Result<Vec<Tool>, McpError> {
        let (discovery, _) = self.running("list tools")?;
        Ok(discovery.list_tools().await)
    }

    pub async fn conflicts(&self) -> Result<Vec<ToolConflict>, McpError> {
        let (discovery, _) = self.running("list conflicts")?;
        Ok(discovery.conflicts().await)
    }

    pub async fn discovery_results(&self) -> Result<Vec<DiscoveryResult>, McpError> {
        let (discovery, _) = self.running("list discovery results")?;
        Ok(discovery.discovery_results().await)
    }

    pub async fn server_statuses(&self) -> Result<Vec<ClientStatus>, McpError> {
        let (discovery, _) = self.running("list server statuses")?;
        Ok(discovery.client_statuses().await)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerConfig, ServerType};
    use crate::mcp_client::transport::mock::{string_schema, MockFactory, MockTransport};
    use crate::timeline::{MemorySink, TimelineEvent};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn config() -> ProxyConfig {
        let servers = ["sse-server", "http-server"]
            .into_iter()
            .map(|name| {
                let kind = if name == "sse-server" {
                    ServerType::Sse
                } else {
                    ServerType::StreamableHttp
                };
                let mut cfg = ServerConfig::network(name, kind, "http://127.0.0.1:1/")
                    .with_prefix(&format!("{name}."));
                cfg.settings.retry_attempts = 0;
                cfg.settings.timeout = 2;
                cfg
            })
            .collect();
        ProxyConfig::from_servers(servers)
    }

    fn factory() -> Arc<MockFactory> {
        Arc::new(
            MockFactory::default()
                .with(
                    MockTransport::new("sse-server", ServerType::Sse)
                        .with_tool("sse_hello_world", string_schema(&["name"]))
                        .with_tool("common_tool", string_schema(&[])),
                )
                .with(
                    MockTransport::new("http-server", ServerType::StreamableHttp)
                        .with_tool("common_tool", string_schema(&[])),
                ),
        )
    }

    fn engine(factory: Arc<MockFactory>) -> Arc<ProxyEngine> {
        Arc::new(ProxyEngine::with_parts(
            config(),
            factory,
            Arc::new(TimelineLogger::disabled()),
        ))
    }

    #[tokio::test]
    async fn test_operations_before_start_fail() {
        let engine = engine(factory());
        assert_eq!(engine.state(), EngineState::Uninitialized);
        assert!(matches!(
            engine.call_tool("x", json!({})).await,
            Err(McpError::NotRunning { .. })
        ));
        assert!(matches!(engine.get_stats().await, Err(McpError::NotRunning { .. })));

        engine.initialize().await.unwrap();
        assert_eq!(engine.state(), EngineState::Initialized);
        assert!(matches!(
            engine.refresh_tools(false).await,
            Err(McpError::NotRunning { .. })
        ));
    }

    #[tokio::test]
    async fn test_start_call_stop() {
        let sink = MemorySink::new();
        let timeline = Arc::new(TimelineLogger::new(vec![Box::new(sink.clone())]));
        let engine = Arc::new(ProxyEngine::with_parts(config(), factory(), timeline.clone()));
        engine.start().await.unwrap();
        assert!(engine.is_running());

        let out = engine
            .call_tool("sse-server.sse_hello_world", json!({"name": "E2E Test"}))
            .await
            .unwrap();
        assert_eq!(out["message"], "Hello E2E Test from SSE MCP Server!");
        assert_eq!(out["server_type"], "sse");

        let stats = engine.get_stats().await.unwrap();
        assert_eq!(stats.servers_configured, 2);
        assert_eq!(stats.servers_connected, 2);
        assert_eq!(stats.tools_discovered, 3);
        assert_eq!(stats.proxy_functions, 3);
        assert_eq!(stats.conflicts, 1);

        engine.stop().await.unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(matches!(
            engine.list_tools().await,
            Err(McpError::NotRunning { .. })
        ));

        let finished = sink
            .events()
            .into_iter()
            .filter(|e| matches!(e, TimelineEvent::CallFinished(_)))
            .count();
        assert_eq!(finished, 1);
    }

    #[tokio::test]
    async fn test_start_twice_is_invalid() {
        let engine = engine(factory());
        engine.start().await.unwrap();
        assert!(matches!(engine.start().await, Err(McpError::InvalidState { .. })));
        engine.stop().await.unwrap();
        // A stopped engine can start again.
        engine.start().await.unwrap();
        assert!(engine.is_running());
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_register_and_refresh_diff() {
        let factory = factory();
        let engine = engine(factory.clone());
        engine.start().await.unwrap();

        let host = Arc::new(InMemoryHostRegistry::new());
        let count = engine.register_proxy_tools(host.clone()).await.unwrap();
        assert_eq!(count, 3);
        assert_eq!(host.len(), 3);

        // The HTTP server grows a tool; only that server is refreshed.
        factory.get("http-server").set_tools(vec![
            json!({"name": "common_tool", "inputSchema": string_schema(&[])}),
            json!({"name": "new_tool", "inputSchema": string_schema(&[])}),
        ]);
        let before = host.get("sse-server.sse_hello_world").unwrap();
        let result = engine.refresh_server_tools("http-server").await.unwrap();
        assert!(result.success);
        assert_eq!(result.tools_discovered, 2);
        assert!(host.get("http-server.new_tool").is_some());
        assert_eq!(host.len(), 4);

        // Untouched registrations keep their original callable.
        let after = host.get("sse-server.sse_hello_world").unwrap();
        assert!(Arc::ptr_eq(&before.handler, &after.handler));

        let info = engine.get_tool_info("http-server.new_tool").await.unwrap();
        assert!(info.registered);
        assert_eq!(info.tool.original_name, "new_tool");

        engine.stop().await.unwrap();
        assert!(host.is_empty());
    }

    #[tokio::test]
    async fn test_server_failure_purges_host_tools() {
        let factory = factory();
        let engine = engine(factory.clone());
        engine.start().await.unwrap();
        let host = Arc::new(InMemoryHostRegistry::new());
        engine.register_proxy_tools(host.clone()).await.unwrap();

        let http = factory.get("http-server");
        http.fail_connect.store(true, Ordering::SeqCst);
        http.drop_connection();

        let result = engine.refresh_server_tools("http-server").await.unwrap();
        assert!(!result.success);
        assert!(host.get("http-server.common_tool").is_none());
        assert!(host.get("sse-server.common_tool").is_some());

        let details = engine.get_server_info("http-server").await.unwrap();
        assert!(details.tools.is_empty());
        assert_eq!(details.last_discovery.map(|r| r.success), Some(false));
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_health_sweep_withdraws_purged_host_tools() {
        let factory = factory();
        let engine = engine(factory.clone());
        engine.start().await.unwrap();
        let host = Arc::new(InMemoryHostRegistry::new());
        engine.register_proxy_tools(host.clone()).await.unwrap();

        let http = factory.get("http-server");
        http.fail_connect.store(true, Ordering::SeqCst);
        http.drop_connection();

        let report = engine.check_health().await.unwrap();
        assert_eq!(report.get("http-server"), Some(&false));
        assert_eq!(report.get("sse-server"), Some(&true));

        assert!(host.get("http-server.common_tool").is_none());
        assert_eq!(host.len(), 2);
        assert!(engine
            .proxy_function("http-server.common_tool")
            .await
            .unwrap()
            .is_none());
        let stats = engine.get_stats().await.unwrap();
        assert_eq!(stats.proxy_functions, 2);
        assert_eq!(stats.tools_registered, 2);
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_handler_refused_after_name_moves_to_other_server() {
        let servers = ["a", "b"]
            .into_iter()
            .map(|name| {
                let mut cfg =
                    ServerConfig::network(name, ServerType::StreamableHttp, "http://127.0.0.1:1/");
                cfg.settings.retry_attempts = 0;
                cfg.settings.timeout = 2;
                cfg
            })
            .collect();
        let factory = Arc::new(
            MockFactory::default()
                .with(
                    MockTransport::new("a", ServerType::StreamableHttp)
                        .with_tool("x", string_schema(&[])),
                )
                .with(
                    MockTransport::new("b", ServerType::StreamableHttp)
                        .with_tool("y", string_schema(&[])),
                ),
        );
        let engine = Arc::new(ProxyEngine::with_parts(
            ProxyConfig::from_servers(servers),
            factory.clone(),
            Arc::new(TimelineLogger::disabled()),
        ));
        engine.start().await.unwrap();
        let host = Arc::new(InMemoryHostRegistry::new());
        engine.register_proxy_tools(host.clone()).await.unwrap();
        let stale = host.get("x").unwrap();
        assert_eq!(stale.server_name, "a");

        let a = factory.get("a");
        a.fail_connect.store(true, Ordering::SeqCst);
        a.drop_connection();
        engine.check_health().await.unwrap();
        assert!(host.get("x").is_none());

        // "x" is free again and b claims it.
        factory.get("b").set_tools(vec![json!({"name": "x", "inputSchema": string_schema(&[])})]);
        engine.refresh_server_tools("b").await.unwrap();
        let current = host.get("x").unwrap();
        assert_eq!(current.server_name, "b");

        let err = stale.call(json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::UnknownTool { .. }), "{err}");
        let out = current.call(json!({})).await.unwrap();
        assert_eq!(out["server"], "b");
        engine.stop().await.unwrap();
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_background_passes_are_send() {
        let engine = engine(factory());
        assert_send(&engine.refresh_tools(false));
        assert_send(&engine.check_health());
        assert_send(&engine.refresh_server_tools("sse-server"));
    }

    #[tokio::test]
    async fn test_unknown_names() {
        let engine = engine(factory());
        engine.start().await.unwrap();
        let err = engine
            .call_tool("sse-server.sse_hello_wrld", json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("sse-server.sse_hello_world"));
        assert!(matches!(
            engine.get_server_info("nope").await,
            Err(McpError::UnknownServer { .. })
        ));
        assert!(matches!(
            engine.refresh_server_tools("nope").await,
            Err(McpError::UnknownServer { .. })
        ));
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_reload_config_removes_server() {
        let engine = engine(factory());
        engine.start().await.unwrap();
        let host = Arc::new(InMemoryHostRegistry::new());
        engine.register_proxy_tools(host.clone()).await.unwrap();

        let mut next = config();
        next.mcp_servers.remove("http-server");
        let changes = engine.reload_config(next).await.unwrap();
        assert_eq!(changes.removed, vec!["http-server"]);
        assert!(host.get("http-server.common_tool").is_none());
        assert_eq!(host.len(), 2);
        assert_eq!(engine.get_stats().await.unwrap().conflicts, 0);
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_validation_error_surfaces() {
        let engine = engine(factory());
        engine.start().await.unwrap();
        let err = engine
            .call_tool("sse-server.sse_hello_world", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Validation { .. }));
        engine.stop().await.unwrap();
    }
}

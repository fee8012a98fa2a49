//! Discovery service: Owns every server client and the shared tool registry.
//!
//! Discovery fans out across all clients concurrently (one task per server),
//! waits for every server to finish or fail, then registers the results in
//! server-name order so deconfliction is deterministic. A server's failure
//! only ever affects that server's tools and `DiscoveryResult`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, Semaphore, SemaphorePermit};
use tokio::task::JoinHandle;

use super::client::{ClientStatus, McpServerClient};
use super::errors::McpError;
use super::registry::ToolRegistry;
use super::transport::TransportFactory;
use super::types::{ConnectionState, DiscoveryResult, ServerInfo, Tool, ToolConflict};
use crate::config::{ProxyConfig, ServerConfig};
use crate::timeline::TimelineLogger;

/// Aggregate view for stats.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryStats {
    pub servers_configured: usize,
    pub servers_connected: usize,
    pub total_tools: usize,
    pub conflicts: usize,
    pub last_discovery: Option<DateTime<Utc>>,
    pub registry_updated: Option<DateTime<Utc>>,
}

/// Server-level changes applied by [`DiscoveryService::apply_config`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConfigChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl ConfigChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    /// Servers whose tools need rediscovery.
    pub fn touched(&self) -> impl Iterator<Item = &String> {
        self.added.iter().chain(self.changed.iter())
    }
}

type DiscoveryOutcome = Result<(Vec<Tool>, Option<ServerInfo>), McpError>;

// ─── DiscoveryService ────────────────────────────────────────────────────────

pub struct DiscoveryService {
    clients: RwLock<BTreeMap<String, Arc<McpServerClient>>>,
    registry: RwLock<ToolRegistry>,
    results: RwLock<BTreeMap<String, DiscoveryResult>>,
    last_discovery: RwLock<Option<DateTime<Utc>>>,
    factory: Arc<dyn TransportFactory>,
    timeline: Arc<TimelineLogger>,
    call_permits: Arc<Semaphore>,
    /// Serializes discovery passes so registrations never interleave.
    discovery_lock: Mutex<()>,
}

impl DiscoveryService {
    /// Build one client per enabled server. Nothing connects yet.
    pub fn new(
        config: &ProxyConfig,
        factory: Arc<dyn TransportFactory>,
        timeline: Arc<TimelineLogger>,
    ) -> Result<Self, McpError> {
        let mut clients = BTreeMap::new();
        for server in config.enabled_servers() {
            let transport = factory.create(server)?;
            clients.insert(
                server.name.clone(),
                Arc::new(McpServerClient::new(server.clone(), transport)),
            );
        }
        tracing::info!(servers = clients.len(), "discovery service created");

        Ok(Self {
            clients: RwLock::new(clients),
            registry: RwLock::new(ToolRegistry::new()),
            results: RwLock::new(BTreeMap::new()),
            last_discovery: RwLock::new(None),
            factory,
            timeline,
            call_permits: Arc::new(Semaphore::new(
                config.global_settings.max_concurrent_calls.max(1),
            )),
            discovery_lock: Mutex::new(()),
        })
    }

    // ── Discovery ───────────────────────────────────────────────────────────

    /// Discover every server concurrently; one result per server.
    pub async fn discover_all(&self, force_refresh: bool) -> Vec<DiscoveryResult> {
        let _pass = self.discovery_lock.lock().await;
        let clients: Vec<Arc<McpServerClient>> = self.clients.read().await.values().cloned().collect();

        let handles: Vec<(String, JoinHandle<(DiscoveryOutcome, Duration)>)> = clients
            .into_iter()
            .map(|client| {
                let name = client.name().to_string();
                let timeline = self.timeline.clone();
                let handle =
                    tokio::spawn(async move { discover_one(&client, force_refresh, &timeline).await });
                (name, handle)
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for (name, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => (
                    Err(McpError::connection(&name, format!("discovery task failed: {e}"))),
                    Duration::ZERO,
                ),
            };
            outcomes.push((name, outcome));
        }

        // Handles were created in name order; registration follows it.
        let mut results = Vec::with_capacity(outcomes.len());
        for (name, (outcome, elapsed)) in outcomes {
            results.push(self.apply_outcome(&name, outcome, elapsed).await);
        }
        *self.last_discovery.write().await = Some(Utc::now());

        let ok = results.iter().filter(|r| r.success).count();
        let tools = self.registry.read().await.len();
        tracing::info!(
            servers = results.len(),
            succeeded = ok,
            failed = results.len() - ok,
            tools,
            "discovery pass complete"
        );
        results
    }

    /// Rediscover a single server.
    pub async fn discover_server(
        &self,
        server_name: &str,
        force_refresh: bool,
    ) -> Result<DiscoveryResult, McpError> {
        let client = self.client(server_name).await?;
        let _pass = self.discovery_lock.lock().await;
        let (outcome, elapsed) = discover_one(&client, force_refresh, &self.timeline).await;
        let result = self.apply_outcome(server_name, outcome, elapsed).await;
        *self.last_discovery.write().await = Some(Utc::now());
        Ok(result)
    }

    /// Replace one server's registry entries with a discovery outcome.
    async fn apply_outcome(
        &self,
        server_name: &str,
        outcome: DiscoveryOutcome,
        elapsed: Duration,
    ) -> DiscoveryResult {
        let elapsed_ms = elapsed.as_millis() as u64;
        let prefix = self
            .clients
            .read()
            .await
            .get(server_name)
            .map(|c| c.config().settings.tool_prefix.clone())
            .unwrap_or_default();

        let result = {
            let mut registry = self.registry.write().await;
            registry.unregister_server(server_name);
            match outcome {
                Ok((tools, info)) => {
                    let names = registry.register_server_tools(tools, &prefix);
                    DiscoveryResult::succeeded(server_name, names.len(), elapsed_ms, info)
                }
                Err(e) => {
                    tracing::warn!(server = %server_name, error = %e, "discovery failed");
                    DiscoveryResult::failed(server_name, &e.to_string(), elapsed_ms)
                }
            }
        };

        self.timeline.log_discovery_event(
            server_name,
            result.tools_discovered,
            result.success,
            result.error_message.as_deref(),
        );
        self.results
            .write()
            .await
            .insert(server_name.to_string(), result.clone());
        result
    }

    // ── Calls ───────────────────────────────────────────────────────────────

    /// Route a call by final registry name to the owning server.
    ///
    /// Each attempt holds one of `max_concurrent_calls` permits. A connection
    /// or timeout failure triggers one reconnect and one retry; no permit is
    /// held while reconnecting.
    pub async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<Value, McpError> {
        let tool = self.resolve_tool(tool_name).await?;
        self.dispatch(&tool, arguments).await
    }

    /// Call exactly the tool `expected` describes.
    ///
    /// Fails with `UnknownTool` when its final name now belongs to a different
    /// server or tool, so a proxy generated before a purge never reaches the
    /// wrong server.
    pub async fn call_exact(&self, expected: &Tool, arguments: Value) -> Result<Value, McpError> {
        let tool = self.resolve_tool(&expected.name).await?;
        if tool.server_name != expected.server_name || tool.original_name != expected.original_name
        {
            tracing::warn!(
                tool = %expected.name,
                expected_server = %expected.server_name,
                current_server = %tool.server_name,
                "refusing call through stale proxy"
            );
            return Err(McpError::UnknownTool {
                name: expected.name.clone(),
                hint: format!(
                    " (now served by '{}' as '{}')",
                    tool.server_name, tool.original_name
                ),
            });
        }
        self.dispatch(&tool, arguments).await
    }

    async fn dispatch(&self, tool: &Tool, arguments: Value) -> Result<Value, McpError> {
        let client = self.client(&tool.server_name).await?;

        let first = {
            let _permit = self.acquire_permit().await?;
            client.call_tool(&tool.original_name, arguments.clone()).await
        };
        let error = match first {
            Err(e) if e.is_retryable() => e,
            other => return other,
        };

        tracing::warn!(
            tool = %tool.name,
            server = %tool.server_name,
            error = %error,
            "tool call failed, reconnecting"
        );
        let reconnected = client.reconnect().await;
        self.timeline.log_connection_event(
            &tool.server_name,
            "reconnect",
            reconnected,
            (!reconnected).then(|| error.to_string()).as_deref(),
        );
        if !reconnected {
            return Err(error);
        }

        let _permit = self.acquire_permit().await?;
        client.call_tool(&tool.original_name, arguments).await
    }

    async fn acquire_permit(&self) -> Result<SemaphorePermit<'_>, McpError> {
        self.call_permits
            .acquire()
            .await
            .map_err(|_| McpError::NotRunning {
                operation: "call_tool".into(),
            })
    }

    async fn resolve_tool(&self, tool_name: &str) -> Result<Tool, McpError> {
        let registry = self.registry.read().await;
        match registry.get_tool(tool_name) {
            Some(tool) => Ok(tool.clone()),
            None => Err(McpError::unknown_tool(
                tool_name,
                &registry.find_similar(tool_name, 3),
            )),
        }
    }

    // ── Health ──────────────────────────────────────────────────────────────

    /// Probe every server; reconnect unhealthy ones and rediscover their tools.
    ///
    /// A server that cannot be reconnected loses its tools until it recovers.
    pub async fn health_check_all(&self) -> BTreeMap<String, bool> {
        let clients: Vec<Arc<McpServerClient>> = self.clients.read().await.values().cloned().collect();
        let probes = clients.iter().map(|client| async move {
            let healthy = client.is_healthy().await;
            (client.clone(), healthy)
        });
        let probed = futures::future::join_all(probes).await;

        let mut report = BTreeMap::new();
        for (client, healthy) in probed {
            let name = client.name().to_string();
            if healthy || client.state() == ConnectionState::Disconnected {
                report.insert(name, healthy);
                continue;
            }

            tracing::warn!(server = %name, state = %client.state(), "server unhealthy, reconnecting");
            let reconnected = client.reconnect().await;
            let error = if reconnected { None } else { client.last_error() };
            self.timeline
                .log_connection_event(&name, "reconnect", reconnected, error.as_deref());

            if reconnected {
                if let Err(e) = self.discover_server(&name, true).await {
                    tracing::warn!(server = %name, error = %e, "rediscovery after reconnect failed");
                }
            } else {
                let removed = self.registry.write().await.unregister_server(&name);
                if !removed.is_empty() {
                    tracing::warn!(server = %name, tools = removed.len(), "purged tools of failed server");
                }
            }
            report.insert(name, reconnected);
        }
        report
    }

    // ── Server Management ───────────────────────────────────────────────────

    /// Add a server client. Its tools appear on the next discovery.
    pub async fn add_server(&self, config: &ServerConfig) -> Result<(), McpError> {
        let transport = self.factory.create(config)?;
        let client = Arc::new(McpServerClient::new(config.clone(), transport));
        if let Some(old) = self
            .clients
            .write()
            .await
            .insert(config.name.clone(), client)
        {
            let _ = old.disconnect().await;
        }
        tracing::info!(server = %config.name, "server added");
        Ok(())
    }

    /// Disconnect a server and purge its tools. Returns the removed tool names.
    pub async fn remove_server(&self, server_name: &str) -> Result<Vec<String>, McpError> {
        let client = self
            .clients
            .write()
            .await
            .remove(server_name)
            .ok_or_else(|| McpError::UnknownServer {
                name: server_name.to_string(),
            })?;
        let _ = client.disconnect().await;
        self.timeline
            .log_connection_event(server_name, "disconnect", true, None);

        let removed = self.registry.write().await.unregister_server(server_name);
        self.results.write().await.remove(server_name);
        tracing::info!(server = %server_name, tools = removed.len(), "server removed");
        Ok(removed)
    }

    /// Reconcile the client set with a new config.
    ///
    /// Added and changed servers get fresh clients; removed and disabled ones
    /// are disconnected and purged. Callers rediscover `touched()` servers.
    pub async fn apply_config(&self, config: &ProxyConfig) -> Result<ConfigChanges, McpError> {
        let desired: BTreeMap<&str, &ServerConfig> = config
            .enabled_servers()
            .map(|s| (s.name.as_str(), s))
            .collect();
        let current: HashMap<String, ServerConfig> = self
            .clients
            .read()
            .await
            .iter()
            .map(|(name, client)| (name.clone(), client.config().clone()))
            .collect();

        let mut changes = ConfigChanges::default();
        for name in current.keys() {
            if !desired.contains_key(name.as_str()) {
                self.remove_server(name).await?;
                changes.removed.push(name.clone());
            }
        }
        for (name, server) in desired {
            match current.get(name) {
                None => {
                    self.add_server(server).await?;
                    changes.added.push(name.to_string());
                }
                Some(existing) if existing != server => {
                    self.add_server(server).await?;
                    changes.changed.push(name.to_string());
                }
                Some(_) => {}
            }
        }
        changes.removed.sort();
        tracing::info!(
            added = changes.added.len(),
            removed = changes.removed.len(),
            changed = changes.changed.len(),
            "configuration applied"
        );
        Ok(changes)
    }

    /// Stop monitoring, disconnect every client and clear the registry.
    pub async fn shutdown(&self) {
        let clients: Vec<Arc<McpServerClient>> = self.clients.read().await.values().cloned().collect();
        let disconnects = clients.iter().map(|client| async move {
            if let Err(e) = client.disconnect().await {
                tracing::warn!(server = %client.name(), error = %e, "disconnect failed");
            }
            self.timeline
                .log_connection_event(client.name(), "disconnect", true, None);
        });
        futures::future::join_all(disconnects).await;
        self.registry.write().await.clear();
        tracing::info!(servers = clients.len(), "discovery service shut down");
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    pub async fn client(&self, server_name: &str) -> Result<Arc<McpServerClient>, McpError> {
        self.clients
            .read()
            .await
            .get(server_name)
            .cloned()
            .ok_or_else(|| McpError::UnknownServer {
                name: server_name.to_string(),
            })
    }

    pub async fn server_names(&self) -> Vec<String> {
        self.clients.read().await.keys().cloned().collect()
    }

    pub async fn get_tool(&self, tool_name: &str) -> Option<Tool> {
        self.registry.read().await.get_tool(tool_name).cloned()
    }

    pub async fn list_tools(&self) -> Vec<Tool> {
        self.registry
            .read()
            .await
            .all_tools()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn tools_for_server(&self, server_name: &str) -> Vec<Tool> {
        self.registry
            .read()
            .await
            .tools_for_server(server_name)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Registered names closest to `name`, best first.
    pub async fn similar_tools(&self, name: &str, max_results: usize) -> Vec<String> {
        self.registry.read().await.find_similar(name, max_results)
    }

    pub async fn conflicts(&self) -> Vec<ToolConflict> {
        self.registry.read().await.conflicts()
    }

    pub async fn openai_tools(&self) -> Vec<Value> {
        self.registry.read().await.to_openai_tools()
    }

    /// Last result per server, in server-name order.
    pub async fn discovery_results(&self) -> Vec<DiscoveryResult> {
        self.results.read().await.values().cloned().collect()
    }

    pub async fn server_info(&self, server_name: &str) -> Result<Option<ServerInfo>, McpError> {
        Ok(self.client(server_name).await?.server_info())
    }

    pub async fn client_statuses(&self) -> Vec<ClientStatus> {
        self.clients
            .read()
            .await
            .values()
            .map(|c| c.status())
            .collect()
    }

    pub async fn stats(&self) -> DiscoveryStats {
        let (servers_configured, servers_connected) = {
            let clients = self.clients.read().await;
            (
                clients.len(),
                clients.values().filter(|c| c.is_connected()).count(),
            )
        };
        let registry = self.registry.read().await.stats();
        DiscoveryStats {
            servers_configured,
            servers_connected,
            total_tools: registry.total_tools,
            conflicts: registry.conflicts,
            last_discovery: *self.last_discovery.read().await,
            registry_updated: registry.last_updated,
        }
    }
}

/// Connect if needed, initialize if needed, list tools.
///
/// A connected server whose request fails with a retryable error gets one
/// reconnect and one more try.
async fn discover_one(
    client: &McpServerClient,
    force_refresh: bool,
    timeline: &TimelineLogger,
) -> (DiscoveryOutcome, Duration) {
    let started = Instant::now();
    let was_connected = client.is_connected();

    if let Err(e) = client.ensure_ready().await {
        if !was_connected {
            timeline.log_connection_event(client.name(), "connect", false, Some(&e.to_string()));
        }
        return (Err(e), started.elapsed());
    }
    if !was_connected {
        timeline.log_connection_event(client.name(), "connect", true, None);
    }

    let outcome = match client.discover_tools(force_refresh).await {
        Err(e) if e.is_retryable() && was_connected => {
            tracing::warn!(server = %client.name(), error = %e, "discovery failed, reconnecting");
            let reconnected = client.reconnect().await;
            timeline.log_connection_event(
                client.name(),
                "reconnect",
                reconnected,
                (!reconnected).then(|| e.to_string()).as_deref(),
            );
            if reconnected {
                client.discover_tools(true).await
            } else {
                Err(e)
            }
        }
        other => other,
    };

    (
        outcome.map(|tools| (tools, client.server_info())),
        started.elapsed(),
    )
}

// ─── Tests ───────────────────────────────────────────────────────────────────

//! Configuration model for the proxy engine.
//!
//! Mirrors the on-disk layout:
//!
//! ```json
//! {
//!   "version": "1.0",
//!   "mcpServers": { "<name>": { "type": "stdio", "command": "...", "settings": {} } },
//!   "global_settings": { "discovery_interval": 300 }
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ─── Server Types ────────────────────────────────────────────────────────────

/// Wire protocol used to reach a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerType {
    /// Child process speaking newline-delimited JSON-RPC over stdio.
    #[serde(rename = "stdio")]
    Stdio,
    /// Long-lived Server-Sent-Events session.
    #[serde(rename = "sse")]
    Sse,
    /// Plain request/response HTTP POSTs.
    #[serde(rename = "streamable-http", alias = "http")]
    StreamableHttp,
}

impl ServerType {
    /// Whether this transport reaches the server over the network.
    pub fn is_network(&self) -> bool {
        !matches!(self, ServerType::Stdio)
    }

    /// Stable label used in logs and stats.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerType::Stdio => "stdio",
            ServerType::Sse => "sse",
            ServerType::StreamableHttp => "streamable-http",
        }
    }
}

impl std::fmt::Display for ServerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-server tuning knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Reconnect attempts before a server is marked failed.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Base reconnect delay in seconds (doubles per attempt).
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,
    /// Prefix prepended to every tool name from this server.
    #[serde(default)]
    pub tool_prefix: String,
    /// Seconds a health-check result stays cached.
    #[serde(default = "default_server_health_interval")]
    pub health_check_interval: u64,
}

fn default_timeout() -> u64 {
    30
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_delay() -> f64 {
    1.0
}
fn default_server_health_interval() -> u64 {
    30
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_delay: default_retry_delay(),
            tool_prefix: String::new(),
            health_check_interval: default_server_health_interval(),
        }
    }
}

impl ServerSettings {
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn retry_delay_duration(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay.max(0.0))
    }

    pub fn health_check_duration(&self) -> Duration {
        Duration::from_secs(self.health_check_interval)
    }
}

/// Configuration for one external tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique server name. Filled from the `mcpServers` map key on load.
    #[serde(default, skip_serializing)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub server_type: ServerType,
    #[serde(default)]
    pub settings: ServerSettings,

    // stdio
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the server process.
    #[serde(default)]
    pub cwd: Option<String>,

    // sse / streamable-http
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

impl ServerConfig {
    /// Minimal stdio server config, mostly useful for tests and embedding.
    pub fn stdio(name: &str, command: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            enabled: true,
            description: None,
            server_type: ServerType::Stdio,
            settings: ServerSettings::default(),
            command: Some(command.to_string()),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
            cwd: None,
            url: None,
            headers: HashMap::new(),
        }
    }

    /// Minimal network server config (`sse` or `streamable-http`).
    pub fn network(name: &str, server_type: ServerType, url: &str) -> Self {
        Self {
            name: name.to_string(),
            enabled: true,
            description: None,
            server_type,
            settings: ServerSettings::default(),
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            url: Some(url.to_string()),
            headers: HashMap::new(),
        }
    }

    /// Builder-style prefix override.
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.settings.tool_prefix = prefix.to_string();
        self
    }
}

// ─── Global Settings ─────────────────────────────────────────────────────────

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalSettings {
    /// Seconds between periodic re-discovery passes.
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval: u64,
    /// Seconds between health-check sweeps over all servers.
    #[serde(default = "default_global_health_interval")]
    pub health_check_interval: u64,
    /// Upper bound on simultaneous outbound tool calls.
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
    #[serde(default = "default_true")]
    pub enable_timeline_logging: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_discovery_interval() -> u64 {
    300
}
fn default_global_health_interval() -> u64 {
    60
}
fn default_max_concurrent_calls() -> usize {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            discovery_interval: default_discovery_interval(),
            health_check_interval: default_global_health_interval(),
            max_concurrent_calls: default_max_concurrent_calls(),
            enable_timeline_logging: true,
            log_level: default_log_level(),
        }
    }
}

impl GlobalSettings {
    pub fn discovery_duration(&self) -> Duration {
        Duration::from_secs(self.discovery_interval)
    }

    pub fn health_check_duration(&self) -> Duration {
        Duration::from_secs(self.health_check_interval)
    }
}

// ─── Top Level ───────────────────────────────────────────────────────────────

/// Top-level proxy configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_version")]
    pub version: String,
    /// Servers keyed by name; a `BTreeMap` keeps iteration order stable.
    #[serde(rename = "mcpServers", alias = "mcp_servers", default)]
    pub mcp_servers: BTreeMap<String, ServerConfig>,
    #[serde(default)]
    pub global_settings: GlobalSettings,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            mcp_servers: BTreeMap::new(),
            global_settings: GlobalSettings::default(),
        }
    }
}

impl ProxyConfig {
    /// Build a config from a list of servers (names taken from each entry).
    pub fn from_servers(servers: Vec<ServerConfig>) -> Self {
        Self {
            mcp_servers: servers.into_iter().map(|s| (s.name.clone(), s)).collect(),
            ..Self::default()
        }
    }

    /// Enabled servers in name order.
    pub fn enabled_servers(&self) -> impl Iterator<Item = &ServerConfig> {
        self.mcp_servers.values().filter(|s| s.enabled)
    }

    pub fn server(&self, name: &str) -> Option<&ServerConfig> {
        self.mcp_servers.get(name)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_settings_defaults() {
        let settings: ServerSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, ServerSettings::default());
        assert_eq!(settings.timeout, 30);
        assert_eq!(settings.retry_attempts, 3);
        assert_eq!(settings.tool_prefix, "");
    }

    #[test]
    fn test_server_type_aliases() {
        let t: ServerType = serde_json::from_str("\"streamable-http\"").unwrap();
        assert_eq!(t, ServerType::StreamableHttp);
        let t: ServerType = serde_json::from_str("\"http\"").unwrap();
        assert_eq!(t, ServerType::StreamableHttp);
        assert!(serde_json::from_str::<ServerType>("\"websocket\"").is_err());
    }

    #[test]
    fn test_enabled_defaults_true() {
        let json = r#"{"type": "stdio", "command": "node"}"#;
        let cfg: ServerConfig = serde_json::from_str(json).unwrap();
        assert!(cfg.enabled);
        assert!(cfg.args.is_empty());
    }

    #[test]
    fn test_enabled_servers_sorted_and_filtered() {
        let mut off = ServerConfig::stdio("beta", "node", &[]);
        off.enabled = false;
        let config = ProxyConfig::from_servers(vec![
            ServerConfig::stdio("gamma", "node", &[]),
            off,
            ServerConfig::stdio("alpha", "node", &[]),
        ]);
        let names: Vec<&str> = config.enabled_servers().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "gamma"]);
    }

    #[test]
    fn test_retry_delay_duration_fractional() {
        let settings = ServerSettings {
            retry_delay: 0.5,
            ..ServerSettings::default()
        };
        assert_eq!(settings.retry_delay_duration(), Duration::from_millis(500));
    }
}

//! MCP proxy engine.
//!
//! Connects to any number of MCP tool servers over stdio, SSE or streamable
//! HTTP, discovers their tools, deconflicts names into one registry and
//! exposes every tool as a schema-validated proxy that routes calls back to
//! the owning server.
//!
//! - `config`: server list and global settings (JSON/YAML)
//! - `mcp_client`: transports, per-server sessions, discovery and registry
//! - `proxy`: argument validation, result normalization, proxy generation
//! - `engine`: lifecycle, host registration, refresh and introspection
//! - `timeline`: fire-and-forget call/discovery/connection events
//! - `logging`: tracing subscriber setup

pub mod config;
pub mod engine;
pub mod logging;
pub mod mcp_client;
pub mod proxy;
pub mod timeline;

pub use config::{load_config, ProxyConfig, ServerConfig};
pub use engine::{EngineState, EngineStats, HostToolRegistry, InMemoryHostRegistry, ProxyEngine};
pub use mcp_client::McpError;
pub use timeline::TimelineLogger;

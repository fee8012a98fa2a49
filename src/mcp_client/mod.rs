//! MCP Client: Sessions with external tool servers.
//!
//! This module handles:
//! - Transports for stdio child processes, SSE sessions and streamable HTTP
//! - JSON-RPC 2.0 request/response correlation and the `initialize` handshake
//! - Tool discovery with caching, fanned out across every configured server
//! - Name deconfliction into one global tool registry
//! - Health checks and reconnect with exponential backoff

pub mod client;
pub mod discovery;
pub mod errors;
pub mod lifecycle;
pub mod registry;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use client::{ClientStatus, McpServerClient};
pub use discovery::{ConfigChanges, DiscoveryService, DiscoveryStats};
pub use errors::McpError;
pub use registry::{RegistryStats, ToolRegistry};
pub use transport::{DefaultTransportFactory, Transport, TransportFactory};
pub use types::{
    ConflictResolution, ConnectionState, DiscoveryResult, JsonRpcMessage, ServerInfo, Tool,
    ToolConflict,
};

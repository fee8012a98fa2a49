//! Host-side tool registration.
//!
//! The engine hands each generated proxy to whatever tool registry the
//! embedding application runs, wrapped as a [`HostTool`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

use crate::mcp_client::errors::McpError;
use crate::proxy::ProxyFunction;

/// A proxy in the host's registration format.
#[derive(Debug, Clone)]
pub struct HostTool {
    pub name: String,
    pub description: String,
    /// OpenAI function-calling definition.
    pub definition: Value,
    pub signature: String,
    pub server_name: String,
    pub original_name: String,
    pub handler: Arc<ProxyFunction>,
}

impl HostTool {
    pub fn new(function: Arc<ProxyFunction>) -> Self {
        let meta = function.metadata();
        Self {
            name: meta.proxy_name.clone(),
            description: function.documentation().to_string(),
            definition: function.definition(),
            signature: function.signature(),
            server_name: meta.server_name.clone(),
            original_name: meta.original_name.clone(),
            handler: function.clone(),
        }
    }

    pub async fn call(&self, arguments: Value) -> Result<Value, McpError> {
        self.handler.call(arguments).await
    }
}

/// Whatever registry the host application uses for callable tools.
pub trait HostToolRegistry: Send + Sync {
    fn register_tool(&self, tool: HostTool) -> Result<(), McpError>;

    /// Returns whether a tool by that name was registered.
    fn unregister_tool(&self, name: &str) -> bool;
}

/// A plain in-process host registry.
#[derive(Debug, Default)]
pub struct InMemoryHostRegistry {
    tools: Mutex<BTreeMap<String, HostTool>>,
}

impl InMemoryHostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn tools(&self) -> MutexGuard<'_, BTreeMap<String, HostTool>> {
        match self.tools.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get(&self, name: &str) -> Option<HostTool> {
        self.tools().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools().keys().cloned().collect()
    }

    pub fn definitions(&self) -> Vec<Value> {
        self.tools().values().map(|t| t.definition.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools().is_empty()
    }

    /// Invoke a registered tool by name.
    pub async fn call(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        let tool = self.get(name).ok_or_else(|| McpError::unknown_tool(name, &[]))?;
        tool.call(arguments).await
    }
}

impl HostToolRegistry for InMemoryHostRegistry {
    fn register_tool(&self, tool: HostTool) -> Result<(), McpError> {
        if tool.name.is_empty() {
            return Err(McpError::HostRegistration {
                tool: tool.name,
                reason: "empty tool name".into(),
            });
        }
        self.tools().insert(tool.name.clone(), tool);
        Ok(())
    }

    fn unregister_tool(&self, name: &str) -> bool {
        self.tools().remove(name).is_some()
    }
}

//! Proxy synthesis: One validated callable per registered tool.
//!
//! A [`ProxyFunction`] is built from a [`Tool`] at registration time: its
//! parameter list, signature and documentation come from the input schema,
//! and every call runs validate → timeline start → invoke → normalize →
//! timeline end.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::result::ResultProcessor;
use super::validator::{ParamSpec, ParameterValidator};
use crate::mcp_client::discovery::DiscoveryService;
use crate::mcp_client::errors::McpError;
use crate::mcp_client::registry::openai_function;
use crate::mcp_client::types::Tool;
use crate::timeline::TimelineLogger;

/// Routes a call for the tool a proxy was generated from. Implemented by the
/// discovery service.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, tool: &Tool, arguments: Value) -> Result<Value, McpError>;
}

#[async_trait]
impl ToolInvoker for DiscoveryService {
    /// Refuses the call when the name now belongs to another server or tool.
    async fn invoke(&self, tool: &Tool, arguments: Value) -> Result<Value, McpError> {
        self.call_exact(tool, arguments).await
    }
}

/// Links a generated callable back to its source tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyFunctionMetadata {
    pub tool: Tool,
    pub server_name: String,
    pub original_name: String,
    pub proxy_name: String,
    pub created_at: DateTime<Utc>,
}

// ─── ProxyFunction ───────────────────────────────────────────────────────────

pub struct ProxyFunction {
    metadata: ProxyFunctionMetadata,
    validator: ParameterValidator,
    params: Vec<ParamSpec>,
    documentation: String,
    invoker: Arc<dyn ToolInvoker>,
    timeline: Arc<TimelineLogger>,
    processor: ResultProcessor,
}

impl ProxyFunction {
    pub fn new(tool: &Tool, invoker: Arc<dyn ToolInvoker>, timeline: Arc<TimelineLogger>) -> Self {
        let validator = ParameterValidator::new(&tool.name, &tool.input_schema);
        let params = validator.parameters();
        let documentation = build_documentation(tool, &params);
        Self {
            metadata: ProxyFunctionMetadata {
                tool: tool.clone(),
                server_name: tool.server_name.clone(),
                original_name: tool.original_name.clone(),
                proxy_name: tool.name.clone(),
                created_at: Utc::now(),
            },
            validator,
            params,
            documentation,
            invoker,
            timeline,
            processor: ResultProcessor,
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.proxy_name
    }

    pub fn metadata(&self) -> &ProxyFunctionMetadata {
        &self.metadata
    }

    /// Parameters in call order: required first, then optional.
    pub fn parameters(&self) -> &[ParamSpec] {
        &self.params
    }

    pub fn documentation(&self) -> &str {
        &self.documentation
    }

    /// e.g. `greet(name: string, times: integer = 1)`
    pub fn signature(&self) -> String {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| {
                if p.required {
                    format!("{}: {}", p.name, p.type_label)
                } else {
                    let default = p
                        .default
                        .as_ref()
                        .map(Value::to_string)
                        .unwrap_or_else(|| "null".into());
                    format!("{}: {} = {}", p.name, p.type_label, default)
                }
            })
            .collect();
        format!("{}({})", self.name(), params.join(", "))
    }

    /// Host-facing definition in OpenAI function-calling format.
    pub fn definition(&self) -> Value {
        openai_function(&self.metadata.tool)
    }

    /// Validate, forward to the owning server and normalize the reply.
    ///
    /// Every outcome, including validation failures, reaches the timeline.
    pub async fn call(&self, arguments: Value) -> Result<Value, McpError> {
        let meta = &self.metadata;
        let args = match self.validator.validate(&arguments) {
            Ok(args) => Value::Object(args),
            Err(e) => {
                let call_id = self.timeline.log_call_start(
                    &meta.proxy_name,
                    &meta.server_name,
                    &meta.original_name,
                    &arguments,
                );
                self.timeline
                    .log_call_end(&call_id, None, Some(&e.to_string()));
                return Err(e);
            }
        };

        let call_id = self.timeline.log_call_start(
            &meta.proxy_name,
            &meta.server_name,
            &meta.original_name,
            &args,
        );

        let outcome = match self.invoker.invoke(&meta.tool, args).await {
            Ok(raw) => self.processor.process(&meta.proxy_name, raw),
            Err(e) => Err(e),
        };

        match &outcome {
            Ok(value) => self.timeline.log_call_end(&call_id, Some(value), None),
            Err(e) => {
                tracing::warn!(
                    tool = %meta.proxy_name,
                    server = %meta.server_name,
                    kind = e.kind(),
                    error = %e,
                    "proxied call failed"
                );
                self.timeline
                    .log_call_end(&call_id, None, Some(&e.to_string()));
            }
        }
        outcome
    }
}

impl std::fmt::Debug for ProxyFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyFunction")
            .field("name", &self.metadata.proxy_name)
            .field("server", &self.metadata.server_name)
            .field("original", &self.metadata.original_name)
            .finish()
    }
}

fn build_documentation(tool: &Tool, params: &[ParamSpec]) -> String {
    let mut doc = String::new();
    if tool.description.is_empty() {
        doc.push_str(&format!("Proxy for `{}`.", tool.original_name));
    } else {
        doc.push_str(tool.description.trim());
    }
    doc.push_str(&format!(
        "\n\nServer: {} (tool `{}`)",
        tool.server_name, tool.original_name
    ));

    if params.is_empty() {
        return doc;
    }
    doc.push_str("\n\nParameters:");
    for p in params {
        let mut line = format!("\n  {} ({}", p.name, p.type_label);
        if p.required {
            line.push_str(", required");
        } else {
            line.push_str(", optional");
            if let Some(default) = &p.default {
                line.push_str(&format!(", default {default}"));
            }
        }
        line.push(')');
        if let Some(desc) = &p.description {
            line.push_str(&format!(": {desc}"));
        }
        if let Some(options) = p.schema.get("enum").and_then(Value::as_array) {
            let options: Vec<String> = options.iter().map(Value::to_string).collect();
            line.push_str(&format!(" [one of {}]", options.join(", ")));
        }
        doc.push_str(&line);
    }
    doc
}

// ─── ProxyGenerator ──────────────────────────────────────────────────────────

/// Names touched by a [`ProxyGenerator::sync`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GenerationDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
}

impl GenerationDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

/// Owns every generated [`ProxyFunction`], keyed by proxy name.
pub struct ProxyGenerator {
    functions: HashMap<String, Arc<ProxyFunction>>,
    invoker: Arc<dyn ToolInvoker>,
    timeline: Arc<TimelineLogger>,
}

impl ProxyGenerator {
    pub fn new(invoker: Arc<dyn ToolInvoker>, timeline: Arc<TimelineLogger>) -> Self {
        Self {
            functions: HashMap::new(),
            invoker,
            timeline,
        }
    }

    /// Generate (or regenerate) the callable for `tool`.
    pub fn generate(&mut self, tool: &Tool) -> Arc<ProxyFunction> {
        let function = Arc::new(ProxyFunction::new(
            tool,
            self.invoker.clone(),
            self.timeline.clone(),
        ));
        if self
            .functions
            .insert(tool.name.clone(), function.clone())
            .is_some()
        {
            tracing::debug!(tool = %tool.name, "regenerated proxy function");
        }
        function
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<ProxyFunction>> {
        self.functions.remove(name)
    }

    /// Make the generated set match `tools` exactly.
    ///
    /// Unchanged tools keep their existing callable.
    pub fn sync(&mut self, tools: &[Tool]) -> GenerationDiff {
        let mut diff = GenerationDiff::default();
        let wanted: BTreeSet<&str> = tools.iter().map(|t| t.name.as_str()).collect();

        let mut stale: Vec<String> = self
            .functions
            .keys()
            .filter(|name| !wanted.contains(name.as_str()))
            .cloned()
            .collect();
        stale.sort();
        for name in stale {
            self.functions.remove(&name);
            diff.removed.push(name);
        }

        for tool in tools {
            match self.functions.get(&tool.name) {
                Some(existing) if existing.metadata.tool == *tool => {}
                Some(_) => {
                    self.generate(tool);
                    diff.updated.push(tool.name.clone());
                }
                None => {
                    self.generate(tool);
                    diff.added.push(tool.name.clone());
                }
            }
        }

        if !diff.is_empty() {
            tracing::info!(
                added = diff.added.len(),
                removed = diff.removed.len(),
                updated = diff.updated.len(),
                total = self.functions.len(),
                "proxy functions synced"
            );
        }
        diff
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProxyFunction>> {
        self.functions.get(name).cloned()
    }

    /// All callables, sorted by name.
    pub fn functions(&self) -> Vec<Arc<ProxyFunction>> {
        let mut functions: Vec<Arc<ProxyFunction>> = self.functions.values().cloned().collect();
        functions.sort_by(|a, b| a.name().cmp(b.name()));
        functions
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn clear(&mut self) {
        self.functions.clear();
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

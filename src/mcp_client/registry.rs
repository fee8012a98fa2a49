//! Tool registry: One flat namespace over every server's tools.
//!
//! Provides:
//! - Deconflicted registration (`prefix + name`, falling back to `server_name`)
//! - Conflict records for tools exposed by more than one server
//! - Lookup by final name, per-server listing, purge by server
//! - "Did you mean" suggestions and OpenAI function-format export

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::types::{ConflictResolution, Tool, ToolConflict};

/// Registry counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryStats {
    pub total_tools: usize,
    pub servers_with_tools: usize,
    pub conflicts: usize,
    pub last_updated: Option<DateTime<Utc>>,
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Aggregated tool registry across all servers.
///
/// Every key is unique. A tool keeps the name it was registered under until
/// its server's tools are purged.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    /// `final name → tool`.
    tools: HashMap<String, Tool>,
    /// `original name → conflict`, only for names exposed by 2+ servers.
    conflicts: BTreeMap<String, ToolConflict>,
    last_updated: Option<DateTime<Utc>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one tool and return the name it ended up under.
    ///
    /// The candidate key is `prefix + original_name`. A candidate held by this
    /// same tool is replaced in place. A candidate held by any other tool,
    /// including one of this server's tools sitting on a fallback name, makes
    /// this tool fall back to `server_original`, with a numeric suffix if even
    /// that is taken.
    pub fn register_tool(&mut self, mut tool: Tool, prefix: &str) -> String {
        let candidate = format!("{prefix}{}", tool.original_name);

        let final_name = match self.tools.get(&candidate) {
            Some(existing)
                if existing.server_name != tool.server_name
                    || existing.original_name != tool.original_name =>
            {
                let fallback = format!("{}_{}", tool.server_name, tool.original_name);
                let name = self.free_name_for(&tool, fallback);
                tracing::info!(
                    tool = %tool.original_name,
                    server = %tool.server_name,
                    taken_by = %existing.server_name,
                    renamed_to = %name,
                    "tool name conflict resolved by renaming"
                );
                name
            }
            _ => candidate.clone(),
        };

        let renamed = final_name != candidate;
        tool.name = final_name.clone();
        self.record_conflict(&tool, renamed);
        self.tools.insert(final_name.clone(), tool);
        self.last_updated = Some(Utc::now());
        final_name
    }

    /// Register a batch for one server, in order. Returns final names.
    pub fn register_server_tools(
        &mut self,
        tools: impl IntoIterator<Item = Tool>,
        prefix: &str,
    ) -> Vec<String> {
        tools
            .into_iter()
            .map(|tool| self.register_tool(tool, prefix))
            .collect()
    }

    /// First name starting at `base` that is free or already this tool's.
    fn free_name_for(&self, tool: &Tool, base: String) -> String {
        let usable = |name: &str| match self.tools.get(name) {
            None => true,
            Some(t) => t.server_name == tool.server_name && t.original_name == tool.original_name,
        };
        if usable(&base) {
            return base;
        }
        (2..)
            .map(|n| format!("{base}_{n}"))
            .find(|name| usable(name))
            .unwrap_or(base)
    }

    fn record_conflict(&mut self, tool: &Tool, renamed: bool) {
        let others: Vec<(String, String)> = self
            .tools
            .values()
            .filter(|t| t.original_name == tool.original_name && t.server_name != tool.server_name)
            .map(|t| (t.server_name.clone(), t.name.clone()))
            .collect();
        if others.is_empty() {
            return;
        }

        let conflict = self
            .conflicts
            .entry(tool.original_name.clone())
            .or_insert_with(|| ToolConflict {
                tool_name: tool.original_name.clone(),
                servers: Vec::new(),
                final_names: Vec::new(),
                resolution: ConflictResolution::Prefixed,
            });

        for (server, name) in others
            .into_iter()
            .chain(std::iter::once((tool.server_name.clone(), tool.name.clone())))
        {
            match conflict.servers.iter().position(|s| *s == server) {
                Some(i) => conflict.final_names[i] = name,
                None => {
                    conflict.servers.push(server);
                    conflict.final_names.push(name);
                }
            }
        }
        if renamed {
            conflict.resolution = ConflictResolution::Renamed;
        }
    }

    /// Purge every tool of one server and its share of any conflict.
    ///
    /// Returns the removed names. Other servers' entries are untouched.
    pub fn unregister_server(&mut self, server_name: &str) -> Vec<String> {
        let removed: Vec<String> = self
            .tools
            .iter()
            .filter(|(_, t)| t.server_name == server_name)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &removed {
            self.tools.remove(name);
        }

        self.conflicts.retain(|_, conflict| {
            if let Some(i) = conflict.servers.iter().position(|s| s == server_name) {
                conflict.servers.remove(i);
                conflict.final_names.remove(i);
            }
            conflict.servers.len() >= 2
        });

        if !removed.is_empty() {
            self.last_updated = Some(Utc::now());
        }
        removed
    }

    pub fn get_tool(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Tools of one server, sorted by final name.
    pub fn tools_for_server(&self, server_name: &str) -> Vec<&Tool> {
        let mut tools: Vec<&Tool> = self
            .tools
            .values()
            .filter(|t| t.server_name == server_name)
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// All tools, sorted by final name.
    pub fn all_tools(&self) -> Vec<&Tool> {
        let mut tools: Vec<&Tool> = self.tools.values().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn server_names(&self) -> Vec<String> {
        let servers: HashSet<&str> = self.tools.values().map(|t| t.server_name.as_str()).collect();
        let mut servers: Vec<String> = servers.into_iter().map(String::from).collect();
        servers.sort();
        servers
    }

    pub fn conflicts(&self) -> Vec<ToolConflict> {
        self.conflicts.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            total_tools: self.tools.len(),
            servers_with_tools: self.server_names().len(),
            conflicts: self.conflicts.len(),
            last_updated: self.last_updated,
        }
    }

    pub fn clear(&mut self) {
        self.tools.clear();
        self.conflicts.clear();
        self.last_updated = Some(Utc::now());
    }

    /// Up to `max_results` registered names closest to `name`, best first.
    pub fn find_similar(&self, name: &str, max_results: usize) -> Vec<String> {
        let mut scored: Vec<(&String, f64)> = self
            .tools
            .keys()
            .map(|candidate| (candidate, similarity(name, candidate)))
            // Floor: don't suggest wildly different tools
            .filter(|(_, score)| *score > 0.5)
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });
        scored
            .into_iter()
            .take(max_results)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Tool definitions in OpenAI function-calling format, sorted by name.
    pub fn to_openai_tools(&self) -> Vec<serde_json::Value> {
        self.all_tools().into_iter().map(openai_function).collect()
    }
}

/// One tool as an OpenAI `{"type": "function", ...}` definition.
pub fn openai_function(tool: &Tool) -> serde_json::Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.input_schema,
        }
    })
}

// ─── Edit Distance ──────────────────────────────────────────────────────────

/// Levenshtein distance over chars, single-row DP.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Normalized similarity, 0.0 (different) to 1.0 (identical).
fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

// ─── Tests ───────────────────────────────────────────────────────────────────

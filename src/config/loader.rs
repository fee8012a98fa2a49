//! Configuration loading and validation.
//!
//! Reads the proxy config (JSON, or YAML by extension), expands `${VAR}`
//! placeholders from the environment and validates every server entry and
//! the global settings. Any problem is a [`ConfigError`] and is fatal.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use super::errors::ConfigError;
use super::types::{GlobalSettings, ProxyConfig, ServerConfig, ServerType};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Environment variable that points at the config file.
pub const CONFIG_ENV_VAR: &str = "MCP_PROXY_CONFIG";

/// File names searched for when no explicit path is given.
const CONFIG_FILE_NAMES: &[&str] = &["mcp_proxy.json", "mcp_proxy.yaml", "mcp_proxy.yml"];

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// On-disk encoding of a config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    /// Pick the format from a file extension (JSON unless `.yaml`/`.yml`).
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Json,
        }
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Resolution order:
/// 1. `MCP_PROXY_CONFIG` env var (must exist).
/// 2. Walk upward from `start` looking for `mcp_proxy.{json,yaml,yml}`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, ConfigError> {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(&path);
        if candidate.is_file() {
            return Ok(candidate);
        }
        return Err(ConfigError::NotFound {
            reason: format!("{CONFIG_ENV_VAR} points at missing file '{path}'"),
        });
    }

    let mut dir = start.to_path_buf();
    loop {
        for name in CONFIG_FILE_NAMES {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        if !dir.pop() {
            break;
        }
    }

    Err(ConfigError::NotFound {
        reason: format!(
            "searched upward from '{}' for {}",
            start.display(),
            CONFIG_FILE_NAMES.join(", ")
        ),
    })
}

/// Read, parse, expand and validate a config file.
pub fn load_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let config = parse_config(&content, ConfigFormat::from_path(path))?;

    tracing::info!(
        path = %path.display(),
        servers = config.mcp_servers.len(),
        enabled = config.enabled_servers().count(),
        "loaded proxy config"
    );

    Ok(config)
}

/// Parse config text, expand environment placeholders and validate.
pub fn parse_config(content: &str, format: ConfigFormat) -> Result<ProxyConfig, ConfigError> {
    let mut config: ProxyConfig = match format {
        ConfigFormat::Json => serde_json::from_str(content)?,
        ConfigFormat::Yaml => serde_yaml::from_str(content)?,
    };

    // The map key is the source of truth for the server name.
    for (name, server) in config.mcp_servers.iter_mut() {
        server.name = name.clone();
    }

    expand_env_vars(&mut config, |var| std::env::var(var).ok())?;
    validate_config(&config)?;
    Ok(config)
}

// ─── Environment Expansion ───────────────────────────────────────────────────

fn placeholder_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").ok())
        .as_ref()
}

/// Replace every `${VAR}` in `value` using `lookup`.
fn expand_value(
    value: &str,
    server: &str,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<String, ConfigError> {
    let Some(re) = placeholder_regex() else {
        return Ok(value.to_string());
    };
    let mut out = String::with_capacity(value.len());
    let mut last = 0;

    for caps in re.captures_iter(value) {
        let (Some(whole), Some(var)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let replacement = lookup(var.as_str()).ok_or_else(|| ConfigError::MissingEnvVar {
            server: server.to_string(),
            var: var.as_str().to_string(),
        })?;
        out.push_str(&value[last..whole.start()]);
        out.push_str(&replacement);
        last = whole.end();
    }
    out.push_str(&value[last..]);
    Ok(out)
}

/// Expand `${VAR}` placeholders in every string field that may carry secrets
/// or machine-specific paths.
pub fn expand_env_vars(
    config: &mut ProxyConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    for server in config.mcp_servers.values_mut() {
        let name = server.name.clone();
        if let Some(cmd) = server.command.as_mut() {
            *cmd = expand_value(cmd, &name, &lookup)?;
        }
        for arg in server.args.iter_mut() {
            *arg = expand_value(arg, &name, &lookup)?;
        }
        for value in server.env.values_mut() {
            *value = expand_value(value, &name, &lookup)?;
        }
        if let Some(url) = server.url.as_mut() {
            *url = expand_value(url, &name, &lookup)?;
        }
        for value in server.headers.values_mut() {
            *value = expand_value(value, &name, &lookup)?;
        }
    }
    Ok(())
}

// ─── Validation ──────────────────────────────────────────────────────────────

/// Validate the whole config.
pub fn validate_config(config: &ProxyConfig) -> Result<(), ConfigError> {
    validate_global(&config.global_settings)?;
    for server in config.mcp_servers.values() {
        validate_server(server)?;
    }
    Ok(())
}

/// Validate global settings: every interval and count must be positive.
pub fn validate_global(global: &GlobalSettings) -> Result<(), ConfigError> {
    if global.discovery_interval == 0 {
        return Err(ConfigError::InvalidGlobal {
            reason: "discovery_interval must be positive".into(),
        });
    }
    if global.health_check_interval == 0 {
        return Err(ConfigError::InvalidGlobal {
            reason: "health_check_interval must be positive".into(),
        });
    }
    if global.max_concurrent_calls == 0 {
        return Err(ConfigError::InvalidGlobal {
            reason: "max_concurrent_calls must be positive".into(),
        });
    }
    if !LOG_LEVELS.contains(&global.log_level.to_ascii_lowercase().as_str()) {
        return Err(ConfigError::InvalidGlobal {
            reason: format!(
                "log_level '{}' must be one of {}",
                global.log_level,
                LOG_LEVELS.join(", ")
            ),
        });
    }
    Ok(())
}

/// Validate one server entry.
pub fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidServer {
        server: server.name.clone(),
        reason,
    };

    if server.name.is_empty() {
        return Err(invalid("server name must not be empty".into()));
    }
    if !server
        .name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(invalid(
            "server name may only contain letters, digits, '_', '-' and '.'".into(),
        ));
    }

    match server.server_type {
        ServerType::Stdio => {
            let has_command = server
                .command
                .as_deref()
                .map(|c| !c.trim().is_empty())
                .unwrap_or(false);
            if !has_command {
                return Err(invalid("stdio transport requires 'command'".into()));
            }
        }
        ServerType::Sse | ServerType::StreamableHttp => {
            let url = server
                .url
                .as_deref()
                .ok_or_else(|| invalid(format!("{} transport requires 'url'", server.server_type)))?;
            let parsed = reqwest::Url::parse(url)
                .map_err(|e| invalid(format!("invalid url '{url}': {e}")))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(invalid(format!(
                    "url scheme must be http or https, got '{}'",
                    parsed.scheme()
                )));
            }
        }
    }

    let settings = &server.settings;
    if settings.timeout == 0 {
        return Err(invalid("settings.timeout must be positive".into()));
    }
    if settings.health_check_interval == 0 {
        return Err(invalid("settings.health_check_interval must be positive".into()));
    }
    if !settings.retry_delay.is_finite() || settings.retry_delay < 0.0 {
        return Err(invalid("settings.retry_delay must be a non-negative number".into()));
    }

    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

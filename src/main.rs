// mcp-proxy - MCP tool gateway
// Main entry point

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use mcp_proxy::config::{find_config_path, load_config};
use mcp_proxy::logging::{init_tracing, LogOptions};
use mcp_proxy::{InMemoryHostRegistry, ProxyEngine};

#[derive(Debug, Parser)]
#[command(name = "mcp-proxy", version, about = "Proxy tools from many MCP servers")]
struct Args {
    /// Config file (defaults to $MCP_PROXY_CONFIG, then mcp_proxy.json upward from cwd)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write logs into this directory instead of stderr
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Persist the call timeline to this SQLite database
    #[arg(long)]
    timeline_db: Option<PathBuf>,

    /// Run one discovery, print stats and tools as JSON, then exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = match args.config {
        Some(path) => path,
        None => {
            let cwd = std::env::current_dir().context("failed to read working directory")?;
            find_config_path(&cwd)?
        }
    };
    let config = load_config(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let log_options = LogOptions {
        log_dir: args.log_dir,
        json: args.json_logs,
        ..LogOptions::default()
    };
    init_tracing(&config.global_settings.log_level, &log_options)
        .context("failed to initialize logging")?;
    tracing::info!(config = %config_path.display(), "configuration loaded");

    let engine = match &args.timeline_db {
        Some(path) => ProxyEngine::with_timeline_db(config, path)
            .with_context(|| format!("failed to open timeline database {}", path.display()))?,
        None => ProxyEngine::new(config),
    };
    let engine = Arc::new(engine);
    engine.start().await.context("failed to start proxy engine")?;

    let host = Arc::new(InMemoryHostRegistry::new());
    let registered = engine.register_proxy_tools(host.clone()).await?;
    tracing::info!(tools = registered, "proxy ready");

    if args.once {
        let report = serde_json::json!({
            "stats": engine.get_stats().await?,
            "servers": engine.server_statuses().await?,
            "discovery": engine.discovery_results().await?,
            "conflicts": engine.conflicts().await?,
            "tools": host.definitions(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for ctrl-c")?;
        tracing::info!("shutdown requested");
    }

    engine.stop().await?;
    engine.timeline().shutdown().await;
    Ok(())
}

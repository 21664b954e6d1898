//! MCP server for the ralph-swarm tools.
//!
//! Exposes the built-in tool registry over stdio using JSON-RPC 2.0. Logs go
//! to stderr so stdout carries only protocol messages.

use ralph_swarm::config::Config;
use ralph_swarm::mcp::McpServer;
use ralph_swarm::tools::ToolRegistry;
use tokio::io::BufReader;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ralph_swarm=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        "Starting MCP server for tools in {}",
        config.workspace_path.display()
    );

    let server = McpServer::from_config(&config, ToolRegistry::new());
    server
        .serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await?;
    Ok(())
}

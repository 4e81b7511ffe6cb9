//! MCP Server CLI launcher
//!
//! Launches the Model Context Protocol server. The server communicates via
//! stdio using newline-delimited JSON-RPC.

use anyhow::{bail, Result};
use clap::Args;
use quarry_logging::{init_logging, spawn_forwarder, BufferedLogger, ForwardingLayer, LogConfig};
use quarry_mcp::server::DEFAULT_ENDPOINT;
use quarry_mcp::{
    FramedTransport, HttpDetailFetcher, HttpQueryExecutor, McpServer, McpServerConfig,
    ServerContext,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Arguments for the MCP server command
#[derive(Args, Debug)]
pub struct McpArgs {
    /// Base URL of the analytics service
    #[arg(long, env = "QUARRY_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,

    /// Bearer token for the analytics service
    #[arg(long, env = "QUARRY_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Usage hint passed to the client (e.g. which tables exist)
    #[arg(long, env = "QUARRY_DATASET_HINT")]
    pub dataset_hint: Option<String>,

    /// Default query timeout in seconds
    #[arg(long, default_value_t = 60)]
    pub query_timeout_secs: u64,

    /// Maximum tool response size in bytes
    #[arg(long, default_value_t = 1024 * 1024)]
    pub max_response_bytes: usize,

    /// Collection served by the fetch_details tool
    #[arg(long, default_value = "dashboards")]
    pub detail_collection: String,

    /// Concurrent requests for fetch_details
    #[arg(long, default_value_t = 4)]
    pub detail_concurrency: usize,
}

impl McpArgs {
    fn to_config(&self) -> Result<McpServerConfig> {
        if self.detail_concurrency == 0 {
            bail!("--detail-concurrency must be at least 1");
        }
        if self.query_timeout_secs == 0 {
            bail!("--query-timeout-secs must be at least 1");
        }

        Ok(McpServerConfig {
            endpoint: self.endpoint.clone(),
            api_token: self.token.clone(),
            dataset_hint: self.dataset_hint.clone(),
            query_timeout: Duration::from_secs(self.query_timeout_secs),
            max_response_bytes: self.max_response_bytes,
            detail_concurrency: self.detail_concurrency,
            ..McpServerConfig::default()
        })
    }
}

/// Run the MCP server until stdin closes
pub async fn run(args: McpArgs, verbose: bool) -> Result<()> {
    let config = args.to_config()?;

    let (forward, forward_rx) = ForwardingLayer::channel();
    init_logging(LogConfig {
        app_name: "quarry-mcp",
        verbose,
        forward: Some(forward),
    })?;

    // Holds operational logs until the client has initialized
    let logger = Arc::new(BufferedLogger::new());
    let forwarder = spawn_forwarder(forward_rx, Arc::clone(&logger));

    let executor = Arc::new(HttpQueryExecutor::new(
        config.endpoint.clone(),
        config.api_token.clone(),
    ));
    let details = HttpDetailFetcher::new(
        HttpQueryExecutor::new(config.endpoint.clone(), config.api_token.clone()),
        args.detail_collection.clone(),
        config.query_timeout,
    );

    info!("MCP server starting via stdio (endpoint {})", config.endpoint);

    let ctx = ServerContext::new(config, executor, logger).with_details(Arc::new(details));
    let mut server = McpServer::new(ctx);

    let result = server.run(FramedTransport::stdio()).await;
    forwarder.abort();
    result
}

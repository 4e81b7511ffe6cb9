//! Quarry - analytics bridge for AI assistants
//!
//! Usage:
//!   quarry mcp --endpoint https://analytics.example.com --token $TOKEN
//!
//! Stdout is reserved for protocol frames; logs go to stderr and
//! `~/.quarry/logs`.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::future::Future;
use std::process::ExitCode;
use std::time::Duration;
use tokio::runtime::Runtime;

mod cli;

#[derive(Parser, Debug)]
#[command(name = "quarry", version, about = "Analytics bridge for MCP clients")]
struct Cli {
    /// Enable verbose logging (info/debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the MCP server over stdio
    Mcp(cli::mcp::McpArgs),
}

async fn run_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Mcp(args) => cli::mcp::run(args, cli.verbose).await,
    }
}

/// How long shutdown waits for blocking tasks, such as a pending stdin read
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Drive `fut` to completion, then shut the runtime down without waiting on
/// blocking reads that may never return.
fn block_on_and_release<F: Future>(runtime: Runtime, fut: F) -> F::Output {
    let output = runtime.block_on(fut);
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    output
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match block_on_and_release(runtime, run_command(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

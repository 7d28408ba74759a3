//! runner-pool - per-session sandbox container manager.
//!
//! Usage:
//!   runner-pool serve [--port 2000] [--max-sessions 5]   # Start HTTP server
//!   runner-pool purge                                     # Remove leftover containers

use clap::{Parser, Subcommand};
use runner_pool::config::{SandboxConfig, ServeArgs, DEFAULT_CONTAINER_PREFIX};
use runner_pool::error::Error;
use runner_pool::http_server;
use runner_pool::runtime::DockerRuntime;
use runner_pool::sandbox::SandboxManager;
use std::process::exit;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "runner-pool")]
#[command(about = "Per-session sandbox container pool with HTTP API")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve(ServeArgs),
    /// Remove session containers left behind by a crashed run, then exit
    Purge {
        /// Name prefix identifying session containers
        #[arg(long, env = "CONTAINER_PREFIX", default_value = DEFAULT_CONTAINER_PREFIX)]
        container_prefix: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if let Err(e) = run(args.command).await {
        error!(error = %e, "Fatal error");
        eprintln!("Error: {}", e);
        exit(1);
    }
}

async fn run(command: Commands) -> Result<(), Error> {
    match command {
        Commands::Serve(serve) => {
            let config = serve.into_config()?;
            let runtime = Arc::new(DockerRuntime::connect()?);
            http_server::run_server(config, runtime).await
        }
        Commands::Purge { container_prefix } => {
            let runtime = Arc::new(DockerRuntime::connect()?);
            let manager = SandboxManager::new(
                runtime,
                SandboxConfig {
                    container_prefix,
                    ..SandboxConfig::default()
                },
            );
            let purged = manager.purge_stale().await;
            info!(purged, "Purge complete");
            Ok(())
        }
    }
}

//! scribe-server: runs the document sync server.
//!
//! ```text
//! scribe-server [--config scribe.toml] [--bind 0.0.0.0:9090]
//! ```
//!
//! `--bind` (or `SCRIBE_BIND`) overrides the configured bind address. Log
//! verbosity follows `RUST_LOG` (default: info).

use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;

use scribe_sync::{ServerConfig, ServerError, SyncServer};

/// Real-time document sync server.
#[derive(Parser, Debug)]
#[command(name = "scribe-server")]
#[command(version, about, long_about = None)]
struct Cli {
    /// TOML configuration file; defaults are used when omitted
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the configuration file
    #[arg(long, env = "SCRIBE_BIND")]
    bind: Option<String>,
}

impl Cli {
    fn load_config(&self) -> Result<ServerConfig, ServerError> {
        let mut config = match &self.config {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                ServerConfig::from_file(path)?
            }
            None => ServerConfig::default(),
        };
        if let Some(bind) = &self.bind {
            config.bind_addr = bind.clone();
        }
        Ok(config)
    }
}

async fn run(cli: Cli) -> Result<(), ServerError> {
    let config = cli.load_config()?;
    let server = SyncServer::from_config(config)?;
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    let stats = server.stats().await;
    info!(
        "Served {} connections, accepted {} operations ({} conflicts)",
        stats.total_connections, stats.accepted_operations, stats.conflicts
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting scribe-server...");
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

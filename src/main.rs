use anyhow::Result;
use clap::{Parser, Subcommand};
use droprelay::catalog::NoopCatalog;
use droprelay::common::BrokerConfig;
use droprelay::server::{self, BrokerState};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "droprelay")]
#[command(about = "Resumable file transfer broker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker
    Serve {
        /// Path to a TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the configured bind host
        #[arg(long)]
        host: Option<String>,

        /// Override the configured bind port
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("droprelay=info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config, host, port } => {
            let mut config = BrokerConfig::load(config.as_deref())?;
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }

            let listener = server::bind(&config).await?;
            let state = BrokerState::new(config, Arc::new(NoopCatalog::new()))?;
            server::run(listener, state).await
        }
    }
}

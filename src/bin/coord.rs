//! Coordinator binary

use clap::{Parser, Subcommand};
use pgmon::{Config, Coordinator};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "pgmon-coord")]
#[command(about = "pgmon coordinator: PG map, node liveness and cluster health")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start coordinator server
    Serve {
        /// Replica ID (overrides the config file)
        #[arg(long)]
        id: Option<String>,

        /// Bind address for HTTP (overrides the config file)
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print the effective configuration and exit
    CheckConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { id, bind, config } => {
            // File and environment first, CLI flags win
            let mut config = Config::load(config.as_deref())?;
            if let Some(id) = id {
                config.node_id = id;
            }
            if let Some(bind) = bind {
                config.coordinator.bind_addr = bind;
            }

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| config.log_level.clone().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            Coordinator::new(config).serve().await?;
        }

        Commands::CheckConfig { config } => {
            let config = Config::load(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

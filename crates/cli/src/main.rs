//! parley CLI: the main entry point.
//!
//! Commands:
//! - `serve`: Start the HTTP/WebSocket server with the demo agent
//! - `config`: Print, show or validate configuration

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod demo;

#[derive(Parser)]
#[command(
    name = "parley",
    about = "parley: real-time conversational agent runtime",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the config file (default: ./parley.toml)
    #[arg(short, long, global = true, env = "PARLEY_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: Option<commands::config_cmd::ConfigAction>,
    },
}

fn init_tracing(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port } => {
            let config = parley_config::AppConfig::load(cli.config.as_deref())
                .map_err(|e| format!("Failed to load config: {e}"))?;
            let level = if cli.verbose {
                "debug"
            } else {
                config.log.level.as_str()
            };
            init_tracing(level, config.log.json);
            commands::serve::run(config, port).await?
        }
        Commands::Config { action } => {
            init_tracing(if cli.verbose { "debug" } else { "warn" }, false);
            commands::config_cmd::run(action, cli.config.as_deref())?
        }
    }

    Ok(())
}

#![deny(unsafe_code)]

//! uprelay command line: runs the push server or the relay.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use uprelay_config::AppConfig;
use uprelay_core::{ConnectorRegistry, Daemon, LoggingConnector};

/// uprelay: a UnifiedPush-style push server and relay.
#[derive(Parser)]
#[command(name = "uprelay", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "uprelay.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the push server.
    Server,

    /// Run the distributor and delivery listener against `distributor.server_url`.
    Relay,

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, from_file) = load_config(&cli.config).await?;

    let level = match cli.verbose {
        0 => config.logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    if !from_file {
        info!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    match cli.command {
        Commands::Server => cmd_server(config).await,
        Commands::Relay => cmd_relay(config).await,
        Commands::Config { show } => cmd_config(&cli.config, &config, show),
    }
}

async fn cmd_server(config: AppConfig) -> Result<()> {
    let daemon = Daemon::new(config);
    daemon.run_server().await?;
    Ok(())
}

async fn cmd_relay(config: AppConfig) -> Result<()> {
    // No IPC bus here: every consumer callback is logged.
    let resolver = Arc::new(ConnectorRegistry::with_fallback(Arc::new(LoggingConnector)));
    let daemon = Daemon::new(config);
    daemon.run_relay(resolver).await?;
    Ok(())
}

fn cmd_config(path: &Path, config: &AppConfig, show: bool) -> Result<()> {
    if show {
        let toml_str = toml::to_string_pretty(config).context("serializing configuration")?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", path.display());
    }
    Ok(())
}

/// Load `path`, or defaults if it does not exist. The flag reports which.
async fn load_config(path: &Path) -> Result<(AppConfig, bool)> {
    if path.exists() {
        let config = AppConfig::load(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((AppConfig::default(), false))
    }
}

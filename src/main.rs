//! helix-proxy - Credential-hiding caching proxy for the Twitch Helix API
//!
//! Callers hit `/api/<path>`; the proxy attaches an app access token obtained
//! with the server-side client secret and relays the upstream JSON.

mod auth;
mod config;
mod error;
mod gateway;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "helix-proxy")]
#[command(about = "Credential-hiding caching proxy for the Twitch Helix API", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to config.toml (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy server
    Serve,

    /// Show the state of the shared app access token
    Status,

    /// Request a new app access token and store it
    Refresh,

    /// Clear the stored app access token
    Logout,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve => {
            tracing::info!("Starting proxy...");
            gateway::serve(&config).await?;
        }
        Commands::Status => {
            let manager = token_manager(&config).await?;
            auth::status(&manager).await?;
        }
        Commands::Refresh => {
            tracing::info!("Requesting app access token...");
            let manager = token_manager(&config).await?;
            auth::refresh(&manager).await?;
        }
        Commands::Logout => {
            let manager = token_manager(&config).await?;
            auth::logout(&manager).await?;
        }
    }

    Ok(())
}

async fn token_manager(config: &Config) -> Result<auth::TokenManager> {
    let store = auth::CredentialStore::new(gateway::open_store(config).await?);
    Ok(auth::TokenManager::new(config.credentials()?, store)
        .with_refresh_margin(config.upstream.refresh_margin_secs))
}

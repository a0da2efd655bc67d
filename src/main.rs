//! Futures Ingest CLI
//!
//! Provides commands for:
//! - `backfill`: Sweep a historical window into the store
//! - `serve`: Run the live ingestion service

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use futures_ingest::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("futures_ingest=info".parse()?))
        .init();

    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Execute command
    match cli.command {
        Commands::Backfill(args) => {
            futures_ingest::cli::backfill::execute(args).await?;
        }
        Commands::Serve(args) => {
            futures_ingest::cli::serve::execute(args).await?;
        }
    }

    Ok(())
}

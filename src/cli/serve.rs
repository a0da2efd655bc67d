//! Serve command
//!
//! Starts the live ingestion service for the configured symbols and runs
//! until interrupted. Failures inside the loops are logged and retried
//! indefinitely; only configuration errors abort startup.

use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use tracing::info;

use crate::config::Settings;
use crate::ingest::IngestionService;
use crate::provider::binance::{BinanceAggTradeStream, BinanceFuturesRestClient};

use super::build_store;

/// Arguments for the serve command
#[derive(Args)]
pub struct ServeArgs {
    /// Symbols to ingest (comma-separated, overrides configuration)
    #[arg(long, short, value_delimiter = ',')]
    pub symbols: Vec<String>,

    /// Data directory override for the file store
    #[arg(long)]
    pub data_dir: Option<String>,
}

/// Execute the serve command
pub async fn execute(args: ServeArgs) -> Result<()> {
    let mut settings = Settings::load().unwrap_or_else(|_| Settings::default_settings());
    if !args.symbols.is_empty() {
        settings.ingestion.symbols = args.symbols.clone();
    }

    let use_database = settings.database.is_some();
    let store = build_store(&settings, args.data_dir.as_deref(), use_database).await?;
    let client = Arc::new(BinanceFuturesRestClient::new(&settings.binance)?);
    let streamer = Arc::new(BinanceAggTradeStream::new(&settings.binance));

    let service = IngestionService::new(client, streamer, store, settings.ingestion.clone())?;
    service.start()?;
    info!(
        symbols = ?settings.ingestion.symbols,
        backend = if use_database { "timescale" } else { "jsonl" },
        "live ingestion running, press ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    service.stop().await;
    Ok(())
}

//! Backfill command
//!
//! Runs a bounded historical sweep for one symbol and prints the per-kind
//! report. Exits non-zero on the first unrecoverable error.

use anyhow::Result;
use clap::Args;
use tracing::info;

use crate::backfill::{format_epoch_ms, BackfillConfig, BackfillJob, BackfillReport};
use crate::config::Settings;
use crate::provider::binance::BinanceFuturesRestClient;

use super::{build_store, parse_time};

/// Arguments for the backfill command
#[derive(Args)]
pub struct BackfillArgs {
    /// Symbol to backfill
    #[arg(long, short)]
    pub symbol: String,

    /// Window start (YYYY-MM-DD or RFC 3339)
    #[arg(long)]
    pub start: String,

    /// Window end (YYYY-MM-DD or RFC 3339)
    #[arg(long)]
    pub end: String,

    /// Candle interval
    #[arg(long, default_value = "1m")]
    pub interval: String,

    /// Ignore existing data and sweep from the window start
    #[arg(long)]
    pub no_resume: bool,

    /// Skip candle ingestion
    #[arg(long)]
    pub skip_candles: bool,

    /// Skip aggregate trade ingestion
    #[arg(long)]
    pub skip_trades: bool,

    /// Skip open-interest ingestion
    #[arg(long)]
    pub skip_open_interest: bool,

    /// Skip funding-rate ingestion
    #[arg(long)]
    pub skip_funding: bool,

    /// Data directory override for the file store
    #[arg(long)]
    pub data_dir: Option<String>,

    /// Write to the configured database instead of JSONL files
    #[arg(long)]
    pub database: bool,
}

/// Execute the backfill command
pub async fn execute(args: BackfillArgs) -> Result<()> {
    let settings = Settings::load().unwrap_or_else(|_| Settings::default_settings());

    let start = parse_time(&args.start, false)?;
    let end = parse_time(&args.end, true)?;

    let mut config = BackfillConfig::new(args.symbol.clone(), start, end)
        .with_interval(args.interval.clone())
        .with_resume(!args.no_resume);
    config.include_candles = !args.skip_candles;
    config.include_trades = !args.skip_trades;
    config.include_open_interest = !args.skip_open_interest;
    config.include_funding = !args.skip_funding;

    let store = build_store(&settings, args.data_dir.as_deref(), args.database).await?;
    let client = BinanceFuturesRestClient::new(&settings.binance)?;
    let job = BackfillJob::new(client, store);

    info!(symbol = %args.symbol, %start, %end, "running backfill");
    let report = job.run(&config).await?;
    print_report(&args.symbol, &report);

    for (kind, summary) in job.metrics().summary() {
        info!(
            %kind,
            batches = summary.batches,
            records = summary.records,
            records_per_second = summary.records_per_second,
            "ingestion pacing"
        );
    }

    Ok(())
}

fn print_report(symbol: &str, report: &BackfillReport) {
    println!();
    println!("=== Backfill Report ===");
    println!();
    println!("Symbol:   {}", symbol);
    println!(
        "Started:  {}",
        report.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!(
        "Finished: {} ({}s)",
        report.completed_at.format("%Y-%m-%d %H:%M:%S UTC"),
        report.duration().num_seconds()
    );
    println!();

    for (kind, totals) in &report.totals {
        println!(
            "{:<14} batches={:<5} fetched={:<8} inserted={:<8} updated={:<6} unchanged={}",
            kind.to_string(),
            totals.batches,
            totals.fetched,
            totals.inserted,
            totals.updated,
            totals.unchanged
        );
        if let (Some(earliest), Some(latest)) = (
            format_epoch_ms(totals.earliest_key),
            format_epoch_ms(totals.latest_key),
        ) {
            println!("{:<14} range: {} .. {}", "", earliest, latest);
        }
    }
    println!();
}

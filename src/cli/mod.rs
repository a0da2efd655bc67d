//! Command-line interface
//!
//! Two commands: `backfill` runs a bounded historical sweep and exits;
//! `serve` runs the live ingestion service until interrupted.

pub mod backfill;
pub mod serve;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};

use crate::config::Settings;
use crate::storage::{JsonlStore, MarketStore, TimescaleStore};

/// Futures market data ingestion CLI
#[derive(Parser)]
#[command(name = "futures-ingest")]
#[command(about = "Binance futures market data ingestion and backfill")]
#[command(version)]
pub struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Backfill a historical window into the store
    Backfill(backfill::BackfillArgs),
    /// Run the live ingestion service
    Serve(serve::ServeArgs),
}

/// Pick the storage backend: TimescaleDB when requested and configured,
/// JSONL files otherwise
pub(crate) async fn build_store(
    settings: &Settings,
    data_dir: Option<&str>,
    use_database: bool,
) -> Result<Arc<dyn MarketStore>> {
    if use_database {
        let database = settings
            .database
            .as_ref()
            .ok_or_else(|| anyhow!("database.url is not configured"))?;
        let store = TimescaleStore::connect(database, settings.storage.batch_insert_size).await?;
        store.run_migrations().await?;
        Ok(Arc::new(store))
    } else {
        let dir = data_dir.unwrap_or(&settings.storage.data_dir);
        Ok(Arc::new(JsonlStore::new(dir)))
    }
}

/// Parse a CLI timestamp: a date (`YYYY-MM-DD`) or a full RFC 3339 instant
pub(crate) fn parse_time(value: &str, end_of_day: bool) -> Result<DateTime<Utc>> {
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        let time = if end_of_day {
            date.and_hms_opt(23, 59, 59)
        } else {
            date.and_hms_opt(0, 0, 0)
        };
        return time
            .map(|t| t.and_utc())
            .ok_or_else(|| anyhow!("invalid date: {value}"));
    }
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid time {value}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_parse_date_expands_to_day_bounds() {
        let start = parse_time("2024-01-15", false).unwrap();
        assert_eq!(start.hour(), 0);
        let end = parse_time("2024-01-15", true).unwrap();
        assert_eq!(end.hour(), 23);
        assert_eq!(end.minute(), 59);
        assert!(end > start);
    }

    #[test]
    fn test_parse_rfc3339_instant() {
        let ts = parse_time("2024-01-15T12:30:00Z", false).unwrap();
        assert_eq!(ts.hour(), 12);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_time("yesterday", false).is_err());
    }
}

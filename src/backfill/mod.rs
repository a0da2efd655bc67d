//! Historical backfill
//!
//! Configuration, reporting, and pacing metrics for bounded backfill runs.
//! The sweep itself lives in [`job::BackfillJob`].

pub mod job;

pub use job::BackfillJob;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;

use crate::config::ConfigError;
use crate::provider::RestError;
use crate::schema::DataKind;
use crate::storage::{StorageError, UpsertStats};

/// Backfill failures
///
/// Configuration errors surface before any I/O; REST and storage errors stop
/// the run and report the first unrecoverable failure.
#[derive(Error, Debug)]
pub enum BackfillError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("rest error: {0}")]
    Rest(#[from] RestError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Configuration for one backfill run
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    pub symbol: String,
    /// Window start (inclusive)
    pub start: DateTime<Utc>,
    /// Window end (inclusive)
    pub end: DateTime<Utc>,
    /// Candle interval, e.g. "1m"
    pub interval: String,
    /// Continue from the highest persisted key instead of the window start
    pub resume: bool,
    pub include_candles: bool,
    pub include_trades: bool,
    pub include_open_interest: bool,
    pub include_funding: bool,
    pub candle_limit: usize,
    pub trade_limit: usize,
    pub open_interest_limit: usize,
    pub funding_limit: usize,
    /// Open-interest sampling period, e.g. "5m"
    pub open_interest_period: String,
}

impl BackfillConfig {
    pub fn new(symbol: impl Into<String>, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            start,
            end,
            interval: "1m".to_string(),
            resume: true,
            include_candles: true,
            include_trades: true,
            include_open_interest: true,
            include_funding: true,
            candle_limit: 1200,
            trade_limit: 1000,
            open_interest_limit: 500,
            funding_limit: 1000,
            open_interest_period: "5m".to_string(),
        }
    }

    pub fn with_interval(mut self, interval: impl Into<String>) -> Self {
        self.interval = interval.into();
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Validate before any I/O
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbol.trim().is_empty() {
            return Err(ConfigError::NoSymbols);
        }
        if self.end <= self.start {
            return Err(ConfigError::InvalidWindow);
        }
        for (name, limit) in [
            ("candle limit", self.candle_limit),
            ("trade limit", self.trade_limit),
            ("open interest limit", self.open_interest_limit),
            ("funding limit", self.funding_limit),
        ] {
            if limit == 0 {
                return Err(ConfigError::NonPositive(name));
            }
        }
        interval_to_ms(&self.interval)?;
        interval_to_ms(&self.open_interest_period)?;
        Ok(())
    }
}

/// Summary statistics for one data kind across a run
#[derive(Debug, Clone)]
pub struct DataTypeReport {
    pub kind: DataKind,
    pub batches: usize,
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub earliest_key: Option<i64>,
    pub latest_key: Option<i64>,
}

impl DataTypeReport {
    pub fn new(kind: DataKind) -> Self {
        Self {
            kind,
            batches: 0,
            fetched: 0,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            earliest_key: None,
            latest_key: None,
        }
    }

    /// Fold one persisted batch into the totals
    pub fn record_batch(
        &mut self,
        count: usize,
        stats: UpsertStats,
        first_key: i64,
        last_key: i64,
    ) {
        if count == 0 {
            return;
        }
        self.batches += 1;
        self.fetched += count;
        self.inserted += stats.inserted;
        self.updated += stats.updated;
        self.unchanged += stats.unchanged;
        if self.earliest_key.is_none_or(|k| first_key < k) {
            self.earliest_key = Some(first_key);
        }
        if self.latest_key.is_none_or(|k| last_key > k) {
            self.latest_key = Some(last_key);
        }
    }
}

/// Aggregated report for one backfill run
#[derive(Debug, Clone)]
pub struct BackfillReport {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub totals: BTreeMap<DataKind, DataTypeReport>,
}

impl BackfillReport {
    pub fn duration(&self) -> chrono::Duration {
        self.completed_at - self.started_at
    }
}

/// Pacing metrics collected during a backfill run
#[derive(Default)]
pub struct IngestionMetrics {
    inner: Mutex<BTreeMap<DataKind, KindMetrics>>,
}

#[derive(Debug, Clone, Copy, Default)]
struct KindMetrics {
    batches: usize,
    records: usize,
    inserted: usize,
    updated: usize,
    elapsed: Duration,
}

/// Per-kind pacing summary
#[derive(Debug, Clone, PartialEq)]
pub struct KindSummary {
    pub batches: usize,
    pub records: usize,
    pub inserted: usize,
    pub updated: usize,
    pub duration_secs: f64,
    pub records_per_second: f64,
}

impl IngestionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one fetched-and-persisted batch
    pub fn observe(&self, kind: DataKind, batch_size: usize, stats: UpsertStats, elapsed: Duration) {
        let mut guard = self.inner.lock();
        let entry = guard.entry(kind).or_default();
        entry.batches += 1;
        entry.records += batch_size;
        entry.inserted += stats.inserted;
        entry.updated += stats.updated;
        entry.elapsed += elapsed;
    }

    pub fn summary(&self) -> BTreeMap<DataKind, KindSummary> {
        self.inner
            .lock()
            .iter()
            .map(|(kind, m)| {
                let secs = m.elapsed.as_secs_f64();
                let throughput = if secs > 0.0 { m.records as f64 / secs } else { 0.0 };
                (
                    *kind,
                    KindSummary {
                        batches: m.batches,
                        records: m.records,
                        inserted: m.inserted,
                        updated: m.updated,
                        duration_secs: secs,
                        records_per_second: throughput,
                    },
                )
            })
            .collect()
    }
}

/// Parse an interval like "1m", "4h", "7d" into milliseconds
pub fn interval_to_ms(interval: &str) -> Result<i64, ConfigError> {
    let unsupported = || ConfigError::UnsupportedInterval(interval.to_string());
    let unit = interval.chars().next_back().ok_or_else(unsupported)?;
    let magnitude: i64 = interval[..interval.len() - unit.len_utf8()]
        .parse()
        .map_err(|_| unsupported())?;
    if magnitude <= 0 {
        return Err(unsupported());
    }
    let unit_ms = match unit {
        's' => 1_000,
        'm' => 60 * 1_000,
        'h' => 60 * 60 * 1_000,
        'd' => 24 * 60 * 60 * 1_000,
        'w' => 7 * 24 * 60 * 60 * 1_000,
        _ => return Err(unsupported()),
    };
    Ok(magnitude * unit_ms)
}

/// Render an epoch-ms key as an RFC 3339 timestamp for logs and reports
pub fn format_epoch_ms(value: Option<i64>) -> Option<String> {
    value
        .and_then(DateTime::from_timestamp_millis)
        .map(|ts| ts.to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (start, start + chrono::Duration::minutes(5))
    }

    #[test]
    fn test_config_validation() {
        let (start, end) = window();
        assert!(BackfillConfig::new("BTCUSDT", start, end).validate().is_ok());
        assert!(matches!(
            BackfillConfig::new("BTCUSDT", end, start).validate(),
            Err(ConfigError::InvalidWindow)
        ));
        assert!(BackfillConfig::new("", start, end).validate().is_err());

        let mut config = BackfillConfig::new("BTCUSDT", start, end);
        config.trade_limit = 0;
        assert!(config.validate().is_err());

        let config = BackfillConfig::new("BTCUSDT", start, end).with_interval("1x");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_interval_to_ms() {
        assert_eq!(interval_to_ms("1s").unwrap(), 1_000);
        assert_eq!(interval_to_ms("1m").unwrap(), 60_000);
        assert_eq!(interval_to_ms("5m").unwrap(), 300_000);
        assert_eq!(interval_to_ms("4h").unwrap(), 14_400_000);
        assert_eq!(interval_to_ms("1d").unwrap(), 86_400_000);
        assert_eq!(interval_to_ms("1w").unwrap(), 604_800_000);
        assert!(interval_to_ms("m").is_err());
        assert!(interval_to_ms("0m").is_err());
        assert!(interval_to_ms("5y").is_err());
    }

    #[test]
    fn test_report_tracks_key_range() {
        let mut report = DataTypeReport::new(DataKind::Candles);
        report.record_batch(
            2,
            UpsertStats {
                inserted: 2,
                ..Default::default()
            },
            2_000,
            3_000,
        );
        report.record_batch(
            1,
            UpsertStats {
                inserted: 1,
                ..Default::default()
            },
            1_000,
            1_000,
        );
        assert_eq!(report.batches, 2);
        assert_eq!(report.fetched, 3);
        assert_eq!(report.inserted, 3);
        assert_eq!(report.earliest_key, Some(1_000));
        assert_eq!(report.latest_key, Some(3_000));

        // Empty batches leave the report untouched.
        report.record_batch(0, UpsertStats::default(), 9_000, 9_000);
        assert_eq!(report.batches, 2);
    }

    #[test]
    fn test_metrics_summary_throughput() {
        let metrics = IngestionMetrics::new();
        metrics.observe(
            DataKind::Candles,
            10,
            UpsertStats {
                inserted: 10,
                ..Default::default()
            },
            Duration::from_secs(2),
        );
        metrics.observe(
            DataKind::Candles,
            10,
            UpsertStats {
                inserted: 5,
                updated: 5,
                ..Default::default()
            },
            Duration::from_secs(2),
        );
        let summary = metrics.summary();
        let candles = &summary[&DataKind::Candles];
        assert_eq!(candles.batches, 2);
        assert_eq!(candles.records, 20);
        assert_eq!(candles.inserted, 15);
        assert_eq!(candles.records_per_second, 5.0);
    }

    #[test]
    fn test_format_epoch_ms() {
        assert_eq!(format_epoch_ms(None), None);
        let rendered = format_epoch_ms(Some(1_700_000_000_000)).unwrap();
        assert!(rendered.starts_with("2023-11-14T22:13:20"));
    }
}

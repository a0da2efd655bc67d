//! Market data storage
//!
//! The [`MarketStore`] trait is the single persistence contract consumed by
//! the backfill job, the live ingestion service, and downstream readers.
//! Three implementations: JSONL files ([`jsonl::JsonlStore`]), TimescaleDB
//! ([`timescale::TimescaleStore`]), and an in-memory double
//! ([`memory::MemoryStore`]). Business logic depends only on the trait.

pub mod jsonl;
pub mod memory;
pub mod timescale;

pub use jsonl::JsonlStore;
pub use memory::MemoryStore;
pub use timescale::TimescaleStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::schema::{AggTrade, Candle, FundingRate, OpenInterestSample};

/// Storage errors
///
/// Fatal for the operation that hit them: a backfill run stops and reports,
/// a live loop treats one as a retryable iteration failure.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt dataset {path} at line {line}: {source}")]
    Corrupt {
        path: String,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Outcome counters for one idempotent upsert batch
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpsertStats {
    /// New natural keys
    pub inserted: usize,
    /// Existing keys whose values changed
    pub updated: usize,
    /// Existing keys re-ingested with identical values
    pub unchanged: usize,
}

impl UpsertStats {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }

    pub fn merge(&mut self, other: UpsertStats) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
    }
}

/// Idempotent, per-kind market data store
///
/// Natural keys are unique per (symbol, kind); upserts insert new keys,
/// replace changed values in place, and leave identical records untouched.
/// `fetch_latest_*` returns the newest `limit` records in ascending key
/// order; this is the read surface downstream consumers use.
#[async_trait]
pub trait MarketStore: Send + Sync {
    /// Highest persisted candle open_time for the symbol
    async fn latest_candle_open_time(&self, symbol: &str) -> StorageResult<Option<i64>>;

    /// Highest persisted aggregate trade id for the symbol
    async fn latest_trade_id(&self, symbol: &str) -> StorageResult<Option<i64>>;

    /// Highest persisted open-interest sample timestamp for the symbol
    async fn latest_open_interest_timestamp(&self, symbol: &str) -> StorageResult<Option<i64>>;

    /// Highest persisted funding time for the symbol
    async fn latest_funding_time(&self, symbol: &str) -> StorageResult<Option<i64>>;

    async fn upsert_candles(&self, symbol: &str, rows: &[Candle]) -> StorageResult<UpsertStats>;

    async fn upsert_trades(&self, symbol: &str, rows: &[AggTrade]) -> StorageResult<UpsertStats>;

    async fn upsert_open_interest(
        &self,
        symbol: &str,
        rows: &[OpenInterestSample],
    ) -> StorageResult<UpsertStats>;

    async fn upsert_funding_rates(
        &self,
        symbol: &str,
        rows: &[FundingRate],
    ) -> StorageResult<UpsertStats>;

    async fn fetch_latest_candles(&self, symbol: &str, limit: usize)
        -> StorageResult<Vec<Candle>>;

    async fn fetch_latest_trades(
        &self,
        symbol: &str,
        limit: usize,
    ) -> StorageResult<Vec<AggTrade>>;

    async fn fetch_latest_open_interest(
        &self,
        symbol: &str,
        limit: usize,
    ) -> StorageResult<Vec<OpenInterestSample>>;

    async fn fetch_latest_funding(
        &self,
        symbol: &str,
        limit: usize,
    ) -> StorageResult<Vec<FundingRate>>;

    /// Make every pending change durable
    ///
    /// The JSONL store rewrites dirty datasets atomically; the database and
    /// memory stores are already durable per upsert and return immediately.
    async fn flush(&self) -> StorageResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_stats_total_and_merge() {
        let mut stats = UpsertStats {
            inserted: 2,
            updated: 1,
            unchanged: 3,
        };
        assert_eq!(stats.total(), 6);
        stats.merge(UpsertStats {
            inserted: 1,
            updated: 0,
            unchanged: 2,
        });
        assert_eq!(stats.inserted, 3);
        assert_eq!(stats.unchanged, 5);
        assert_eq!(stats.total(), 9);
    }
}

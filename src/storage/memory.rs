//! In-memory market store
//!
//! Implements the identical [`MarketStore`] contract without any persistence.
//! Used by tests and by environments without durable storage.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::schema::{AggTrade, Candle, FundingRate, KeyedRecord, OpenInterestSample};
use crate::storage::{MarketStore, StorageResult, UpsertStats};

type Shelf<T> = RwLock<HashMap<String, BTreeMap<i64, T>>>;

/// Nested-map store: symbol -> natural key -> record, per kind
#[derive(Default)]
pub struct MemoryStore {
    candles: Shelf<Candle>,
    trades: Shelf<AggTrade>,
    open_interest: Shelf<OpenInterestSample>,
    funding: Shelf<FundingRate>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn upsert_into<T: KeyedRecord>(shelf: &Shelf<T>, symbol: &str, rows: &[T]) -> UpsertStats {
    let mut stats = UpsertStats::default();
    if rows.is_empty() {
        return stats;
    }
    let mut guard = shelf.write();
    let bucket = guard.entry(symbol.to_uppercase()).or_default();
    for row in rows {
        match bucket.get(&row.key()) {
            Some(existing) if existing == row => stats.unchanged += 1,
            Some(_) => {
                bucket.insert(row.key(), row.clone());
                stats.updated += 1;
            }
            None => {
                bucket.insert(row.key(), row.clone());
                stats.inserted += 1;
            }
        }
    }
    stats
}

fn max_key<T>(shelf: &Shelf<T>, symbol: &str) -> Option<i64> {
    shelf
        .read()
        .get(&symbol.to_uppercase())
        .and_then(|bucket| bucket.keys().next_back().copied())
}

fn newest<T: Clone>(shelf: &Shelf<T>, symbol: &str, limit: usize) -> Vec<T> {
    if limit == 0 {
        return Vec::new();
    }
    let guard = shelf.read();
    let Some(bucket) = guard.get(&symbol.to_uppercase()) else {
        return Vec::new();
    };
    let mut rows: Vec<T> = bucket.values().rev().take(limit).cloned().collect();
    rows.reverse();
    rows
}

#[async_trait]
impl MarketStore for MemoryStore {
    async fn latest_candle_open_time(&self, symbol: &str) -> StorageResult<Option<i64>> {
        Ok(max_key(&self.candles, symbol))
    }

    async fn latest_trade_id(&self, symbol: &str) -> StorageResult<Option<i64>> {
        Ok(max_key(&self.trades, symbol))
    }

    async fn latest_open_interest_timestamp(&self, symbol: &str) -> StorageResult<Option<i64>> {
        Ok(max_key(&self.open_interest, symbol))
    }

    async fn latest_funding_time(&self, symbol: &str) -> StorageResult<Option<i64>> {
        Ok(max_key(&self.funding, symbol))
    }

    async fn upsert_candles(&self, symbol: &str, rows: &[Candle]) -> StorageResult<UpsertStats> {
        Ok(upsert_into(&self.candles, symbol, rows))
    }

    async fn upsert_trades(&self, symbol: &str, rows: &[AggTrade]) -> StorageResult<UpsertStats> {
        Ok(upsert_into(&self.trades, symbol, rows))
    }

    async fn upsert_open_interest(
        &self,
        symbol: &str,
        rows: &[OpenInterestSample],
    ) -> StorageResult<UpsertStats> {
        Ok(upsert_into(&self.open_interest, symbol, rows))
    }

    async fn upsert_funding_rates(
        &self,
        symbol: &str,
        rows: &[FundingRate],
    ) -> StorageResult<UpsertStats> {
        Ok(upsert_into(&self.funding, symbol, rows))
    }

    async fn fetch_latest_candles(
        &self,
        symbol: &str,
        limit: usize,
    ) -> StorageResult<Vec<Candle>> {
        Ok(newest(&self.candles, symbol, limit))
    }

    async fn fetch_latest_trades(
        &self,
        symbol: &str,
        limit: usize,
    ) -> StorageResult<Vec<AggTrade>> {
        Ok(newest(&self.trades, symbol, limit))
    }

    async fn fetch_latest_open_interest(
        &self,
        symbol: &str,
        limit: usize,
    ) -> StorageResult<Vec<OpenInterestSample>> {
        Ok(newest(&self.open_interest, symbol, limit))
    }

    async fn fetch_latest_funding(
        &self,
        symbol: &str,
        limit: usize,
    ) -> StorageResult<Vec<FundingRate>> {
        Ok(newest(&self.funding, symbol, limit))
    }

    async fn flush(&self) -> StorageResult<()> {
        Ok(())
    }
}

//! TimescaleDB market store
//!
//! One table per data kind, primary-keyed by (symbol, natural key) with
//! BIGINT epoch-millisecond keys. Upserts run as a single batched
//! insert-or-update statement per chunk; the `IS DISTINCT FROM` guard keeps
//! unchanged rows untouched so `UpsertStats` matches the file store's
//! accounting, with `RETURNING (xmax = 0)` splitting inserts from updates.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::DatabaseSettings;
use crate::schema::{AggTrade, Candle, FundingRate, OpenInterestSample};
use crate::storage::{MarketStore, StorageResult, UpsertStats};

const CANDLES_TABLE: &str = "binance_futures_candles";
const TRADES_TABLE: &str = "binance_futures_agg_trades";
const OPEN_INTEREST_TABLE: &str = "binance_futures_open_interest";
const FUNDING_TABLE: &str = "binance_futures_funding";

/// TimescaleDB-backed market store
pub struct TimescaleStore {
    pool: PgPool,
    batch_size: usize,
}

impl TimescaleStore {
    /// Create a store over an existing pool
    pub fn new(pool: PgPool, batch_size: usize) -> Self {
        Self {
            pool,
            batch_size: batch_size.max(1),
        }
    }

    /// Connect a new pool from settings
    pub async fn connect(settings: &DatabaseSettings, batch_size: usize) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&settings.url)
            .await?;
        Ok(Self::new(pool, batch_size))
    }

    /// Get the database pool reference
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and attempt hypertable conversion
    ///
    /// Table creation is strict; the TimescaleDB extension and hypertable
    /// steps tolerate plain PostgreSQL so the store still works without the
    /// extension installed.
    pub async fn run_migrations(&self) -> StorageResult<()> {
        info!("running market data migrations");

        if let Err(err) = sqlx::query("CREATE EXTENSION IF NOT EXISTS timescaledb CASCADE")
            .execute(&self.pool)
            .await
        {
            warn!(error = %err, "timescaledb extension unavailable, continuing with plain tables");
        }

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                symbol VARCHAR(32) NOT NULL,
                open_time BIGINT NOT NULL,
                close_time BIGINT NOT NULL,
                open NUMERIC(18, 8) NOT NULL,
                high NUMERIC(18, 8) NOT NULL,
                low NUMERIC(18, 8) NOT NULL,
                close NUMERIC(18, 8) NOT NULL,
                volume NUMERIC(24, 8) NOT NULL,
                quote_volume NUMERIC(24, 8) NOT NULL,
                trade_count BIGINT NOT NULL,
                taker_buy_volume NUMERIC(24, 8) NOT NULL,
                taker_buy_quote_volume NUMERIC(24, 8) NOT NULL,
                PRIMARY KEY (symbol, open_time)
            )
            "#,
            CANDLES_TABLE
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                symbol VARCHAR(32) NOT NULL,
                agg_trade_id BIGINT NOT NULL,
                price NUMERIC(18, 8) NOT NULL,
                quantity NUMERIC(18, 8) NOT NULL,
                first_trade_id BIGINT NOT NULL,
                last_trade_id BIGINT NOT NULL,
                trade_timestamp BIGINT NOT NULL,
                is_buyer_maker BOOLEAN NOT NULL,
                PRIMARY KEY (symbol, agg_trade_id)
            )
            "#,
            TRADES_TABLE
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                symbol VARCHAR(32) NOT NULL,
                observation_time BIGINT NOT NULL,
                sum_open_interest NUMERIC(28, 8) NOT NULL,
                sum_open_interest_value NUMERIC(28, 8) NOT NULL,
                PRIMARY KEY (symbol, observation_time)
            )
            "#,
            OPEN_INTEREST_TABLE
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                symbol VARCHAR(32) NOT NULL,
                funding_time BIGINT NOT NULL,
                funding_rate NUMERIC(12, 10) NOT NULL,
                mark_price NUMERIC(18, 8) NOT NULL,
                index_price NUMERIC(18, 8) NOT NULL,
                PRIMARY KEY (symbol, funding_time)
            )
            "#,
            FUNDING_TABLE
        ))
        .execute(&self.pool)
        .await?;

        // Seven-day chunks expressed in epoch milliseconds.
        const CHUNK_INTERVAL_MS: i64 = 7 * 24 * 60 * 60 * 1000;
        for (table, key) in [
            (CANDLES_TABLE, "open_time"),
            (TRADES_TABLE, "agg_trade_id"),
            (OPEN_INTEREST_TABLE, "observation_time"),
            (FUNDING_TABLE, "funding_time"),
        ] {
            let result = sqlx::query(&format!(
                "SELECT create_hypertable('{}', '{}', chunk_time_interval => {}, if_not_exists => TRUE)",
                table, key, CHUNK_INTERVAL_MS
            ))
            .execute(&self.pool)
            .await;
            match result {
                Ok(_) => debug!(table, "hypertable ready"),
                Err(err) => {
                    if err.to_string().contains("already a hypertable") {
                        debug!(table, "already a hypertable");
                    } else {
                        warn!(table, error = %err, "hypertable conversion skipped");
                    }
                }
            }
        }

        info!("market data migrations completed");
        Ok(())
    }

    async fn latest_key(&self, table: &str, key: &str, symbol: &str) -> StorageResult<Option<i64>> {
        let row = sqlx::query(&format!(
            "SELECT MAX({}) AS latest_key FROM {} WHERE symbol = $1",
            key, table
        ))
        .bind(symbol.to_uppercase())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("latest_key"))
    }
}

/// `($1, $2, ...), ($n, ...)` placeholder clause for a multi-row insert
fn values_clause(rows: usize, cols: usize) -> String {
    let mut clause = String::new();
    let mut param = 1;
    for row in 0..rows {
        if row > 0 {
            clause.push_str(", ");
        }
        clause.push('(');
        for col in 0..cols {
            if col > 0 {
                clause.push_str(", ");
            }
            clause.push('$');
            clause.push_str(&param.to_string());
            param += 1;
        }
        clause.push(')');
    }
    clause
}

/// Count inserts among returned rows and fold into stats
fn fold_returned(stats: &mut UpsertStats, batch_len: usize, returned: &[sqlx::postgres::PgRow]) {
    let inserted = returned
        .iter()
        .filter(|row| row.get::<bool, _>("inserted"))
        .count();
    stats.merge(UpsertStats {
        inserted,
        updated: returned.len() - inserted,
        unchanged: batch_len - returned.len(),
    });
}

#[async_trait]
impl MarketStore for TimescaleStore {
    async fn latest_candle_open_time(&self, symbol: &str) -> StorageResult<Option<i64>> {
        self.latest_key(CANDLES_TABLE, "open_time", symbol).await
    }

    async fn latest_trade_id(&self, symbol: &str) -> StorageResult<Option<i64>> {
        self.latest_key(TRADES_TABLE, "agg_trade_id", symbol).await
    }

    async fn latest_open_interest_timestamp(&self, symbol: &str) -> StorageResult<Option<i64>> {
        self.latest_key(OPEN_INTEREST_TABLE, "observation_time", symbol)
            .await
    }

    async fn latest_funding_time(&self, symbol: &str) -> StorageResult<Option<i64>> {
        self.latest_key(FUNDING_TABLE, "funding_time", symbol).await
    }

    async fn upsert_candles(&self, symbol: &str, rows: &[Candle]) -> StorageResult<UpsertStats> {
        let symbol = symbol.to_uppercase();
        let mut stats = UpsertStats::default();
        for chunk in rows.chunks(self.batch_size) {
            let query = format!(
                r#"
                INSERT INTO {table} (
                    symbol, open_time, close_time, open, high, low, close,
                    volume, quote_volume, trade_count, taker_buy_volume, taker_buy_quote_volume
                ) VALUES {values}
                ON CONFLICT (symbol, open_time) DO UPDATE SET
                    close_time = EXCLUDED.close_time,
                    open = EXCLUDED.open,
                    high = EXCLUDED.high,
                    low = EXCLUDED.low,
                    close = EXCLUDED.close,
                    volume = EXCLUDED.volume,
                    quote_volume = EXCLUDED.quote_volume,
                    trade_count = EXCLUDED.trade_count,
                    taker_buy_volume = EXCLUDED.taker_buy_volume,
                    taker_buy_quote_volume = EXCLUDED.taker_buy_quote_volume
                WHERE (
                    {table}.close_time, {table}.open, {table}.high, {table}.low,
                    {table}.close, {table}.volume, {table}.quote_volume,
                    {table}.trade_count, {table}.taker_buy_volume, {table}.taker_buy_quote_volume
                ) IS DISTINCT FROM (
                    EXCLUDED.close_time, EXCLUDED.open, EXCLUDED.high, EXCLUDED.low,
                    EXCLUDED.close, EXCLUDED.volume, EXCLUDED.quote_volume,
                    EXCLUDED.trade_count, EXCLUDED.taker_buy_volume, EXCLUDED.taker_buy_quote_volume
                )
                RETURNING (xmax = 0) AS inserted
                "#,
                table = CANDLES_TABLE,
                values = values_clause(chunk.len(), 12),
            );
            let mut sqlx_query = sqlx::query(&query);
            for candle in chunk {
                sqlx_query = sqlx_query
                    .bind(&symbol)
                    .bind(candle.open_time)
                    .bind(candle.close_time)
                    .bind(candle.open)
                    .bind(candle.high)
                    .bind(candle.low)
                    .bind(candle.close)
                    .bind(candle.volume)
                    .bind(candle.quote_volume)
                    .bind(candle.trade_count)
                    .bind(candle.taker_buy_volume)
                    .bind(candle.taker_buy_quote_volume);
            }
            let returned = sqlx_query.fetch_all(&self.pool).await?;
            fold_returned(&mut stats, chunk.len(), &returned);
        }
        debug!(%symbol, inserted = stats.inserted, updated = stats.updated, "upserted candles");
        Ok(stats)
    }

    async fn upsert_trades(&self, symbol: &str, rows: &[AggTrade]) -> StorageResult<UpsertStats> {
        let symbol = symbol.to_uppercase();
        let mut stats = UpsertStats::default();
        for chunk in rows.chunks(self.batch_size) {
            let query = format!(
                r#"
                INSERT INTO {table} (
                    symbol, agg_trade_id, price, quantity, first_trade_id,
                    last_trade_id, trade_timestamp, is_buyer_maker
                ) VALUES {values}
                ON CONFLICT (symbol, agg_trade_id) DO UPDATE SET
                    price = EXCLUDED.price,
                    quantity = EXCLUDED.quantity,
                    first_trade_id = EXCLUDED.first_trade_id,
                    last_trade_id = EXCLUDED.last_trade_id,
                    trade_timestamp = EXCLUDED.trade_timestamp,
                    is_buyer_maker = EXCLUDED.is_buyer_maker
                WHERE (
                    {table}.price, {table}.quantity, {table}.first_trade_id,
                    {table}.last_trade_id, {table}.trade_timestamp, {table}.is_buyer_maker
                ) IS DISTINCT FROM (
                    EXCLUDED.price, EXCLUDED.quantity, EXCLUDED.first_trade_id,
                    EXCLUDED.last_trade_id, EXCLUDED.trade_timestamp, EXCLUDED.is_buyer_maker
                )
                RETURNING (xmax = 0) AS inserted
                "#,
                table = TRADES_TABLE,
                values = values_clause(chunk.len(), 8),
            );
            let mut sqlx_query = sqlx::query(&query);
            for trade in chunk {
                sqlx_query = sqlx_query
                    .bind(&symbol)
                    .bind(trade.agg_trade_id)
                    .bind(trade.price)
                    .bind(trade.quantity)
                    .bind(trade.first_trade_id)
                    .bind(trade.last_trade_id)
                    .bind(trade.timestamp)
                    .bind(trade.is_buyer_maker);
            }
            let returned = sqlx_query.fetch_all(&self.pool).await?;
            fold_returned(&mut stats, chunk.len(), &returned);
        }
        debug!(%symbol, inserted = stats.inserted, updated = stats.updated, "upserted trades");
        Ok(stats)
    }

    async fn upsert_open_interest(
        &self,
        symbol: &str,
        rows: &[OpenInterestSample],
    ) -> StorageResult<UpsertStats> {
        let symbol = symbol.to_uppercase();
        let mut stats = UpsertStats::default();
        for chunk in rows.chunks(self.batch_size) {
            let query = format!(
                r#"
                INSERT INTO {table} (
                    symbol, observation_time, sum_open_interest, sum_open_interest_value
                ) VALUES {values}
                ON CONFLICT (symbol, observation_time) DO UPDATE SET
                    sum_open_interest = EXCLUDED.sum_open_interest,
                    sum_open_interest_value = EXCLUDED.sum_open_interest_value
                WHERE (
                    {table}.sum_open_interest, {table}.sum_open_interest_value
                ) IS DISTINCT FROM (
                    EXCLUDED.sum_open_interest, EXCLUDED.sum_open_interest_value
                )
                RETURNING (xmax = 0) AS inserted
                "#,
                table = OPEN_INTEREST_TABLE,
                values = values_clause(chunk.len(), 4),
            );
            let mut sqlx_query = sqlx::query(&query);
            for sample in chunk {
                sqlx_query = sqlx_query
                    .bind(&symbol)
                    .bind(sample.timestamp)
                    .bind(sample.sum_open_interest)
                    .bind(sample.sum_open_interest_value);
            }
            let returned = sqlx_query.fetch_all(&self.pool).await?;
            fold_returned(&mut stats, chunk.len(), &returned);
        }
        debug!(%symbol, inserted = stats.inserted, updated = stats.updated, "upserted open interest");
        Ok(stats)
    }

    async fn upsert_funding_rates(
        &self,
        symbol: &str,
        rows: &[FundingRate],
    ) -> StorageResult<UpsertStats> {
        let symbol = symbol.to_uppercase();
        let mut stats = UpsertStats::default();
        for chunk in rows.chunks(self.batch_size) {
            let query = format!(
                r#"
                INSERT INTO {table} (
                    symbol, funding_time, funding_rate, mark_price, index_price
                ) VALUES {values}
                ON CONFLICT (symbol, funding_time) DO UPDATE SET
                    funding_rate = EXCLUDED.funding_rate,
                    mark_price = EXCLUDED.mark_price,
                    index_price = EXCLUDED.index_price
                WHERE (
                    {table}.funding_rate, {table}.mark_price, {table}.index_price
                ) IS DISTINCT FROM (
                    EXCLUDED.funding_rate, EXCLUDED.mark_price, EXCLUDED.index_price
                )
                RETURNING (xmax = 0) AS inserted
                "#,
                table = FUNDING_TABLE,
                values = values_clause(chunk.len(), 5),
            );
            let mut sqlx_query = sqlx::query(&query);
            for rate in chunk {
                sqlx_query = sqlx_query
                    .bind(&symbol)
                    .bind(rate.funding_time)
                    .bind(rate.funding_rate)
                    .bind(rate.mark_price)
                    .bind(rate.index_price);
            }
            let returned = sqlx_query.fetch_all(&self.pool).await?;
            fold_returned(&mut stats, chunk.len(), &returned);
        }
        debug!(%symbol, inserted = stats.inserted, updated = stats.updated, "upserted funding rates");
        Ok(stats)
    }

    async fn fetch_latest_candles(
        &self,
        symbol: &str,
        limit: usize,
    ) -> StorageResult<Vec<Candle>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            r#"
            SELECT symbol, open_time, close_time, open, high, low, close,
                   volume, quote_volume, trade_count, taker_buy_volume, taker_buy_quote_volume
            FROM {}
            WHERE symbol = $1
            ORDER BY open_time DESC
            LIMIT $2
            "#,
            CANDLES_TABLE
        ))
        .bind(symbol.to_uppercase())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut candles: Vec<Candle> = rows
            .iter()
            .map(|row| Candle {
                symbol: row.get("symbol"),
                open_time: row.get("open_time"),
                close_time: row.get("close_time"),
                open: row.get("open"),
                high: row.get("high"),
                low: row.get("low"),
                close: row.get("close"),
                volume: row.get("volume"),
                quote_volume: row.get("quote_volume"),
                trade_count: row.get("trade_count"),
                taker_buy_volume: row.get("taker_buy_volume"),
                taker_buy_quote_volume: row.get("taker_buy_quote_volume"),
            })
            .collect();
        candles.reverse();
        Ok(candles)
    }

    async fn fetch_latest_trades(
        &self,
        symbol: &str,
        limit: usize,
    ) -> StorageResult<Vec<AggTrade>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            r#"
            SELECT symbol, agg_trade_id, price, quantity, first_trade_id,
                   last_trade_id, trade_timestamp, is_buyer_maker
            FROM {}
            WHERE symbol = $1
            ORDER BY agg_trade_id DESC
            LIMIT $2
            "#,
            TRADES_TABLE
        ))
        .bind(symbol.to_uppercase())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut trades: Vec<AggTrade> = rows
            .iter()
            .map(|row| AggTrade {
                symbol: row.get("symbol"),
                agg_trade_id: row.get("agg_trade_id"),
                price: row.get("price"),
                quantity: row.get("quantity"),
                first_trade_id: row.get("first_trade_id"),
                last_trade_id: row.get("last_trade_id"),
                timestamp: row.get("trade_timestamp"),
                is_buyer_maker: row.get("is_buyer_maker"),
            })
            .collect();
        trades.reverse();
        Ok(trades)
    }

    async fn fetch_latest_open_interest(
        &self,
        symbol: &str,
        limit: usize,
    ) -> StorageResult<Vec<OpenInterestSample>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            r#"
            SELECT symbol, observation_time, sum_open_interest, sum_open_interest_value
            FROM {}
            WHERE symbol = $1
            ORDER BY observation_time DESC
            LIMIT $2
            "#,
            OPEN_INTEREST_TABLE
        ))
        .bind(symbol.to_uppercase())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut samples: Vec<OpenInterestSample> = rows
            .iter()
            .map(|row| OpenInterestSample {
                symbol: row.get("symbol"),
                timestamp: row.get("observation_time"),
                sum_open_interest: row.get("sum_open_interest"),
                sum_open_interest_value: row.get("sum_open_interest_value"),
            })
            .collect();
        samples.reverse();
        Ok(samples)
    }

    async fn fetch_latest_funding(
        &self,
        symbol: &str,
        limit: usize,
    ) -> StorageResult<Vec<FundingRate>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            r#"
            SELECT symbol, funding_time, funding_rate, mark_price, index_price
            FROM {}
            WHERE symbol = $1
            ORDER BY funding_time DESC
            LIMIT $2
            "#,
            FUNDING_TABLE
        ))
        .bind(symbol.to_uppercase())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut rates: Vec<FundingRate> = rows
            .iter()
            .map(|row| FundingRate {
                symbol: row.get("symbol"),
                funding_time: row.get("funding_time"),
                funding_rate: row.get("funding_rate"),
                mark_price: row.get("mark_price"),
                index_price: row.get("index_price"),
            })
            .collect();
        rates.reverse();
        Ok(rates)
    }

    async fn flush(&self) -> StorageResult<()> {
        // Every upsert batch commits on its own; nothing buffered here.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_values_clause_numbers_placeholders() {
        assert_eq!(values_clause(1, 3), "($1, $2, $3)");
        assert_eq!(values_clause(2, 2), "($1, $2), ($3, $4)");
    }
}

//! End-to-end backfill over a fake REST client and the JSONL file store.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;

use futures_ingest::backfill::{BackfillConfig, BackfillJob};
use futures_ingest::provider::{FuturesMarketApi, RestResult};
use futures_ingest::schema::{AggTrade, Candle, DataKind, FundingRate, OpenInterestSample};
use futures_ingest::storage::{JsonlStore, MarketStore};

/// Serves one canned batch per kind, then runs dry
struct FakeBinanceClient {
    base_ms: i64,
    state: Mutex<Served>,
}

#[derive(Default)]
struct Served {
    klines: bool,
    trades: bool,
    open_interest: bool,
    funding: bool,
}

impl FakeBinanceClient {
    fn new(base_ms: i64) -> Self {
        Self {
            base_ms,
            state: Mutex::new(Served::default()),
        }
    }
}

#[async_trait]
impl FuturesMarketApi for FakeBinanceClient {
    async fn klines(
        &self,
        symbol: &str,
        _interval: &str,
        _start_time: Option<i64>,
        _end_time: Option<i64>,
        _limit: usize,
    ) -> RestResult<Vec<Candle>> {
        let mut state = self.state.lock();
        if state.klines {
            return Ok(vec![]);
        }
        state.klines = true;
        Ok((0..3)
            .map(|offset| {
                let open_time = self.base_ms + offset * 60_000;
                Candle {
                    symbol: symbol.to_uppercase(),
                    open_time,
                    close_time: open_time + 59_000,
                    open: Decimal::new(29_500, 0),
                    high: Decimal::new(29_600, 0),
                    low: Decimal::new(29_400, 0),
                    close: Decimal::new(29_550, 0),
                    volume: Decimal::new(100, 0),
                    quote_volume: Decimal::new(200, 0),
                    trade_count: 10,
                    taker_buy_volume: Decimal::new(50, 0),
                    taker_buy_quote_volume: Decimal::new(80, 0),
                }
            })
            .collect())
    }

    async fn agg_trades(
        &self,
        symbol: &str,
        _start_time: Option<i64>,
        _end_time: Option<i64>,
        _from_id: Option<i64>,
        _limit: usize,
    ) -> RestResult<Vec<AggTrade>> {
        let mut state = self.state.lock();
        if state.trades {
            return Ok(vec![]);
        }
        state.trades = true;
        Ok((0..2)
            .map(|idx| AggTrade {
                symbol: symbol.to_uppercase(),
                agg_trade_id: 1_000 + idx,
                price: Decimal::new(29_500, 0),
                quantity: Decimal::new(1, 1),
                first_trade_id: 2_000 + idx,
                last_trade_id: 2_000 + idx,
                timestamp: self.base_ms + idx * 30_000,
                is_buyer_maker: idx % 2 == 0,
            })
            .collect())
    }

    async fn open_interest_hist(
        &self,
        symbol: &str,
        _period: &str,
        _start_time: Option<i64>,
        _end_time: Option<i64>,
        _limit: usize,
    ) -> RestResult<Vec<OpenInterestSample>> {
        let mut state = self.state.lock();
        if state.open_interest {
            return Ok(vec![]);
        }
        state.open_interest = true;
        Ok(vec![OpenInterestSample {
            symbol: symbol.to_uppercase(),
            timestamp: self.base_ms,
            sum_open_interest: Decimal::new(123_456, 1),
            sum_open_interest_value: Decimal::new(34_567, 2),
        }])
    }

    async fn funding_rates(
        &self,
        symbol: &str,
        _start_time: Option<i64>,
        _end_time: Option<i64>,
        _limit: usize,
    ) -> RestResult<Vec<FundingRate>> {
        let mut state = self.state.lock();
        if state.funding {
            return Ok(vec![]);
        }
        state.funding = true;
        Ok(vec![FundingRate {
            symbol: symbol.to_uppercase(),
            funding_time: self.base_ms,
            funding_rate: Decimal::new(25, 5),
            mark_price: Decimal::new(29_550, 0),
            index_price: Decimal::new(29_540, 0),
        }])
    }
}

fn dataset_lines(path: &std::path::Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| line.to_string())
        .collect()
}

#[tokio::test]
async fn backfill_writes_all_datasets_and_resumes_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let end = start + chrono::Duration::minutes(5);
    let base_ms = start.timestamp_millis();

    let config = BackfillConfig::new("BTCUSDT", start, end);
    let store = Arc::new(JsonlStore::new(dir.path()));
    let job = BackfillJob::new(FakeBinanceClient::new(base_ms), Arc::clone(&store));

    let report = job.run(&config).await.unwrap();

    for file in [
        "btcusdt_candles.jsonl",
        "btcusdt_agg_trades.jsonl",
        "btcusdt_open_interest.jsonl",
        "btcusdt_funding.jsonl",
    ] {
        assert!(dir.path().join(file).exists(), "missing dataset {file}");
    }

    let candle_lines = dataset_lines(&dir.path().join("btcusdt_candles.jsonl"));
    assert_eq!(candle_lines.len(), 3);
    let open_times: Vec<i64> = candle_lines
        .iter()
        .map(|line| serde_json::from_str::<Candle>(line).unwrap().open_time)
        .collect();
    assert_eq!(
        open_times,
        vec![base_ms, base_ms + 60_000, base_ms + 120_000]
    );

    assert_eq!(
        dataset_lines(&dir.path().join("btcusdt_agg_trades.jsonl")).len(),
        2
    );
    assert_eq!(
        dataset_lines(&dir.path().join("btcusdt_open_interest.jsonl")).len(),
        1
    );
    assert_eq!(
        dataset_lines(&dir.path().join("btcusdt_funding.jsonl")).len(),
        1
    );

    let candles = &report.totals[&DataKind::Candles];
    assert_eq!(candles.fetched, 3);
    assert_eq!(candles.inserted, 3);
    assert_eq!(candles.earliest_key, Some(base_ms));
    assert_eq!(candles.latest_key, Some(base_ms + 120_000));

    let metrics = job.metrics().summary();
    assert_eq!(metrics[&DataKind::Candles].records, 3);
    drop(job);

    // Resume against an exhausted window: a fresh store instance picks up the
    // persisted cursors and nothing new is fetched or inserted.
    let resumed_store = Arc::new(JsonlStore::new(dir.path()));
    let resumed_job = BackfillJob::new(FakeBinanceClient::new(base_ms), resumed_store);
    let resumed_report = resumed_job.run(&config).await.unwrap();

    let resumed_candles = &resumed_report.totals[&DataKind::Candles];
    assert_eq!(resumed_candles.fetched, 0);
    assert_eq!(resumed_candles.inserted, 0);

    let after = dataset_lines(&dir.path().join("btcusdt_candles.jsonl"));
    assert_eq!(after.len(), 3);
    assert_eq!(after, candle_lines);
}

#[tokio::test]
async fn backfill_without_resume_reingests_idempotently() {
    let dir = tempfile::tempdir().unwrap();
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let end = start + chrono::Duration::minutes(5);
    let base_ms = start.timestamp_millis();

    let config = BackfillConfig::new("BTCUSDT", start, end).with_resume(false);

    let store = Arc::new(JsonlStore::new(dir.path()));
    let first = BackfillJob::new(FakeBinanceClient::new(base_ms), Arc::clone(&store));
    first.run(&config).await.unwrap();
    let before = dataset_lines(&dir.path().join("btcusdt_candles.jsonl"));

    let second = BackfillJob::new(FakeBinanceClient::new(base_ms), Arc::clone(&store));
    let report = second.run(&config).await.unwrap();

    // The full window is swept again; every re-served row is unchanged.
    let candles = &report.totals[&DataKind::Candles];
    assert_eq!(candles.fetched, 3);
    assert_eq!(candles.inserted, 0);
    assert_eq!(candles.unchanged, 3);

    let after = dataset_lines(&dir.path().join("btcusdt_candles.jsonl"));
    assert_eq!(before, after);

    let stored = store.fetch_latest_candles("BTCUSDT", 10).await.unwrap();
    assert_eq!(stored.len(), 3);
}

//! Live ingestion service
//!
//! Composition root for unbounded ingestion: per symbol, four independently
//! supervised loops (candles, open interest, funding over REST; trades over
//! the WebSocket streamer) run against one shared store. Each loop owns its
//! own backoff ladder and cursor; the only shared mutable state is the rate
//! limiter inside the REST client and the store's own locking.
//!
//! Cancellation is cooperative: every loop races its waits against the shared
//! token and unwinds promptly when `stop` fires.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::config::{ConfigError, IngestionSettings};
use crate::provider::{FuturesMarketApi, RestError, TradeStreamer};
use crate::schema::AggTrade;
use crate::storage::{MarketStore, StorageError};

/// Poll fetch sizes, matching the exchange's endpoint defaults
const CANDLE_POLL_LIMIT: usize = 1200;
const OPEN_INTEREST_POLL_LIMIT: usize = 500;
const FUNDING_POLL_LIMIT: usize = 1000;

/// Floor for the tightened no-new-data candle wait
const MIN_CANDLE_WAIT: Duration = Duration::from_secs(5);

/// Service lifecycle errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("ingestion service already running")]
    AlreadyRunning,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// One retryable loop iteration failure
#[derive(Error, Debug)]
enum IterationError {
    #[error(transparent)]
    Rest(#[from] RestError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

struct RunningState {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Coordinates REST polling and WebSocket streaming for all symbols
pub struct IngestionService {
    client: Arc<dyn FuturesMarketApi>,
    streamer: Arc<dyn TradeStreamer>,
    store: Arc<dyn MarketStore>,
    settings: IngestionSettings,
    running: Mutex<Option<RunningState>>,
}

impl IngestionService {
    pub fn new(
        client: Arc<dyn FuturesMarketApi>,
        streamer: Arc<dyn TradeStreamer>,
        store: Arc<dyn MarketStore>,
        settings: IngestionSettings,
    ) -> Result<Self, ConfigError> {
        if settings.symbols.is_empty() {
            return Err(ConfigError::NoSymbols);
        }
        for (name, secs) in [
            ("candle poll interval", settings.candle_poll_secs),
            ("open interest poll interval", settings.open_interest_poll_secs),
            ("funding poll interval", settings.funding_poll_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::NonPositive(name));
            }
        }
        Ok(Self {
            client,
            streamer,
            store,
            settings,
            running: Mutex::new(None),
        })
    }

    /// Launch all loops for all symbols
    pub fn start(&self) -> Result<(), ServiceError> {
        let mut guard = self.running.lock();
        if guard.is_some() {
            return Err(ServiceError::AlreadyRunning);
        }

        let shutdown = CancellationToken::new();
        let mut tasks = Vec::with_capacity(self.settings.symbols.len() * 4);
        for symbol in &self.settings.symbols {
            let symbol = symbol.to_uppercase();

            tasks.push(tokio::spawn(candle_loop(
                Arc::clone(&self.client),
                Arc::clone(&self.store),
                symbol.clone(),
                self.settings.candle_interval.clone(),
                Duration::from_secs(self.settings.candle_poll_secs),
                shutdown.clone(),
            )));
            tasks.push(tokio::spawn(open_interest_loop(
                Arc::clone(&self.client),
                Arc::clone(&self.store),
                symbol.clone(),
                self.settings.open_interest_period.clone(),
                Duration::from_secs(self.settings.open_interest_poll_secs),
                shutdown.clone(),
            )));
            tasks.push(tokio::spawn(funding_loop(
                Arc::clone(&self.client),
                Arc::clone(&self.store),
                symbol.clone(),
                Duration::from_secs(self.settings.funding_poll_secs),
                shutdown.clone(),
            )));
            tasks.push(tokio::spawn(trade_loop(
                Arc::clone(&self.streamer),
                Arc::clone(&self.store),
                symbol,
                shutdown.clone(),
            )));
        }

        info!(
            symbols = self.settings.symbols.len(),
            tasks = tasks.len(),
            "ingestion service started"
        );
        *guard = Some(RunningState { shutdown, tasks });
        Ok(())
    }

    /// Signal every loop to stop and await their completion
    pub async fn stop(&self) {
        let state = self.running.lock().take();
        let Some(state) = state else {
            return;
        };
        state.shutdown.cancel();
        for task in state.tasks {
            // Cancellation unwinds cleanly; a panicked loop is already logged.
            let _ = task.await;
        }
        info!("ingestion service stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
}

/// Race a wait against the stop signal
async fn wait_or_stop(shutdown: &CancellationToken, duration: Duration) {
    if duration.is_zero() || shutdown.is_cancelled() {
        return;
    }
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = sleep(duration) => {}
    }
}

async fn candle_loop(
    client: Arc<dyn FuturesMarketApi>,
    store: Arc<dyn MarketStore>,
    symbol: String,
    interval: String,
    poll: Duration,
    shutdown: CancellationToken,
) {
    let mut backoff =
        ExponentialBackoff::new(Duration::from_secs(2), 2.0, Duration::from_secs(120))
            .expect("candle backoff constants are valid");
    while !shutdown.is_cancelled() {
        match ingest_candles_once(client.as_ref(), store.as_ref(), &symbol, &interval).await {
            Ok(true) => {
                backoff.reset();
                wait_or_stop(&shutdown, poll).await;
            }
            Ok(false) => {
                // Nothing new: tighten polling as real time approaches.
                wait_or_stop(&shutdown, (poll / 2).max(MIN_CANDLE_WAIT)).await;
            }
            Err(err) => {
                warn!(%symbol, error = %err, "candle ingestion failed");
                wait_or_stop(&shutdown, backoff.next_delay()).await;
            }
        }
    }
    debug!(%symbol, "candle loop exited");
}

async fn open_interest_loop(
    client: Arc<dyn FuturesMarketApi>,
    store: Arc<dyn MarketStore>,
    symbol: String,
    period: String,
    poll: Duration,
    shutdown: CancellationToken,
) {
    let mut backoff =
        ExponentialBackoff::new(Duration::from_secs(5), 2.0, Duration::from_secs(180))
            .expect("open interest backoff constants are valid");
    while !shutdown.is_cancelled() {
        match ingest_open_interest_once(client.as_ref(), store.as_ref(), &symbol, &period).await {
            Ok(ingested) => {
                if ingested {
                    backoff.reset();
                }
                wait_or_stop(&shutdown, poll).await;
            }
            Err(err) => {
                warn!(%symbol, error = %err, "open interest ingestion failed");
                wait_or_stop(&shutdown, backoff.next_delay()).await;
            }
        }
    }
    debug!(%symbol, "open interest loop exited");
}

async fn funding_loop(
    client: Arc<dyn FuturesMarketApi>,
    store: Arc<dyn MarketStore>,
    symbol: String,
    poll: Duration,
    shutdown: CancellationToken,
) {
    let mut backoff =
        ExponentialBackoff::new(Duration::from_secs(10), 2.0, Duration::from_secs(300))
            .expect("funding backoff constants are valid");
    while !shutdown.is_cancelled() {
        match ingest_funding_once(client.as_ref(), store.as_ref(), &symbol).await {
            Ok(ingested) => {
                if ingested {
                    backoff.reset();
                }
                wait_or_stop(&shutdown, poll).await;
            }
            Err(err) => {
                warn!(%symbol, error = %err, "funding ingestion failed");
                wait_or_stop(&shutdown, backoff.next_delay()).await;
            }
        }
    }
    debug!(%symbol, "funding loop exited");
}

async fn trade_loop(
    streamer: Arc<dyn TradeStreamer>,
    store: Arc<dyn MarketStore>,
    symbol: String,
    shutdown: CancellationToken,
) {
    let mut backoff = ExponentialBackoff::new(Duration::from_secs(2), 2.0, Duration::from_secs(60))
        .expect("trade backoff constants are valid");
    while !shutdown.is_cancelled() {
        let mut trades = streamer.subscribe(&symbol, shutdown.clone());
        loop {
            // Drain trades already delivered before observing the stop
            // signal; the producer watches the same token and closes the
            // channel, so cancellation still unwinds promptly.
            tokio::select! {
                biased;
                trade = trades.recv() => match trade {
                    Some(trade) => {
                        match persist_trade(store.as_ref(), &symbol, &trade).await {
                            Ok(()) => backoff.reset(),
                            Err(err) => {
                                warn!(%symbol, error = %err, "failed to persist trade");
                                wait_or_stop(&shutdown, backoff.next_delay()).await;
                            }
                        }
                    }
                    None => break,
                },
                _ = shutdown.cancelled() => {
                    debug!(%symbol, "trade loop exited");
                    return;
                }
            }
        }
        if shutdown.is_cancelled() {
            break;
        }
        // The producer never ends on its own; a closed channel without the
        // stop signal means the subscription died, so restart it.
        let delay = backoff.next_delay();
        warn!(%symbol, delay_ms = delay.as_millis() as u64, "trade stream ended, restarting");
        wait_or_stop(&shutdown, delay).await;
    }
    debug!(%symbol, "trade loop exited");
}

async fn ingest_candles_once(
    client: &dyn FuturesMarketApi,
    store: &dyn MarketStore,
    symbol: &str,
    interval: &str,
) -> Result<bool, IterationError> {
    let start_time = store
        .latest_candle_open_time(symbol)
        .await?
        .map(|latest| latest + 1);
    let rows = client
        .klines(symbol, interval, start_time, None, CANDLE_POLL_LIMIT)
        .await?;
    if rows.is_empty() {
        return Ok(false);
    }
    store.upsert_candles(symbol, &rows).await?;
    store.flush().await?;
    Ok(true)
}

async fn ingest_open_interest_once(
    client: &dyn FuturesMarketApi,
    store: &dyn MarketStore,
    symbol: &str,
    period: &str,
) -> Result<bool, IterationError> {
    let start_time = store
        .latest_open_interest_timestamp(symbol)
        .await?
        .map(|latest| latest + 1);
    let rows = client
        .open_interest_hist(symbol, period, start_time, None, OPEN_INTEREST_POLL_LIMIT)
        .await?;
    if rows.is_empty() {
        return Ok(false);
    }
    store.upsert_open_interest(symbol, &rows).await?;
    store.flush().await?;
    Ok(true)
}

async fn ingest_funding_once(
    client: &dyn FuturesMarketApi,
    store: &dyn MarketStore,
    symbol: &str,
) -> Result<bool, IterationError> {
    let start_time = store
        .latest_funding_time(symbol)
        .await?
        .map(|latest| latest + 1);
    let rows = client
        .funding_rates(symbol, start_time, None, FUNDING_POLL_LIMIT)
        .await?;
    if rows.is_empty() {
        return Ok(false);
    }
    store.upsert_funding_rates(symbol, &rows).await?;
    store.flush().await?;
    Ok(true)
}

async fn persist_trade(
    store: &dyn MarketStore,
    symbol: &str,
    trade: &AggTrade,
) -> Result<(), IterationError> {
    store
        .upsert_trades(symbol, std::slice::from_ref(trade))
        .await?;
    store.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use tokio::sync::mpsc;

    use crate::provider::RestResult;
    use crate::schema::{Candle, FundingRate, OpenInterestSample};
    use crate::storage::MemoryStore;

    const BASE_MS: i64 = 1_700_000_000_000;

    fn candle(open_time: i64) -> Candle {
        Candle {
            symbol: "BTCUSDT".to_string(),
            open_time,
            close_time: open_time + 59_000,
            open: Decimal::new(30_000, 0),
            high: Decimal::new(30_100, 0),
            low: Decimal::new(29_900, 0),
            close: Decimal::new(30_050, 0),
            volume: Decimal::new(150, 0),
            quote_volume: Decimal::new(200, 0),
            trade_count: 42,
            taker_buy_volume: Decimal::new(75, 0),
            taker_buy_quote_volume: Decimal::new(120, 0),
        }
    }

    fn trade(id: i64) -> AggTrade {
        AggTrade {
            symbol: "BTCUSDT".to_string(),
            agg_trade_id: id,
            price: Decimal::new(30_010, 0),
            quantity: Decimal::new(2, 1),
            first_trade_id: 300,
            last_trade_id: 300,
            timestamp: BASE_MS + 100,
            is_buyer_maker: false,
        }
    }

    /// Serves each kind once, then returns empty and records the cursor
    #[derive(Default)]
    struct FakeApi {
        state: parking_lot::Mutex<FakeState>,
    }

    #[derive(Default)]
    struct FakeState {
        candle_start: Option<i64>,
        open_interest_start: Option<i64>,
        funding_start: Option<i64>,
    }

    #[async_trait]
    impl FuturesMarketApi for FakeApi {
        async fn klines(
            &self,
            _symbol: &str,
            _interval: &str,
            start_time: Option<i64>,
            _end_time: Option<i64>,
            _limit: usize,
        ) -> RestResult<Vec<Candle>> {
            if let Some(start) = start_time {
                self.state.lock().candle_start = Some(start);
                return Ok(vec![]);
            }
            Ok(vec![candle(BASE_MS)])
        }

        async fn agg_trades(
            &self,
            _symbol: &str,
            _start_time: Option<i64>,
            _end_time: Option<i64>,
            _from_id: Option<i64>,
            _limit: usize,
        ) -> RestResult<Vec<AggTrade>> {
            Ok(vec![])
        }

        async fn open_interest_hist(
            &self,
            _symbol: &str,
            _period: &str,
            start_time: Option<i64>,
            _end_time: Option<i64>,
            _limit: usize,
        ) -> RestResult<Vec<OpenInterestSample>> {
            if let Some(start) = start_time {
                self.state.lock().open_interest_start = Some(start);
                return Ok(vec![]);
            }
            Ok(vec![OpenInterestSample {
                symbol: "BTCUSDT".to_string(),
                timestamp: BASE_MS,
                sum_open_interest: Decimal::new(123_456, 1),
                sum_open_interest_value: Decimal::new(34_567, 2),
            }])
        }

        async fn funding_rates(
            &self,
            _symbol: &str,
            start_time: Option<i64>,
            _end_time: Option<i64>,
            _limit: usize,
        ) -> RestResult<Vec<FundingRate>> {
            if let Some(start) = start_time {
                self.state.lock().funding_start = Some(start);
                return Ok(vec![]);
            }
            Ok(vec![FundingRate {
                symbol: "BTCUSDT".to_string(),
                funding_time: BASE_MS,
                funding_rate: Decimal::new(25, 5),
                mark_price: Decimal::new(30_050, 0),
                index_price: Decimal::new(30_040, 0),
            }])
        }
    }

    /// Delivers a fixed set of trades, then signals stop and ends
    struct StaticStreamer {
        trades: Vec<AggTrade>,
    }

    impl TradeStreamer for StaticStreamer {
        fn subscribe(
            &self,
            _symbol: &str,
            shutdown: CancellationToken,
        ) -> mpsc::Receiver<AggTrade> {
            let (tx, rx) = mpsc::channel(16);
            let trades = self.trades.clone();
            tokio::spawn(async move {
                for trade in trades {
                    if tx.send(trade).await.is_err() {
                        return;
                    }
                }
                shutdown.cancel();
            });
            rx
        }
    }

    /// Idles until cancelled without producing anything
    struct SilentStreamer;

    impl TradeStreamer for SilentStreamer {
        fn subscribe(
            &self,
            _symbol: &str,
            shutdown: CancellationToken,
        ) -> mpsc::Receiver<AggTrade> {
            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(async move {
                shutdown.cancelled().await;
                drop(tx);
            });
            rx
        }
    }

    #[tokio::test]
    async fn test_ingest_once_advances_cursor_past_latest() {
        let api = FakeApi::default();
        let store = MemoryStore::new();

        assert!(ingest_candles_once(&api, &store, "BTCUSDT", "1m")
            .await
            .unwrap());
        assert!(ingest_open_interest_once(&api, &store, "BTCUSDT", "5m")
            .await
            .unwrap());
        assert!(ingest_funding_once(&api, &store, "BTCUSDT").await.unwrap());

        // Second pass requests from latest + 1 and ingests nothing.
        assert!(!ingest_candles_once(&api, &store, "BTCUSDT", "1m")
            .await
            .unwrap());
        assert!(!ingest_open_interest_once(&api, &store, "BTCUSDT", "5m")
            .await
            .unwrap());
        assert!(!ingest_funding_once(&api, &store, "BTCUSDT").await.unwrap());

        let state = api.state.lock();
        assert_eq!(state.candle_start, Some(BASE_MS + 1));
        assert_eq!(state.open_interest_start, Some(BASE_MS + 1));
        assert_eq!(state.funding_start, Some(BASE_MS + 1));
    }

    #[tokio::test]
    async fn test_trade_loop_persists_streamed_trades() {
        let store: Arc<dyn MarketStore> = Arc::new(MemoryStore::new());
        let streamer: Arc<dyn TradeStreamer> = Arc::new(StaticStreamer {
            trades: vec![trade(200), trade(201)],
        });
        let shutdown = CancellationToken::new();

        trade_loop(
            streamer,
            Arc::clone(&store),
            "BTCUSDT".to_string(),
            shutdown,
        )
        .await;

        let stored = store.fetch_latest_trades("BTCUSDT", 10).await.unwrap();
        let ids: Vec<i64> = stored.iter().map(|t| t.agg_trade_id).collect();
        assert_eq!(ids, vec![200, 201]);
    }

    fn service(streamer: Arc<dyn TradeStreamer>) -> IngestionService {
        let settings = IngestionSettings {
            symbols: vec!["BTCUSDT".to_string()],
            ..Default::default()
        };
        IngestionService::new(
            Arc::new(FakeApi::default()),
            streamer,
            Arc::new(MemoryStore::new()),
            settings,
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_empty_symbol_list() {
        let settings = IngestionSettings {
            symbols: vec![],
            ..Default::default()
        };
        let result = IngestionService::new(
            Arc::new(FakeApi::default()),
            Arc::new(SilentStreamer),
            Arc::new(MemoryStore::new()),
            settings,
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_start_twice_fails_and_stop_joins_all_loops() {
        let service = service(Arc::new(SilentStreamer));
        assert!(!service.is_running());

        service.start().unwrap();
        assert!(service.is_running());
        assert!(matches!(
            service.start(),
            Err(ServiceError::AlreadyRunning)
        ));

        service.stop().await;
        assert!(!service.is_running());

        // A stopped service can be started again.
        service.start().unwrap();
        service.stop().await;
    }

    #[tokio::test]
    async fn test_stop_without_start_is_a_no_op() {
        let service = service(Arc::new(SilentStreamer));
        service.stop().await;
        assert!(!service.is_running());
    }
}

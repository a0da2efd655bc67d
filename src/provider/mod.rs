//! Data provider interfaces
//!
//! These traits define the seam between the ingestion drivers (backfill job,
//! live service) and the exchange. The Binance implementation lives in
//! [`binance`]; tests substitute fakes.

pub mod binance;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ConfigError;
use crate::schema::{AggTrade, Candle, FundingRate, OpenInterestSample};

/// REST fetch errors
///
/// Local to a single logical fetch: the calling loop or job catches this and
/// applies its own backoff rather than crashing.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RestError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected http status {0}")]
    Status(u16),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("retries exhausted after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: Box<RestError>,
    },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

pub type RestResult<T> = Result<T, RestError>;

/// Typed fetch operations against the futures REST API
///
/// One operation per data kind. Aggregate trades are fetched over REST only
/// for historical backfill; live trades come from a [`TradeStreamer`].
#[async_trait]
pub trait FuturesMarketApi: Send + Sync {
    /// Fetch klines for `symbol` at `interval` within the optional time bounds
    async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: usize,
    ) -> RestResult<Vec<Candle>>;

    /// Fetch aggregate trades, optionally continuing from a trade-id cursor
    async fn agg_trades(
        &self,
        symbol: &str,
        start_time: Option<i64>,
        end_time: Option<i64>,
        from_id: Option<i64>,
        limit: usize,
    ) -> RestResult<Vec<AggTrade>>;

    /// Fetch open-interest history sampled at `period`
    async fn open_interest_hist(
        &self,
        symbol: &str,
        period: &str,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: usize,
    ) -> RestResult<Vec<OpenInterestSample>>;

    /// Fetch funding-rate history
    async fn funding_rates(
        &self,
        symbol: &str,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: usize,
    ) -> RestResult<Vec<FundingRate>>;
}

/// Live, restartable aggregate-trade feed for one symbol
///
/// `subscribe` hands back the consuming half of a channel; a producer task
/// owns the connection and all reconnect/backoff state. The channel only
/// closes when the shutdown token fires (or the receiver is dropped), so the
/// consumer loop stays free of connection concerns.
pub trait TradeStreamer: Send + Sync {
    fn subscribe(&self, symbol: &str, shutdown: CancellationToken) -> mpsc::Receiver<AggTrade>;
}

//! Binance futures REST client
//!
//! Every call acquires the shared rate limiter with the endpoint's configured
//! weight, then retries transient failures with a capped exponential backoff.
//! The backoff state is local to each logical call: a fresh ladder starts on
//! every fetch, so sustained failure bursts are throttled by the caller's own
//! loop backoff rather than accumulating here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::backoff::ExponentialBackoff;
use crate::config::{BinanceSettings, ConfigError, RequestWeights, RestRetrySettings};
use crate::provider::{FuturesMarketApi, RestError, RestResult};
use crate::rate_limit::RateLimiter;
use crate::schema::{AggTrade, Candle, FundingRate, OpenInterestSample};

use super::types::{candle_from_kline, AggTradeMessage, FundingRateRow, OpenInterestRow};

const KLINES_PATH: &str = "/fapi/v1/klines";
const AGG_TRADES_PATH: &str = "/fapi/v1/aggTrades";
const OPEN_INTEREST_PATH: &str = "/futures/data/openInterestHist";
const FUNDING_PATH: &str = "/fapi/v1/fundingRate";

/// REST client for Binance USD-M futures market data
pub struct BinanceFuturesRestClient {
    http: reqwest::Client,
    base_url: String,
    limiter: Arc<RateLimiter>,
    retry: RestRetrySettings,
    weights: RequestWeights,
    retry_backoff: ExponentialBackoff,
}

impl BinanceFuturesRestClient {
    /// Create a client with its own rate limiter from settings
    pub fn new(settings: &BinanceSettings) -> Result<Self, ConfigError> {
        let limiter = Arc::new(RateLimiter::new(
            settings.rate_limit.capacity,
            Duration::from_secs(settings.rate_limit.interval_secs),
        )?);
        Self::with_limiter(settings, limiter)
    }

    /// Create a client sharing an existing rate limiter
    pub fn with_limiter(
        settings: &BinanceSettings,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self, ConfigError> {
        if settings.retry.max_attempts == 0 {
            return Err(ConfigError::NonPositive("max retry attempts"));
        }
        for (name, weight) in [
            ("klines weight", settings.weights.klines),
            ("agg_trades weight", settings.weights.agg_trades),
            ("open_interest weight", settings.weights.open_interest),
            ("funding weight", settings.weights.funding),
        ] {
            if weight == 0 {
                return Err(ConfigError::NonPositive(name));
            }
        }
        let retry_backoff = ExponentialBackoff::new(
            Duration::from_millis(settings.retry.backoff_initial_ms.max(1)),
            settings.retry.backoff_factor,
            Duration::from_millis(
                settings
                    .retry
                    .backoff_max_ms
                    .max(settings.retry.backoff_initial_ms.max(1)),
            ),
        )?;
        let http = reqwest::Client::builder()
            .user_agent(concat!("futures-ingest/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(ConfigError::HttpClient)?;
        Ok(Self {
            http,
            base_url: settings.rest_url.trim_end_matches('/').to_string(),
            limiter,
            retry: settings.retry.clone(),
            weights: settings.weights.clone(),
            retry_backoff,
        })
    }

    fn should_retry(&self, err: &RestError) -> bool {
        match err {
            RestError::Status(status) => self.retry.retry_statuses.contains(status),
            RestError::Transport(_) => true,
            _ => false,
        }
    }

    async fn get_rows(
        &self,
        path: &str,
        params: &[(&str, String)],
        weight: usize,
    ) -> RestResult<Vec<Value>> {
        let mut backoff = self.retry_backoff.clone();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_get(path, params, weight).await {
                Ok(rows) => return Ok(rows),
                Err(err) => {
                    if !self.should_retry(&err) {
                        return Err(err);
                    }
                    if attempt >= self.retry.max_attempts {
                        return Err(RestError::Exhausted {
                            attempts: attempt,
                            source: Box::new(err),
                        });
                    }
                    let delay = backoff.next_delay();
                    warn!(
                        path,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying request"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    async fn try_get(
        &self,
        path: &str,
        params: &[(&str, String)],
        weight: usize,
    ) -> RestResult<Vec<Value>> {
        self.limiter.acquire(weight).await?;
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.get(&url).query(params).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RestError::Status(status.as_u16()));
        }
        response
            .json::<Vec<Value>>()
            .await
            .map_err(|err| RestError::Decode(err.to_string()))
    }
}

fn push_time_bounds(
    params: &mut Vec<(&'static str, String)>,
    start_time: Option<i64>,
    end_time: Option<i64>,
) {
    if let Some(start) = start_time {
        params.push(("startTime", start.to_string()));
    }
    if let Some(end) = end_time {
        params.push(("endTime", end.to_string()));
    }
}

#[async_trait]
impl FuturesMarketApi for BinanceFuturesRestClient {
    async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: usize,
    ) -> RestResult<Vec<Candle>> {
        let mut params = vec![
            ("symbol", symbol.to_uppercase()),
            ("interval", interval.to_string()),
            ("limit", limit.to_string()),
        ];
        push_time_bounds(&mut params, start_time, end_time);
        let rows = self
            .get_rows(KLINES_PATH, &params, self.weights.klines)
            .await?;
        let mut candles = Vec::with_capacity(rows.len());
        for row in &rows {
            match candle_from_kline(symbol, row) {
                Ok(candle) => candles.push(candle),
                Err(err) => warn!(symbol, error = %err, "skipping malformed kline row"),
            }
        }
        debug!(symbol, count = candles.len(), "fetched klines");
        Ok(candles)
    }

    async fn agg_trades(
        &self,
        symbol: &str,
        start_time: Option<i64>,
        end_time: Option<i64>,
        from_id: Option<i64>,
        limit: usize,
    ) -> RestResult<Vec<AggTrade>> {
        let mut params = vec![
            ("symbol", symbol.to_uppercase()),
            ("limit", limit.to_string()),
        ];
        push_time_bounds(&mut params, start_time, end_time);
        if let Some(from_id) = from_id {
            params.push(("fromId", from_id.to_string()));
        }
        let rows = self
            .get_rows(AGG_TRADES_PATH, &params, self.weights.agg_trades)
            .await?;
        let mut trades = Vec::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_value::<AggTradeMessage>(row) {
                Ok(msg) => trades.push(msg.into_trade(symbol)),
                Err(err) => warn!(symbol, error = %err, "skipping malformed trade row"),
            }
        }
        debug!(symbol, count = trades.len(), "fetched aggregate trades");
        Ok(trades)
    }

    async fn open_interest_hist(
        &self,
        symbol: &str,
        period: &str,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: usize,
    ) -> RestResult<Vec<OpenInterestSample>> {
        let mut params = vec![
            ("symbol", symbol.to_uppercase()),
            ("period", period.to_string()),
            ("limit", limit.to_string()),
        ];
        push_time_bounds(&mut params, start_time, end_time);
        let rows = self
            .get_rows(OPEN_INTEREST_PATH, &params, self.weights.open_interest)
            .await?;
        let mut samples = Vec::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_value::<OpenInterestRow>(row) {
                Ok(parsed) => samples.push(parsed.into_sample(symbol)),
                Err(err) => warn!(symbol, error = %err, "skipping malformed open interest row"),
            }
        }
        debug!(symbol, count = samples.len(), "fetched open interest");
        Ok(samples)
    }

    async fn funding_rates(
        &self,
        symbol: &str,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: usize,
    ) -> RestResult<Vec<FundingRate>> {
        let mut params = vec![
            ("symbol", symbol.to_uppercase()),
            ("limit", limit.to_string()),
        ];
        push_time_bounds(&mut params, start_time, end_time);
        let rows = self
            .get_rows(FUNDING_PATH, &params, self.weights.funding)
            .await?;
        let mut rates = Vec::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_value::<FundingRateRow>(row) {
                Ok(parsed) => rates.push(parsed.into_rate(symbol)),
                Err(err) => warn!(symbol, error = %err, "skipping malformed funding row"),
            }
        }
        debug!(symbol, count = rates.len(), "fetched funding rates");
        Ok(rates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BinanceSettings;

    fn client() -> BinanceFuturesRestClient {
        BinanceFuturesRestClient::new(&BinanceSettings::default()).unwrap()
    }

    #[test]
    fn test_rejects_zero_retry_attempts() {
        let mut settings = BinanceSettings::default();
        settings.retry.max_attempts = 0;
        assert!(BinanceFuturesRestClient::new(&settings).is_err());
    }

    #[test]
    fn test_rejects_zero_weight() {
        let mut settings = BinanceSettings::default();
        settings.weights.funding = 0;
        assert!(BinanceFuturesRestClient::new(&settings).is_err());
    }

    #[test]
    fn test_retryable_status_classification() {
        let client = client();
        assert!(client.should_retry(&RestError::Status(429)));
        assert!(client.should_retry(&RestError::Status(503)));
        assert!(!client.should_retry(&RestError::Status(400)));
        assert!(!client.should_retry(&RestError::Status(404)));
        assert!(!client.should_retry(&RestError::Decode("bad".into())));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let mut settings = BinanceSettings::default();
        settings.rest_url = "https://fapi.binance.com/".to_string();
        let client = BinanceFuturesRestClient::new(&settings).unwrap();
        assert_eq!(client.base_url, "https://fapi.binance.com");
    }

    #[test]
    fn test_time_bounds_only_added_when_present() {
        let mut params: Vec<(&'static str, String)> = vec![];
        push_time_bounds(&mut params, None, None);
        assert!(params.is_empty());
        push_time_bounds(&mut params, Some(1), Some(2));
        assert_eq!(params[0], ("startTime", "1".to_string()));
        assert_eq!(params[1], ("endTime", "2".to_string()));
    }
}

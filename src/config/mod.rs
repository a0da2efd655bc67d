//! Application settings and configuration
//!
//! Settings are layered: `config/default.toml`, an optional environment file
//! named after `RUN_MODE`, an optional `config/local.toml`, then environment
//! variables with the `FUTURES_INGEST` prefix (`__` separator, e.g.
//! `FUTURES_INGEST__DATABASE__URL`).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use ::config::{Config, Environment, File};

/// Configuration and validation errors
///
/// Always raised before any I/O; never retried.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("{0} must be positive")]
    NonPositive(&'static str),

    #[error("backoff factor must be >= 1")]
    BackoffFactorTooSmall,

    #[error("maximum backoff must be >= initial backoff")]
    BackoffMaxBelowInitial,

    #[error("weight {weight} exceeds rate limiter capacity {capacity}")]
    WeightExceedsCapacity { weight: usize, capacity: usize },

    #[error("end time must be after start time")]
    InvalidWindow,

    #[error("unsupported interval: {0}")]
    UnsupportedInterval(String),

    #[error("at least one symbol must be configured")]
    NoSymbols,

    #[error("failed to load settings: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("failed to build http client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Database configuration; when absent the JSONL file store is used
    #[serde(default)]
    pub database: Option<DatabaseSettings>,
    /// File storage settings
    #[serde(default)]
    pub storage: StorageSettings,
    /// Binance endpoint and pacing settings
    #[serde(default)]
    pub binance: BinanceSettings,
    /// Live ingestion settings
    #[serde(default)]
    pub ingestion: IngestionSettings,
}

/// Database connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// PostgreSQL/TimescaleDB connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

/// File storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Directory holding the JSONL datasets
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Batch size for database inserts
    #[serde(default = "default_batch_size")]
    pub batch_insert_size: usize,
}

fn default_data_dir() -> String {
    "data/binance".to_string()
}

fn default_batch_size() -> usize {
    1000
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            batch_insert_size: default_batch_size(),
        }
    }
}

/// Binance endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinanceSettings {
    /// Futures REST base URL
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    /// Futures WebSocket base URL
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Request rate limiting
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    /// REST retry behaviour
    #[serde(default)]
    pub retry: RestRetrySettings,
    /// Per-endpoint request weights
    #[serde(default)]
    pub weights: RequestWeights,
}

fn default_rest_url() -> String {
    "https://fapi.binance.com".to_string()
}

fn default_ws_url() -> String {
    "wss://fstream.binance.com".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

impl Default for BinanceSettings {
    fn default() -> Self {
        Self {
            rest_url: default_rest_url(),
            ws_url: default_ws_url(),
            request_timeout_secs: default_request_timeout(),
            rate_limit: RateLimitSettings::default(),
            retry: RestRetrySettings::default(),
            weights: RequestWeights::default(),
        }
    }
}

/// Sliding-window rate limit settings
///
/// Binance grants 2400 weight units per minute on the futures REST API; the
/// default stays well under that.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Total weight units per window
    #[serde(default = "default_rate_capacity")]
    pub capacity: usize,
    /// Window length in seconds
    #[serde(default = "default_rate_interval")]
    pub interval_secs: u64,
}

fn default_rate_capacity() -> usize {
    1200
}

fn default_rate_interval() -> u64 {
    60
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            capacity: default_rate_capacity(),
            interval_secs: default_rate_interval(),
        }
    }
}

/// REST retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestRetrySettings {
    /// Maximum attempts per logical request
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Initial retry delay in milliseconds
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    /// Multiplier applied per retry
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Retry delay cap in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// HTTP statuses that trigger a retry
    #[serde(default = "default_retry_statuses")]
    pub retry_statuses: Vec<u16>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_initial_ms() -> u64 {
    500
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_backoff_max_ms() -> u64 {
    5000
}

fn default_retry_statuses() -> Vec<u16> {
    vec![418, 429, 500, 502, 503, 504]
}

impl Default for RestRetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_factor: default_backoff_factor(),
            backoff_max_ms: default_backoff_max_ms(),
            retry_statuses: default_retry_statuses(),
        }
    }
}

/// Request weight per endpoint, in Binance weight units
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestWeights {
    #[serde(default = "default_weight_klines")]
    pub klines: usize,
    #[serde(default = "default_weight_agg_trades")]
    pub agg_trades: usize,
    #[serde(default = "default_weight_open_interest")]
    pub open_interest: usize,
    #[serde(default = "default_weight_funding")]
    pub funding: usize,
}

fn default_weight_klines() -> usize {
    2
}

fn default_weight_agg_trades() -> usize {
    1
}

fn default_weight_open_interest() -> usize {
    2
}

fn default_weight_funding() -> usize {
    1
}

impl Default for RequestWeights {
    fn default() -> Self {
        Self {
            klines: default_weight_klines(),
            agg_trades: default_weight_agg_trades(),
            open_interest: default_weight_open_interest(),
            funding: default_weight_funding(),
        }
    }
}

/// Live ingestion settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionSettings {
    /// Symbols to ingest
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    /// Candle interval requested from the REST API
    #[serde(default = "default_candle_interval")]
    pub candle_interval: String,
    /// Open-interest sampling period
    #[serde(default = "default_open_interest_period")]
    pub open_interest_period: String,
    /// Steady candle polling interval in seconds
    #[serde(default = "default_candle_poll")]
    pub candle_poll_secs: u64,
    /// Open-interest polling interval in seconds
    #[serde(default = "default_open_interest_poll")]
    pub open_interest_poll_secs: u64,
    /// Funding polling interval in seconds
    #[serde(default = "default_funding_poll")]
    pub funding_poll_secs: u64,
}

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_candle_interval() -> String {
    "1m".to_string()
}

fn default_open_interest_period() -> String {
    "5m".to_string()
}

fn default_candle_poll() -> u64 {
    30
}

fn default_open_interest_poll() -> u64 {
    60
}

fn default_funding_poll() -> u64 {
    60
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            candle_interval: default_candle_interval(),
            open_interest_period: default_open_interest_period(),
            candle_poll_secs: default_candle_poll(),
            open_interest_poll_secs: default_open_interest_poll(),
            funding_poll_secs: default_funding_poll(),
        }
    }
}

impl Settings {
    /// Load settings from configuration files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_prefix("FUTURES_INGEST")
    }

    /// Load settings with a custom environment variable prefix
    pub fn load_with_prefix(env_prefix: &str) -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());
        let config_dir = Self::config_dir();

        let s = Config::builder()
            .add_source(File::with_name(&format!("{}/default", config_dir)).required(false))
            .add_source(File::with_name(&format!("{}/{}", config_dir, run_mode)).required(false))
            .add_source(File::with_name(&format!("{}/local", config_dir)).required(false))
            .add_source(
                Environment::with_prefix(env_prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(s.try_deserialize()?)
    }

    fn config_dir() -> String {
        std::env::var("FUTURES_INGEST_CONFIG_DIR").unwrap_or_else(|_| "config".into())
    }

    /// Create default settings (useful for testing)
    pub fn default_settings() -> Self {
        Settings {
            database: None,
            storage: StorageSettings::default(),
            binance: BinanceSettings::default(),
            ingestion: IngestionSettings::default(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::default_settings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default_settings();
        assert!(settings.database.is_none());
        assert_eq!(settings.binance.rate_limit.capacity, 1200);
        assert_eq!(settings.binance.weights.klines, 2);
        assert_eq!(settings.ingestion.candle_poll_secs, 30);
    }

    #[test]
    fn test_retry_statuses_cover_rate_limit_and_server_errors() {
        let retry = RestRetrySettings::default();
        assert!(retry.retry_statuses.contains(&429));
        assert!(retry.retry_statuses.contains(&503));
        assert!(!retry.retry_statuses.contains(&404));
    }
}

//! # Futures Ingest
//!
//! Continuous acquisition of Binance USD-M futures market data: 1-minute
//! candles, aggregated trades, open-interest snapshots, and funding rates,
//! persisted idempotently for downstream consumers.
//!
//! ## Modes
//!
//! - **Backfill**: a bounded sweep over an explicit time window with
//!   resumable cursor pagination ([`backfill::BackfillJob`])
//! - **Live**: an unbounded service polling REST and streaming trades over
//!   WebSocket, per symbol, until stopped ([`ingest::IngestionService`])
//!
//! ## Storage
//!
//! Both drivers run against the [`storage::MarketStore`] contract with three
//! interchangeable backends: line-delimited JSON files rewritten atomically,
//! TimescaleDB tables with insert-or-update semantics, and an in-memory
//! double for tests.

pub mod backfill;
pub mod backoff;
pub mod cli;
pub mod config;
pub mod ingest;
pub mod provider;
pub mod rate_limit;
pub mod schema;
pub mod storage;

// Re-export commonly used types
pub use backfill::{BackfillConfig, BackfillJob, BackfillReport};
pub use backoff::ExponentialBackoff;
pub use config::Settings;
pub use ingest::IngestionService;
pub use provider::{FuturesMarketApi, RestError, TradeStreamer};
pub use rate_limit::RateLimiter;
pub use schema::{AggTrade, Candle, DataKind, FundingRate, OpenInterestSample};
pub use storage::{JsonlStore, MarketStore, MemoryStore, StorageError, TimescaleStore, UpsertStats};

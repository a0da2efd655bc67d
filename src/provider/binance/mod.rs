//! Binance USD-M futures provider
//!
//! REST client for klines, aggregate trades, open interest, and funding
//! rates, plus the WebSocket aggregate-trade streamer.

pub mod rest;
pub mod stream;
pub mod types;

pub use rest::BinanceFuturesRestClient;
pub use stream::BinanceAggTradeStream;

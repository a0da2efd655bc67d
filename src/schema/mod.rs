//! Normalized market data types
//!
//! These types are the canonical format for all Binance futures data in the
//! system. Wire payloads from REST and WebSocket are normalized to these
//! records before storage; both storage backends persist them unchanged.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// The four ingested data kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataKind {
    Candles,
    AggTrades,
    OpenInterest,
    Funding,
}

impl DataKind {
    /// Stable lowercase name used in file names and reports
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Candles => "candles",
            DataKind::AggTrades => "agg_trades",
            DataKind::OpenInterest => "open_interest",
            DataKind::Funding => "funding",
        }
    }

    /// All kinds in report order
    pub fn all() -> [DataKind; 4] {
        [
            DataKind::Candles,
            DataKind::AggTrades,
            DataKind::OpenInterest,
            DataKind::Funding,
        ]
    }
}

impl std::fmt::Display for DataKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized kline record
///
/// Keyed by `open_time` (epoch milliseconds) within one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    /// Bar open time, epoch ms (natural key)
    pub open_time: i64,
    /// Bar close time, epoch ms
    pub close_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    /// Base-asset volume
    pub volume: Decimal,
    /// Quote-asset volume
    pub quote_volume: Decimal,
    pub trade_count: i64,
    pub taker_buy_volume: Decimal,
    pub taker_buy_quote_volume: Decimal,
}

/// Aggregated trade print
///
/// Keyed by `agg_trade_id` within one symbol. An aggregate trade may combine
/// several fills at the same price from the same taker order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggTrade {
    pub symbol: String,
    /// Aggregate trade id (natural key)
    pub agg_trade_id: i64,
    pub price: Decimal,
    pub quantity: Decimal,
    pub first_trade_id: i64,
    pub last_trade_id: i64,
    /// Trade time, epoch ms
    pub timestamp: i64,
    pub is_buyer_maker: bool,
}

/// Open interest sample
///
/// Keyed by `timestamp` (sampling instant, epoch ms) within one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenInterestSample {
    pub symbol: String,
    /// Sampling instant, epoch ms (natural key)
    pub timestamp: i64,
    pub sum_open_interest: Decimal,
    pub sum_open_interest_value: Decimal,
}

/// Funding rate observation
///
/// Keyed by `funding_time` (epoch ms) within one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingRate {
    pub symbol: String,
    /// Funding settlement time, epoch ms (natural key)
    pub funding_time: i64,
    pub funding_rate: Decimal,
    pub mark_price: Decimal,
    pub index_price: Decimal,
}

/// A record with an integer natural key, unique per symbol and kind
pub trait KeyedRecord: Clone + PartialEq + Send + Sync {
    /// The data kind this record belongs to
    const KIND: DataKind;

    /// Natural key within (symbol, kind)
    fn key(&self) -> i64;
}

impl KeyedRecord for Candle {
    const KIND: DataKind = DataKind::Candles;

    fn key(&self) -> i64 {
        self.open_time
    }
}

impl KeyedRecord for AggTrade {
    const KIND: DataKind = DataKind::AggTrades;

    fn key(&self) -> i64 {
        self.agg_trade_id
    }
}

impl KeyedRecord for OpenInterestSample {
    const KIND: DataKind = DataKind::OpenInterest;

    fn key(&self) -> i64 {
        self.timestamp
    }
}

impl KeyedRecord for FundingRate {
    const KIND: DataKind = DataKind::Funding;

    fn key(&self) -> i64 {
        self.funding_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn sample_candle() -> Candle {
        Candle {
            symbol: "BTCUSDT".to_string(),
            open_time: 1_700_000_000_000,
            close_time: 1_700_000_000_059,
            open: Decimal::from_str("30000.0").unwrap(),
            high: Decimal::from_str("30100.0").unwrap(),
            low: Decimal::from_str("29900.0").unwrap(),
            close: Decimal::from_str("30050.0").unwrap(),
            volume: Decimal::from_str("150.0").unwrap(),
            quote_volume: Decimal::from_str("200.0").unwrap(),
            trade_count: 42,
            taker_buy_volume: Decimal::from_str("75.0").unwrap(),
            taker_buy_quote_volume: Decimal::from_str("120.0").unwrap(),
        }
    }

    #[test]
    fn test_candle_key_is_open_time() {
        let candle = sample_candle();
        assert_eq!(candle.key(), 1_700_000_000_000);
        assert_eq!(Candle::KIND, DataKind::Candles);
    }

    #[test]
    fn test_candle_json_roundtrip_preserves_equality() {
        let candle = sample_candle();
        let json = serde_json::to_string(&candle).unwrap();
        let back: Candle = serde_json::from_str(&json).unwrap();
        assert_eq!(candle, back);
    }

    #[test]
    fn test_data_kind_names() {
        assert_eq!(DataKind::Candles.as_str(), "candles");
        assert_eq!(DataKind::AggTrades.as_str(), "agg_trades");
        assert_eq!(DataKind::OpenInterest.to_string(), "open_interest");
        assert_eq!(DataKind::all().len(), 4);
    }
}

//! Binance wire payload types
//!
//! Deserialization targets for the futures REST and WebSocket APIs, with
//! validating conversions into the normalized records. Payloads missing
//! required fields are rejected here so partial records never propagate.

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;
use thiserror::Error;

use crate::schema::{AggTrade, Candle, FundingRate, OpenInterestSample};

/// A wire row that cannot be normalized
#[derive(Error, Debug)]
pub enum WireError {
    #[error("kline payload has {actual} fields, expected at least {expected}")]
    Truncated { expected: usize, actual: usize },

    #[error("invalid value in field {0}")]
    InvalidField(&'static str),

    #[error("row is not a JSON object or array")]
    NotARow,
}

/// Aggregate trade message, shared by the WebSocket stream and
/// `/fapi/v1/aggTrades`
#[derive(Debug, Clone, Deserialize)]
pub struct AggTradeMessage {
    #[serde(rename = "a")]
    pub agg_trade_id: i64,
    #[serde(rename = "p")]
    pub price: Decimal,
    #[serde(rename = "q")]
    pub quantity: Decimal,
    #[serde(rename = "f")]
    pub first_trade_id: i64,
    #[serde(rename = "l")]
    pub last_trade_id: i64,
    #[serde(rename = "T")]
    pub timestamp: i64,
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

impl AggTradeMessage {
    /// Attach the subscribed symbol and produce the normalized record
    pub fn into_trade(self, symbol: &str) -> AggTrade {
        AggTrade {
            symbol: symbol.to_uppercase(),
            agg_trade_id: self.agg_trade_id,
            price: self.price,
            quantity: self.quantity,
            first_trade_id: self.first_trade_id,
            last_trade_id: self.last_trade_id,
            timestamp: self.timestamp,
            is_buyer_maker: self.is_buyer_maker,
        }
    }
}

/// Combined-stream envelope (`{"stream": ..., "data": {...}}`)
#[derive(Debug, Deserialize)]
pub struct StreamEnvelope {
    #[allow(dead_code)]
    pub stream: String,
    pub data: AggTradeMessage,
}

/// Open-interest history row from `/futures/data/openInterestHist`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInterestRow {
    #[serde(default)]
    pub symbol: Option<String>,
    pub sum_open_interest: Decimal,
    pub sum_open_interest_value: Decimal,
    pub timestamp: i64,
}

impl OpenInterestRow {
    pub fn into_sample(self, symbol: &str) -> OpenInterestSample {
        OpenInterestSample {
            symbol: symbol.to_uppercase(),
            timestamp: self.timestamp,
            sum_open_interest: self.sum_open_interest,
            sum_open_interest_value: self.sum_open_interest_value,
        }
    }
}

/// Funding-rate history row from `/fapi/v1/fundingRate`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingRateRow {
    #[serde(default)]
    pub symbol: Option<String>,
    pub funding_rate: Decimal,
    pub funding_time: i64,
    pub mark_price: Decimal,
    pub index_price: Decimal,
}

impl FundingRateRow {
    pub fn into_rate(self, symbol: &str) -> FundingRate {
        FundingRate {
            symbol: symbol.to_uppercase(),
            funding_time: self.funding_time,
            funding_rate: self.funding_rate,
            mark_price: self.mark_price,
            index_price: self.index_price,
        }
    }
}

/// Build a candle from a fixed-position kline array
///
/// Layout: [open_time, open, high, low, close, volume, close_time,
/// quote_volume, trade_count, taker_buy_volume, taker_buy_quote_volume, ...].
/// Numeric fields arrive as JSON strings; times and counts as integers.
pub fn candle_from_kline(symbol: &str, row: &Value) -> Result<Candle, WireError> {
    let fields = row.as_array().ok_or(WireError::NotARow)?;
    if fields.len() < 11 {
        return Err(WireError::Truncated {
            expected: 11,
            actual: fields.len(),
        });
    }
    Ok(Candle {
        symbol: symbol.to_uppercase(),
        open_time: int_field(&fields[0], "open_time")?,
        open: decimal_field(&fields[1], "open")?,
        high: decimal_field(&fields[2], "high")?,
        low: decimal_field(&fields[3], "low")?,
        close: decimal_field(&fields[4], "close")?,
        volume: decimal_field(&fields[5], "volume")?,
        close_time: int_field(&fields[6], "close_time")?,
        quote_volume: decimal_field(&fields[7], "quote_volume")?,
        trade_count: int_field(&fields[8], "trade_count")?,
        taker_buy_volume: decimal_field(&fields[9], "taker_buy_volume")?,
        taker_buy_quote_volume: decimal_field(&fields[10], "taker_buy_quote_volume")?,
    })
}

fn int_field(value: &Value, name: &'static str) -> Result<i64, WireError> {
    match value {
        Value::Number(n) => n.as_i64().ok_or(WireError::InvalidField(name)),
        Value::String(s) => s.parse().map_err(|_| WireError::InvalidField(name)),
        _ => Err(WireError::InvalidField(name)),
    }
}

fn decimal_field(value: &Value, name: &'static str) -> Result<Decimal, WireError> {
    match value {
        Value::String(s) => Decimal::from_str(s).map_err(|_| WireError::InvalidField(name)),
        Value::Number(n) => {
            Decimal::from_str(&n.to_string()).map_err(|_| WireError::InvalidField(name))
        }
        _ => Err(WireError::InvalidField(name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_candle_from_kline_row() {
        let row = json!([
            1_700_000_000_000i64,
            "30000.0",
            "30100.0",
            "29900.0",
            "30050.0",
            "150.0",
            1_700_000_000_059i64,
            "200.0",
            42,
            "75.0",
            "120.0",
            "0"
        ]);
        let candle = candle_from_kline("btcusdt", &row).unwrap();
        assert_eq!(candle.symbol, "BTCUSDT");
        assert_eq!(candle.open_time, 1_700_000_000_000);
        assert_eq!(candle.close_time, 1_700_000_000_059);
        assert_eq!(candle.open, Decimal::from_str("30000.0").unwrap());
        assert_eq!(candle.trade_count, 42);
        assert_eq!(
            candle.taker_buy_quote_volume,
            Decimal::from_str("120.0").unwrap()
        );
    }

    #[test]
    fn test_candle_from_truncated_kline_fails() {
        let row = json!([1_700_000_000_000i64, "30000.0", "30100.0"]);
        assert!(matches!(
            candle_from_kline("BTCUSDT", &row),
            Err(WireError::Truncated { actual: 3, .. })
        ));
    }

    #[test]
    fn test_candle_from_non_array_fails() {
        let row = json!({"open_time": 1});
        assert!(matches!(
            candle_from_kline("BTCUSDT", &row),
            Err(WireError::NotARow)
        ));
    }

    #[test]
    fn test_parse_agg_trade_message() {
        let json = r#"{
            "e": "aggTrade",
            "E": 1700000000100,
            "s": "BTCUSDT",
            "a": 1234,
            "p": "30000.0",
            "q": "0.5",
            "f": 100,
            "l": 101,
            "T": 1700000000000,
            "m": true
        }"#;
        let msg: AggTradeMessage = serde_json::from_str(json).unwrap();
        let trade = msg.into_trade("btcusdt");
        assert_eq!(trade.symbol, "BTCUSDT");
        assert_eq!(trade.agg_trade_id, 1234);
        assert_eq!(trade.price, Decimal::from_str("30000.0").unwrap());
        assert!(trade.is_buyer_maker);
    }

    #[test]
    fn test_agg_trade_missing_field_fails() {
        let json = r#"{"a": 1234, "p": "30000.0"}"#;
        assert!(serde_json::from_str::<AggTradeMessage>(json).is_err());
    }

    #[test]
    fn test_parse_stream_envelope() {
        let json = r#"{
            "stream": "btcusdt@aggTrade",
            "data": {
                "a": 7, "p": "1.5", "q": "2", "f": 1, "l": 2,
                "T": 1700000000000, "m": false
            }
        }"#;
        let envelope: StreamEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.data.agg_trade_id, 7);
        assert!(!envelope.data.is_buyer_maker);
    }

    #[test]
    fn test_parse_open_interest_row() {
        let json = r#"{
            "symbol": "BTCUSDT",
            "sumOpenInterest": "12345.6",
            "sumOpenInterestValue": "345.67",
            "timestamp": 1700000000000
        }"#;
        let row: OpenInterestRow = serde_json::from_str(json).unwrap();
        let sample = row.into_sample("BTCUSDT");
        assert_eq!(sample.timestamp, 1_700_000_000_000);
        assert_eq!(
            sample.sum_open_interest,
            Decimal::from_str("12345.6").unwrap()
        );
    }

    #[test]
    fn test_parse_funding_rate_row() {
        let json = r#"{
            "symbol": "BTCUSDT",
            "fundingRate": "0.00025",
            "fundingTime": 1700000000000,
            "markPrice": "30050.0",
            "indexPrice": "30040.0"
        }"#;
        let row: FundingRateRow = serde_json::from_str(json).unwrap();
        let rate = row.into_rate("BTCUSDT");
        assert_eq!(rate.funding_time, 1_700_000_000_000);
        assert_eq!(rate.funding_rate, Decimal::from_str("0.00025").unwrap());
        assert_eq!(rate.mark_price, Decimal::from_str("30050.0").unwrap());
    }
}

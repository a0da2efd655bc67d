//! Binance aggregate-trade WebSocket streamer
//!
//! One connection per symbol on `{base}/ws/{symbol}@aggTrade`. The producer
//! task owns the connection and every reconnect decision: any failure,
//! including a clean remote close, waits the next backoff delay (or shutdown,
//! whichever first) and reconnects. Only the shutdown token or a dropped
//! receiver ends the stream.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::config::BinanceSettings;
use crate::provider::TradeStreamer;
use crate::schema::AggTrade;

use super::types::{AggTradeMessage, StreamEnvelope};

const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_FACTOR: f64 = 2.0;
const RECONNECT_MAX: Duration = Duration::from_secs(30);
const CHANNEL_CAPACITY: usize = 256;

/// Live aggregate-trade feed
pub struct BinanceAggTradeStream {
    ws_url: String,
}

impl BinanceAggTradeStream {
    pub fn new(settings: &BinanceSettings) -> Self {
        Self {
            ws_url: settings.ws_url.trim_end_matches('/').to_string(),
        }
    }
}

impl TradeStreamer for BinanceAggTradeStream {
    fn subscribe(&self, symbol: &str, shutdown: CancellationToken) -> mpsc::Receiver<AggTrade> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let url = format!("{}/ws/{}@aggTrade", self.ws_url, symbol.to_lowercase());
        let symbol = symbol.to_uppercase();
        tokio::spawn(async move {
            run_stream(url, symbol, tx, shutdown).await;
        });
        rx
    }
}

async fn run_stream(
    url: String,
    symbol: String,
    tx: mpsc::Sender<AggTrade>,
    shutdown: CancellationToken,
) {
    // Reconnect ladder spans the whole subscription; reset on each successful
    // connection.
    let mut backoff = ExponentialBackoff::new(RECONNECT_INITIAL, RECONNECT_FACTOR, RECONNECT_MAX)
        .expect("reconnect backoff constants are valid");

    while !shutdown.is_cancelled() {
        match connect_async(&url).await {
            Ok((ws_stream, _)) => {
                info!(%symbol, %url, "trade stream connected");
                backoff.reset();
                let (mut write, mut read) = ws_stream.split();
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            let _ = write.send(Message::Close(None)).await;
                            info!(%symbol, "trade stream stopped");
                            return;
                        }
                        msg = read.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                if let Some(trade) = decode_agg_trade(&symbol, &text) {
                                    if tx.send(trade).await.is_err() {
                                        debug!(%symbol, "trade receiver dropped, ending stream");
                                        return;
                                    }
                                }
                            }
                            Some(Ok(Message::Ping(payload))) => {
                                if let Err(err) = write.send(Message::Pong(payload)).await {
                                    warn!(%symbol, error = %err, "failed to answer ping");
                                }
                            }
                            Some(Ok(Message::Close(frame))) => {
                                warn!(%symbol, ?frame, "trade stream closed by server");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                warn!(%symbol, error = %err, "trade stream error");
                                break;
                            }
                            None => {
                                warn!(%symbol, "trade stream ended");
                                break;
                            }
                        }
                    }
                }
            }
            Err(err) => {
                warn!(%symbol, error = %err, "trade stream connect failed");
            }
        }

        let delay = backoff.next_delay();
        debug!(%symbol, delay_ms = delay.as_millis() as u64, "reconnecting trade stream");
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(delay) => {}
        }
    }
}

/// Decode one WebSocket text frame into a trade
///
/// Accepts either a raw aggTrade object or the combined-stream envelope.
/// Undecodable or incomplete frames are skipped, never fatal.
fn decode_agg_trade(symbol: &str, text: &str) -> Option<AggTrade> {
    if let Ok(envelope) = serde_json::from_str::<StreamEnvelope>(text) {
        return Some(envelope.data.into_trade(symbol));
    }
    match serde_json::from_str::<AggTradeMessage>(text) {
        Ok(msg) => Some(msg.into_trade(symbol)),
        Err(err) => {
            debug!(symbol, error = %err, "skipping undecodable stream frame");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    const RAW: &str = r#"{
        "e": "aggTrade", "E": 1700000000100, "s": "BTCUSDT",
        "a": 1234, "p": "30000.0", "q": "0.5",
        "f": 100, "l": 101, "T": 1700000000000, "m": true
    }"#;

    #[test]
    fn test_decode_raw_frame() {
        let trade = decode_agg_trade("BTCUSDT", RAW).unwrap();
        assert_eq!(trade.agg_trade_id, 1234);
        assert_eq!(trade.price, Decimal::from_str("30000.0").unwrap());
        assert!(trade.is_buyer_maker);
    }

    #[test]
    fn test_decode_enveloped_frame() {
        let enveloped = format!(r#"{{"stream": "btcusdt@aggTrade", "data": {}}}"#, RAW);
        let trade = decode_agg_trade("btcusdt", &enveloped).unwrap();
        assert_eq!(trade.symbol, "BTCUSDT");
        assert_eq!(trade.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn test_decode_skips_incomplete_frame() {
        assert!(decode_agg_trade("BTCUSDT", r#"{"a": 1, "p": "2.0"}"#).is_none());
    }

    #[test]
    fn test_decode_skips_malformed_frame() {
        assert!(decode_agg_trade("BTCUSDT", "not json").is_none());
        assert!(decode_agg_trade("BTCUSDT", r#"{"result": null, "id": 1}"#).is_none());
    }
}

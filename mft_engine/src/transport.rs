/// transport.rs — Bybit v5 public WebSocket market-data collector
///
/// Reconnect loop grounded in the pack's `BinanceWebSocketClient` pattern
/// (connect, subscribe, read-until-error, backoff, reconnect), adapted to
/// Bybit v5's combined trade/orderbook topic stream and envelope shape.
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use crate::types::{Quote, Trade};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub enum MarketEvent {
    Trade(Trade),
    Quote(Quote),
}

#[derive(Deserialize, Debug)]
struct Envelope {
    topic: Option<String>,
    data: Option<serde_json::Value>,
}

#[derive(Deserialize, Debug)]
struct PublicTradeEntry {
    #[serde(rename = "T")]
    ts_ms: i64,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "v")]
    size: String,
}

#[derive(Deserialize, Debug)]
struct OrderbookLevel1 {
    #[serde(default)]
    b: Vec<[String; 2]>,
    #[serde(default)]
    a: Vec<[String; 2]>,
}

pub struct BybitMarketDataClient {
    ws_base_url: String,
    symbol: String,
}

impl BybitMarketDataClient {
    pub fn new(ws_base_url: String, symbol: String) -> Self {
        Self { ws_base_url, symbol }
    }

    /// Runs forever, reconnecting with exponential backoff on every drop.
    /// Returns only if `tx` is closed (the consumer shut down).
    pub async fn run(&self, tx: mpsc::Sender<MarketEvent>) -> Result<()> {
        let mut backoff = INITIAL_BACKOFF;
        let mut last_quote: Option<Quote> = None;

        loop {
            match self.connect_and_stream(&tx, &mut last_quote).await {
                Ok(()) => {
                    info!("bybit market data stream closed, reconnecting");
                }
                Err(e) => {
                    warn!("bybit market data stream error: {e:#}, reconnecting in {backoff:?}");
                }
            }
            if tx.is_closed() {
                return Ok(());
            }
            tokio::time::sleep(backoff).await;
            backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
        }
    }

    async fn connect_and_stream(&self, tx: &mpsc::Sender<MarketEvent>, last_quote: &mut Option<Quote>) -> Result<()> {
        let (mut ws, _) = connect_async(&self.ws_base_url).await.context("connecting to bybit websocket")?;

        let sub = json!({
            "op": "subscribe",
            "args": [format!("publicTrade.{}", self.symbol), format!("orderbook.1.{}", self.symbol)],
        });
        ws.send(Message::Text(sub.to_string())).await.context("sending subscribe frame")?;
        info!("subscribed to bybit streams for {}", self.symbol);

        // connected: reset backoff happens implicitly in run() since this
        // function only returns once the connection has actually dropped.
        while let Some(msg) = ws.next().await {
            let msg = msg.context("reading websocket frame")?;
            match msg {
                Message::Text(text) => {
                    if let Some(event) = Self::parse_frame(&text, last_quote) {
                        if tx.send(event).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Message::Ping(payload) => {
                    ws.send(Message::Pong(payload)).await.ok();
                }
                Message::Close(frame) => {
                    warn!("bybit websocket closed: {frame:?}");
                    break;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn parse_frame(text: &str, last_quote: &mut Option<Quote>) -> Option<MarketEvent> {
        let envelope: Envelope = serde_json::from_str(text).ok()?;
        let topic = envelope.topic?;
        let data = envelope.data?;

        if topic.starts_with("publicTrade") {
            let entries: Vec<PublicTradeEntry> = serde_json::from_value(data).ok()?;
            let entry = entries.into_iter().next()?;
            Some(MarketEvent::Trade(Trade {
                ts_ms: entry.ts_ms,
                price: entry.price.parse().ok()?,
                size: entry.size.parse().ok()?,
            }))
        } else if topic.starts_with("orderbook.1") {
            let book: OrderbookLevel1 = serde_json::from_value(data).ok()?;
            let prev = last_quote.clone();
            let bid = book.b.first().and_then(|lvl| Some((lvl[0].parse::<f64>().ok()?, lvl[1].parse::<f64>().ok()?)));
            let ask = book.a.first().and_then(|lvl| Some((lvl[0].parse::<f64>().ok()?, lvl[1].parse::<f64>().ok()?)));
            let (bid_px, bid_sz) = bid.or_else(|| prev.as_ref().map(|q| (q.bid_px, q.bid_sz)))?;
            let (ask_px, ask_sz) = ask.or_else(|| prev.as_ref().map(|q| (q.ask_px, q.ask_sz)))?;
            let quote = Quote { ts_ms: chrono::Utc::now().timestamp_millis(), bid_px, bid_sz, ask_px, ask_sz };
            *last_quote = Some(quote);
            Some(MarketEvent::Quote(quote))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_public_trade_frame() {
        let text = r#"{"topic":"publicTrade.BTCUSDT","type":"snapshot","data":[{"T":1700000000000,"s":"BTCUSDT","S":"Buy","v":"0.5","p":"42000.5"}]}"#;
        let mut last_quote = None;
        let event = BybitMarketDataClient::parse_frame(text, &mut last_quote).unwrap();
        match event {
            MarketEvent::Trade(t) => {
                assert_eq!(t.ts_ms, 1_700_000_000_000);
                assert!((t.price - 42_000.5).abs() < 1e-9);
                assert!((t.size - 0.5).abs() < 1e-9);
            }
            _ => panic!("expected a trade event"),
        }
    }

    #[test]
    fn parses_orderbook_level1_frame() {
        let text = r#"{"topic":"orderbook.1.BTCUSDT","type":"snapshot","data":{"s":"BTCUSDT","b":[["41999.9","2.0"]],"a":[["42000.1","1.5"]]}}"#;
        let mut last_quote = None;
        let event = BybitMarketDataClient::parse_frame(text, &mut last_quote).unwrap();
        match event {
            MarketEvent::Quote(q) => {
                assert!((q.bid_px - 41_999.9).abs() < 1e-9);
                assert!((q.ask_px - 42_000.1).abs() < 1e-9);
            }
            _ => panic!("expected a quote event"),
        }
        assert!(last_quote.is_some());
    }

    #[test]
    fn partial_delta_without_bid_falls_back_to_last_quote() {
        let mut last_quote = Some(Quote { ts_ms: 0, bid_px: 100.0, bid_sz: 1.0, ask_px: 100.2, ask_sz: 1.0 });
        let text = r#"{"topic":"orderbook.1.BTCUSDT","type":"delta","data":{"s":"BTCUSDT","b":[],"a":[["100.3","2.0"]]}}"#;
        let event = BybitMarketDataClient::parse_frame(text, &mut last_quote).unwrap();
        match event {
            MarketEvent::Quote(q) => {
                assert!((q.bid_px - 100.0).abs() < 1e-9, "missing bid side should carry forward");
                assert!((q.ask_px - 100.3).abs() < 1e-9);
            }
            _ => panic!("expected a quote event"),
        }
    }
}

/// execution.rs — C6: order placement, seen by the core as a narrow trait
///
/// Signing scheme and endpoint layout grounded in `live.rs`'s Binance
/// signed-REST client, adapted to Bybit v5's header-based HMAC signature
/// (`timestamp || api_key || recv_window || body`) instead of a
/// query-string-embedded one. `PaperExecutionAdapter` needs no network and
/// fills deterministically off the quote it's given.
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::types::{PositionSide, Quote};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub success: bool,
    pub filled_price: Option<f64>,
    pub filled_qty: Option<f64>,
    pub error: Option<String>,
}

impl ExecutionResult {
    fn filled(price: f64, qty: f64) -> Self {
        Self { success: true, filled_price: Some(price), filled_qty: Some(qty), error: None }
    }

    fn rejected(msg: impl Into<String>) -> Self {
        Self { success: false, filled_price: None, filled_qty: None, error: Some(msg.into()) }
    }
}

/// Contract the core depends on; swappable between a real exchange and a
/// deterministic paper fill without either side of the pipeline changing.
#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn enter_position(
        &self,
        side: PositionSide,
        size: f64,
        limit_price: Option<f64>,
        quote: Option<Quote>,
    ) -> Result<ExecutionResult>;
    async fn exit_position(&self, side: PositionSide, size: f64, quote: Option<Quote>) -> Result<ExecutionResult>;
    async fn cancel_order(&self, order_id: &str) -> Result<bool>;
}

// ── Bybit v5 live adapter ───────────────────────────────────────────────

#[derive(Deserialize, Debug)]
struct BybitEnvelope<T> {
    #[serde(rename = "retCode")]
    ret_code: i32,
    #[serde(rename = "retMsg")]
    ret_msg: String,
    result: Option<T>,
}

#[derive(Deserialize, Debug)]
struct OrderCreateResult {
    #[serde(rename = "orderId")]
    order_id: String,
}

#[derive(Deserialize, Debug, Clone)]
struct OrderRealtimeEntry {
    #[serde(rename = "orderId")]
    order_id: String,
    #[serde(rename = "orderStatus")]
    order_status: String,
    #[serde(rename = "avgPrice")]
    avg_price: String,
    #[serde(rename = "cumExecQty")]
    cum_exec_qty: String,
}

#[derive(Deserialize, Debug)]
struct OrderRealtimeResult {
    list: Vec<OrderRealtimeEntry>,
}

pub struct BybitExecutionAdapter {
    client: Client,
    api_key: String,
    api_secret: String,
    base_url: String,
    symbol: String,
    recv_window_ms: i64,
    limit_order_timeout_secs: f64,
}

impl BybitExecutionAdapter {
    pub fn new(api_key: String, api_secret: String, base_url: String, symbol: String, limit_order_timeout_minutes: f64) -> Self {
        let client = Client::builder().timeout(Duration::from_secs(10)).build().expect("HTTP client build failed");
        Self {
            client,
            api_key,
            api_secret,
            base_url,
            symbol,
            recv_window_ms: 5_000,
            limit_order_timeout_secs: limit_order_timeout_minutes * 60.0,
        }
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn sign(&self, timestamp: i64, payload: &str) -> String {
        let prehash = format!("{}{}{}{}", timestamp, self.api_key, self.recv_window_ms, payload);
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes()).expect("HMAC key error");
        mac.update(prehash.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        let ts = Self::now_ms();
        let payload = body.to_string();
        let signature = self.sign(ts, &payload);
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .client
            .post(&url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", ts.to_string())
            .header("X-BAPI-RECV-WINDOW", self.recv_window_ms.to_string())
            .header("X-BAPI-SIGN", signature)
            .header("Content-Type", "application/json")
            .body(payload)
            .send()
            .await
            .with_context(|| format!("POST {path} failed"))?;

        let value: serde_json::Value = resp.json().await.with_context(|| format!("parsing response from {path}"))?;
        Ok(value)
    }

    async fn get(&self, path: &str, query: &str) -> Result<serde_json::Value> {
        let ts = Self::now_ms();
        let signature = self.sign(ts, query);
        let url = format!("{}{}?{}", self.base_url, path, query);

        let resp = self
            .client
            .get(&url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", ts.to_string())
            .header("X-BAPI-RECV-WINDOW", self.recv_window_ms.to_string())
            .header("X-BAPI-SIGN", signature)
            .send()
            .await
            .with_context(|| format!("GET {path} failed"))?;

        let value: serde_json::Value = resp.json().await.with_context(|| format!("parsing response from {path}"))?;
        Ok(value)
    }

    fn side_str(side: PositionSide) -> &'static str {
        match side {
            PositionSide::Long => "Buy",
            PositionSide::Short => "Sell",
        }
    }

    async fn place_order(&self, side: PositionSide, size: f64, limit_price: Option<f64>) -> Result<String> {
        let mut body = json!({
            "category": "linear",
            "symbol": self.symbol,
            "side": Self::side_str(side),
            "orderType": if limit_price.is_some() { "Limit" } else { "Market" },
            "qty": format!("{size}"),
        });
        if let Some(px) = limit_price {
            body["price"] = json!(format!("{px}"));
            body["timeInForce"] = json!("PostOnly");
        } else {
            body["timeInForce"] = json!("IOC");
        }

        let raw = self.post("/v5/order/create", &body).await?;
        let envelope: BybitEnvelope<OrderCreateResult> =
            serde_json::from_value(raw).context("decoding order/create envelope")?;
        if envelope.ret_code != 0 {
            anyhow::bail!(EngineError::ExecutionReject(envelope.ret_msg));
        }
        Ok(envelope.result.map(|r| r.order_id).unwrap_or_default())
    }

    async fn poll_order(&self, order_id: &str) -> Result<Option<OrderRealtimeEntry>> {
        let query = format!("category=linear&symbol={}&orderId={}", self.symbol, order_id);
        let raw = self.get("/v5/order/realtime", &query).await?;
        let envelope: BybitEnvelope<OrderRealtimeResult> =
            serde_json::from_value(raw).context("decoding order/realtime envelope")?;
        if envelope.ret_code != 0 {
            anyhow::bail!(EngineError::TransientTransport(envelope.ret_msg));
        }
        Ok(envelope.result.and_then(|r| r.list.into_iter().find(|o| o.order_id == order_id)))
    }

    async fn cancel(&self, order_id: &str) -> Result<()> {
        let body = json!({ "category": "linear", "symbol": self.symbol, "orderId": order_id });
        let raw = self.post("/v5/order/cancel", &body).await?;
        let envelope: BybitEnvelope<serde_json::Value> =
            serde_json::from_value(raw).context("decoding order/cancel envelope")?;
        if envelope.ret_code != 0 {
            warn!("cancel {order_id} returned {}", envelope.ret_msg);
        }
        Ok(())
    }

    /// Place a limit order, poll at 0.5s cadence up to the configured
    /// timeout, and fall back to a market order if it never fills.
    async fn limit_with_timeout_fallback(&self, side: PositionSide, size: f64, limit_price: f64) -> Result<ExecutionResult> {
        let order_id = self.place_order(side, size, Some(limit_price)).await?;
        let deadline = self.limit_order_timeout_secs;
        let mut elapsed = 0.0_f64;

        while elapsed < deadline {
            sleep(Duration::from_millis(500)).await;
            elapsed += 0.5;

            match self.poll_order(&order_id).await {
                Ok(Some(entry)) if entry.order_status == "Filled" => {
                    let price: f64 = entry.avg_price.parse().unwrap_or(limit_price);
                    let qty: f64 = entry.cum_exec_qty.parse().unwrap_or(size);
                    return Ok(ExecutionResult::filled(price, qty));
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!("poll_order failed, retrying: {e:#}");
                    continue;
                }
            }
        }

        info!("limit order {order_id} timed out after {deadline}s, falling back to market");
        self.cancel(&order_id).await.ok();
        let market_order_id = self.place_order(side, size, None).await?;
        match self.poll_order(&market_order_id).await? {
            Some(entry) if entry.order_status == "Filled" => {
                let price: f64 = entry.avg_price.parse().unwrap_or(limit_price);
                let qty: f64 = entry.cum_exec_qty.parse().unwrap_or(size);
                Ok(ExecutionResult::filled(price, qty))
            }
            _ => Ok(ExecutionResult::rejected("market fallback did not report a fill")),
        }
    }
}

#[async_trait]
impl ExecutionAdapter for BybitExecutionAdapter {
    async fn start(&self) -> Result<()> {
        info!("bybit execution adapter ready for {}", self.symbol);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn enter_position(
        &self,
        side: PositionSide,
        size: f64,
        limit_price: Option<f64>,
        _quote: Option<Quote>,
    ) -> Result<ExecutionResult> {
        match limit_price {
            Some(px) => self.limit_with_timeout_fallback(side, size, px).await,
            None => {
                let order_id = self.place_order(side, size, None).await?;
                match self.poll_order(&order_id).await? {
                    Some(entry) if entry.order_status == "Filled" => {
                        let price: f64 = entry.avg_price.parse().unwrap_or(0.0);
                        let qty: f64 = entry.cum_exec_qty.parse().unwrap_or(size);
                        Ok(ExecutionResult::filled(price, qty))
                    }
                    _ => Ok(ExecutionResult::rejected("market order did not report a fill")),
                }
            }
        }
    }

    async fn exit_position(&self, side: PositionSide, size: f64, _quote: Option<Quote>) -> Result<ExecutionResult> {
        // exits are always reduce-only market orders: an opposite-side fill
        let closing_side = match side {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        };
        let order_id = self.place_order(closing_side, size, None).await?;
        match self.poll_order(&order_id).await? {
            Some(entry) if entry.order_status == "Filled" => {
                let price: f64 = entry.avg_price.parse().unwrap_or(0.0);
                let qty: f64 = entry.cum_exec_qty.parse().unwrap_or(size);
                Ok(ExecutionResult::filled(price, qty))
            }
            _ => Ok(ExecutionResult::rejected("exit market order did not report a fill")),
        }
    }

    async fn cancel_order(&self, order_id: &str) -> Result<bool> {
        self.cancel(order_id).await?;
        Ok(true)
    }
}

// ── Paper adapter ────────────────────────────────────────────────────────

/// Deterministic fill at quote touch plus slippage; entry and exit slippage
/// configured independently so a backtest can model asymmetric impact.
pub struct PaperExecutionAdapter {
    tick_size: f64,
    slippage_ticks_entry: f64,
    slippage_ticks_exit: f64,
}

impl PaperExecutionAdapter {
    pub fn new(tick_size: f64, slippage_ticks_entry: f64, slippage_ticks_exit: f64) -> Self {
        Self { tick_size, slippage_ticks_entry, slippage_ticks_exit }
    }

    fn touch_price(side: PositionSide, quote: &Quote, is_entry: bool) -> f64 {
        // entering long or exiting short buys at the ask; the mirror sells at the bid.
        let buys = (is_entry && side == PositionSide::Long) || (!is_entry && side == PositionSide::Short);
        if buys { quote.ask_px } else { quote.bid_px }
    }

    fn fill_price(&self, side: PositionSide, quote: &Quote, is_entry: bool) -> f64 {
        let touch = Self::touch_price(side, quote, is_entry);
        let slip_ticks = if is_entry { self.slippage_ticks_entry } else { self.slippage_ticks_exit };
        let slip = slip_ticks * self.tick_size;
        let buys = (is_entry && side == PositionSide::Long) || (!is_entry && side == PositionSide::Short);
        if buys { touch + slip } else { touch - slip }
    }
}

#[async_trait]
impl ExecutionAdapter for PaperExecutionAdapter {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn enter_position(
        &self,
        side: PositionSide,
        size: f64,
        _limit_price: Option<f64>,
        quote: Option<Quote>,
    ) -> Result<ExecutionResult> {
        match quote {
            Some(q) => Ok(ExecutionResult::filled(self.fill_price(side, &q, true), size)),
            None => Ok(ExecutionResult::rejected("no quote to fill against")),
        }
    }

    async fn exit_position(&self, side: PositionSide, size: f64, quote: Option<Quote>) -> Result<ExecutionResult> {
        match quote {
            Some(q) => Ok(ExecutionResult::filled(self.fill_price(side, &q, false), size)),
            None => Ok(ExecutionResult::rejected("no quote to fill against")),
        }
    }

    async fn cancel_order(&self, _order_id: &str) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(bid: f64, ask: f64) -> Quote {
        Quote { ts_ms: 0, bid_px: bid, bid_sz: 1.0, ask_px: ask, ask_sz: 1.0 }
    }

    #[tokio::test]
    async fn paper_long_entry_fills_at_ask_plus_slippage() {
        let adapter = PaperExecutionAdapter::new(0.1, 2.0, 2.0);
        let result = adapter
            .enter_position(PositionSide::Long, 1.0, None, Some(quote(99.9, 100.1)))
            .await
            .unwrap();
        assert!((result.filled_price.unwrap() - 100.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn paper_long_exit_fills_at_bid_minus_slippage() {
        let adapter = PaperExecutionAdapter::new(0.1, 2.0, 2.0);
        let result = adapter
            .exit_position(PositionSide::Long, 1.0, Some(quote(99.9, 100.1)))
            .await
            .unwrap();
        assert!((result.filled_price.unwrap() - 99.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn paper_rejects_without_quote() {
        let adapter = PaperExecutionAdapter::new(0.1, 1.0, 1.0);
        let result = adapter.enter_position(PositionSide::Short, 1.0, None, None).await.unwrap();
        assert!(!result.success);
    }
}

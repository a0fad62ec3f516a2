/// types.rs — Core data model
///
/// Entities shared by every pipeline stage. Prices are positive reals,
/// sizes non-negative, timestamps integer milliseconds since epoch.
use serde::{Deserialize, Serialize};

/// A single executed trade.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub ts_ms: i64,
    pub price: f64,
    pub size: f64,
}

/// Best bid/ask snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub ts_ms: i64,
    pub bid_px: f64,
    pub bid_sz: f64,
    pub ask_px: f64,
    pub ask_sz: f64,
}

impl Quote {
    pub fn mid(&self) -> f64 {
        (self.bid_px + self.ask_px) / 2.0
    }

    pub fn spread(&self) -> f64 {
        self.ask_px - self.bid_px
    }

    /// (bid_sz - ask_sz) / (bid_sz + ask_sz), 0 when both sides are empty.
    pub fn qimb(&self) -> f64 {
        let denom = self.bid_sz + self.ask_sz;
        if denom > 1e-12 {
            (self.bid_sz - self.ask_sz) / denom
        } else {
            0.0
        }
    }

    /// Is this quote too old to classify a trade against?
    pub fn is_stale(&self, at_ts_ms: i64, max_staleness_ms: i64) -> bool {
        at_ts_ms - self.ts_ms > max_staleness_ms
    }
}

/// A closed one-minute bar with the quote snapshot taken at close.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar1m {
    pub ts_min: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub vwap: f64,
    pub trade_count: u32,
    pub bid_px_close: f64,
    pub bid_sz_close: f64,
    pub ask_px_close: f64,
    pub ask_sz_close: f64,
}

impl Bar1m {
    pub fn mid_close(&self) -> f64 {
        (self.bid_px_close + self.ask_px_close) / 2.0
    }

    pub fn spread_close(&self) -> f64 {
        self.ask_px_close - self.bid_px_close
    }

    pub fn qimb_close(&self) -> f64 {
        let denom = self.bid_sz_close + self.ask_sz_close;
        if denom > 1e-12 {
            (self.bid_sz_close - self.ask_sz_close) / denom
        } else {
            0.0
        }
    }
}

/// Price zone relative to the value area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceZone {
    AboveVah,
    BelowVal,
    InsideVa,
}

/// Computed value area over the current volume profile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueArea {
    pub poc: f64,
    pub vah: f64,
    pub val: f64,
    pub coverage: f64,
    pub bin_count: usize,
    pub total_volume: f64,
    pub bin_width: f64,
    pub is_valid: bool,
}

impl ValueArea {
    pub fn invalid(bin_width: f64) -> Self {
        Self {
            poc: 0.0,
            vah: 0.0,
            val: 0.0,
            coverage: 0.0,
            bin_count: 0,
            total_volume: 0.0,
            bin_width,
            is_valid: false,
        }
    }

    pub fn zone_of(&self, price: f64) -> PriceZone {
        if price > self.vah {
            PriceZone::AboveVah
        } else if price < self.val {
            PriceZone::BelowVal
        } else {
            PriceZone::InsideVa
        }
    }
}

/// Signed buy/sell volume split for the bar just closed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderFlowMetrics {
    pub of_1m: f64,
    pub of_norm_1m: f64,
    pub total_volume: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub ambiguous_volume: f64,
    pub ambiguous_frac: f64,
}

impl OrderFlowMetrics {
    pub fn zero() -> Self {
        Self {
            of_1m: 0.0,
            of_norm_1m: 0.0,
            total_volume: 0.0,
            buy_volume: 0.0,
            sell_volume: 0.0,
            ambiguous_volume: 0.0,
            ambiguous_frac: 0.0,
        }
    }

    pub fn from_buy_sell_ambiguous(buy: f64, sell: f64, ambiguous: f64) -> Self {
        let total = buy + sell + ambiguous;
        let of_1m = buy - sell;
        let of_norm_1m = if total > 1e-12 { of_1m / total } else { 0.0 };
        let ambiguous_frac = if total > 1e-12 { ambiguous / total } else { 0.0 };
        Self {
            of_1m,
            of_norm_1m,
            total_volume: total,
            buy_volume: buy,
            sell_volume: sell,
            ambiguous_volume: ambiguous,
            ambiguous_frac,
        }
    }
}

/// Full feature set computed for one closed bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Features1m {
    pub ts_min: i64,
    pub mid_close: f64,
    pub sigma_240: f64,
    pub bin_width: f64,
    pub va: ValueArea,
    pub order_flow: OrderFlowMetrics,
    pub qimb_close: f64,
    pub qimb_ema: f64,
    pub spread_avg_60m: f64,
}

/// The six setups the signal engine can emit, ranked by priority
/// (lower wins when several qualify in the same bar).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalType {
    BreakinLong,
    BreakinShort,
    FailedBreakoutLong,
    FailedBreakoutShort,
    BreakoutLong,
    BreakoutShort,
}

impl SignalType {
    pub fn priority(&self) -> u8 {
        match self {
            SignalType::BreakinLong | SignalType::BreakinShort => 1,
            SignalType::FailedBreakoutLong | SignalType::FailedBreakoutShort => 2,
            SignalType::BreakoutLong | SignalType::BreakoutShort => 3,
        }
    }

    pub fn is_long(&self) -> bool {
        matches!(
            self,
            SignalType::BreakinLong | SignalType::FailedBreakoutLong | SignalType::BreakoutLong
        )
    }

    pub fn strategy_tag(&self) -> &'static str {
        match self {
            SignalType::BreakinLong => "breakin_long",
            SignalType::BreakinShort => "breakin_short",
            SignalType::BreakoutLong => "breakout_long",
            SignalType::BreakoutShort => "breakout_short",
            SignalType::FailedBreakoutLong => "failed_long",
            SignalType::FailedBreakoutShort => "failed_short",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Hold,
    EnterLong,
    EnterShort,
    Exit,
}

/// Output of the signal engine for one closed bar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub ts_min: i64,
    pub signal_type: Option<SignalType>,
    pub action: Action,
    pub stop: Option<f64>,
    pub tp1: Option<f64>,
    pub tp2: Option<f64>,
    pub confidence: f64,
    pub strategy_tag: String,
    pub reason: String,
}

impl Signal {
    pub fn hold(ts_min: i64, reason: impl Into<String>) -> Self {
        Self {
            ts_min,
            signal_type: None,
            action: Action::Hold,
            stop: None,
            tp1: None,
            tp2: None,
            confidence: 0.0,
            strategy_tag: String::new(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn sign(&self) -> f64 {
        match self {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        }
    }
}

/// An open position. Owned exclusively by the position manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub entry_ts: i64,
    pub side: PositionSide,
    pub entry_price: f64,
    pub size: f64,
    pub original_size: f64,
    pub stop_price: f64,
    pub tp1_price: Option<f64>,
    pub tp2_price: Option<f64>,
    pub tp1_hit: bool,
    pub strategy_tag: String,
    pub fees_paid: f64,
    pub funding_paid: f64,
}

impl Position {
    pub fn unrealized_pnl(&self, mark_price: f64) -> f64 {
        (mark_price - self.entry_price) * self.side.sign() * self.size
    }

    pub fn is_profitable(&self, mark_price: f64) -> bool {
        self.unrealized_pnl(mark_price) > 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    Tp1,
    Tp2,
    TimeStop,
    FlipSignal,
    DailyLoss,
    Manual,
}

/// An immutable record of a realized round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub entry_ts: i64,
    pub exit_ts: i64,
    pub side: PositionSide,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size: f64,
    pub pnl_gross: f64,
    pub pnl_net: f64,
    pub fees: f64,
    pub funding: f64,
    pub exit_reason: ExitReason,
    pub strategy_tag: String,
    pub hold_minutes: f64,
}

pub fn ts_to_minute(ts_ms: i64) -> i64 {
    (ts_ms.div_euclid(60_000)) * 60_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_qimb_balanced() {
        let q = Quote { ts_ms: 0, bid_px: 100.0, bid_sz: 5.0, ask_px: 100.1, ask_sz: 5.0 };
        assert!((q.qimb()).abs() < 1e-12);
    }

    #[test]
    fn zone_classification() {
        let va = ValueArea { poc: 100.0, vah: 105.0, val: 95.0, coverage: 0.7, bin_count: 4, total_volume: 10.0, bin_width: 1.0, is_valid: true };
        assert_eq!(va.zone_of(110.0), PriceZone::AboveVah);
        assert_eq!(va.zone_of(90.0), PriceZone::BelowVal);
        assert_eq!(va.zone_of(100.0), PriceZone::InsideVa);
    }

    #[test]
    fn ts_to_minute_floor() {
        assert_eq!(ts_to_minute(61_999), 60_000);
        assert_eq!(ts_to_minute(0), 0);
    }

    #[test]
    fn priority_ordering() {
        assert!(SignalType::BreakinLong.priority() < SignalType::FailedBreakoutLong.priority());
        assert!(SignalType::FailedBreakoutShort.priority() < SignalType::BreakoutShort.priority());
    }
}

/// bar_aggregator.rs — C1: fold ticks into closed one-minute bars
///
/// Accepts `Trade`/`Quote` events in arrival order and emits a `Bar1m`
/// whenever a trade crosses into a new minute. Quotes never themselves
/// close a bar; they only update the L1 snapshot stamped onto the next
/// close.
use crate::types::{Bar1m, Quote, Trade};

/// One trade plus the quote context needed to classify its aggressor side,
/// carried out of the aggregator alongside the bar it belonged to so the
/// feature engine can compute order flow without re-deriving it from OHLCV.
#[derive(Debug, Clone, Copy)]
pub struct TradeForFlow {
    pub price: f64,
    pub size: f64,
    pub bid_px: f64,
    pub ask_px: f64,
    pub quote_is_stale: bool,
}

#[derive(Debug)]
struct OpenBar {
    ts_min: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    notional: f64,
    trade_count: u32,
    flow: Vec<TradeForFlow>,
}

impl OpenBar {
    fn new(ts_min: i64, trade: &Trade, quote: Option<&Quote>, max_staleness_ms: i64) -> Self {
        let mut bar = Self {
            ts_min,
            open: trade.price,
            high: trade.price,
            low: trade.price,
            close: trade.price,
            volume: trade.size,
            notional: trade.price * trade.size,
            trade_count: 1,
            flow: Vec::new(),
        };
        bar.record_flow(trade, quote, max_staleness_ms);
        bar
    }

    fn record_flow(&mut self, trade: &Trade, quote: Option<&Quote>, max_staleness_ms: i64) {
        let entry = match quote {
            Some(q) => TradeForFlow {
                price: trade.price,
                size: trade.size,
                bid_px: q.bid_px,
                ask_px: q.ask_px,
                quote_is_stale: q.is_stale(trade.ts_ms, max_staleness_ms),
            },
            None => TradeForFlow {
                price: trade.price,
                size: trade.size,
                bid_px: trade.price,
                ask_px: trade.price,
                quote_is_stale: true,
            },
        };
        self.flow.push(entry);
    }

    fn push(&mut self, trade: &Trade, quote: Option<&Quote>, max_staleness_ms: i64) {
        self.high = self.high.max(trade.price);
        self.low = self.low.min(trade.price);
        self.close = trade.price;
        self.volume += trade.size;
        self.notional += trade.price * trade.size;
        self.trade_count += 1;
        self.record_flow(trade, quote, max_staleness_ms);
    }

    fn finalize(&self, quote: &Quote) -> Bar1m {
        let vwap = if self.volume > 1e-12 { self.notional / self.volume } else { self.close };
        Bar1m {
            ts_min: self.ts_min,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            vwap,
            trade_count: self.trade_count,
            bid_px_close: quote.bid_px,
            bid_sz_close: quote.bid_sz,
            ask_px_close: quote.ask_px,
            ask_sz_close: quote.ask_sz,
        }
    }
}

pub struct BarAggregator {
    current: Option<OpenBar>,
    latest_quote: Option<Quote>,
    max_quote_staleness_ms: i64,
}

impl BarAggregator {
    pub fn new(max_quote_staleness_ms: i64) -> Self {
        Self { current: None, latest_quote: None, max_quote_staleness_ms }
    }

    pub fn on_quote(&mut self, quote: Quote) {
        self.latest_quote = Some(quote);
    }

    /// Feed a trade. Returns a finalized `(Bar1m, flow trades)` pair if this
    /// trade closed the previous minute.
    pub fn on_trade(&mut self, trade: Trade) -> Option<(Bar1m, Vec<TradeForFlow>)> {
        let trade_minute = crate::types::ts_to_minute(trade.ts_ms);
        let quote = self.latest_quote;

        match &mut self.current {
            None => {
                self.current =
                    Some(OpenBar::new(trade_minute, &trade, quote.as_ref(), self.max_quote_staleness_ms));
                None
            }
            Some(open) if trade_minute < open.ts_min => {
                // Out-of-order trade for an already-passed minute: discard.
                None
            }
            Some(open) if trade_minute == open.ts_min => {
                open.push(&trade, quote.as_ref(), self.max_quote_staleness_ms);
                None
            }
            Some(open) => {
                let finished = quote.map(|q| (open.finalize(&q), open.flow.clone()));
                self.current =
                    Some(OpenBar::new(trade_minute, &trade, quote.as_ref(), self.max_quote_staleness_ms));
                finished
            }
        }
    }

    /// Discard the bar currently being built without emitting it — used on
    /// shutdown/interrupt so a partial bar is never persisted.
    pub fn discard_current(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(ts_ms: i64, price: f64, size: f64) -> Trade {
        Trade { ts_ms, price, size }
    }

    fn quote(ts_ms: i64, bid: f64, ask: f64) -> Quote {
        Quote { ts_ms, bid_px: bid, bid_sz: 1.0, ask_px: ask, ask_sz: 1.0 }
    }

    #[test]
    fn closes_on_minute_boundary() {
        let mut agg = BarAggregator::new(5_000);
        agg.on_quote(quote(0, 99.9, 100.1));
        assert!(agg.on_trade(trade(1_000, 100.0, 1.0)).is_none());
        assert!(agg.on_trade(trade(30_000, 101.0, 2.0)).is_none());
        let (bar, flow) = agg.on_trade(trade(60_500, 102.0, 1.0)).expect("bar should close");
        assert_eq!(bar.ts_min, 0);
        assert_eq!(bar.open, 100.0);
        assert_eq!(bar.high, 101.0);
        assert_eq!(bar.low, 100.0);
        assert_eq!(bar.close, 101.0);
        assert_eq!(bar.trade_count, 2);
        assert!((bar.volume - 3.0).abs() < 1e-9);
        assert_eq!(flow.len(), 2);
    }

    #[test]
    fn no_bar_without_quote() {
        let mut agg = BarAggregator::new(5_000);
        agg.on_trade(trade(0, 100.0, 1.0));
        let out = agg.on_trade(trade(60_000, 101.0, 1.0));
        assert!(out.is_none(), "bar must not finalize without a quote snapshot");
    }

    #[test]
    fn out_of_order_trade_discarded() {
        let mut agg = BarAggregator::new(5_000);
        agg.on_quote(quote(0, 99.9, 100.1));
        agg.on_trade(trade(70_000, 100.0, 1.0));
        // stale trade from the already-passed minute
        let out = agg.on_trade(trade(10_000, 50.0, 5.0));
        assert!(out.is_none());
        let (bar, _) = agg.on_trade(trade(130_000, 100.0, 1.0)).unwrap();
        assert_eq!(bar.ts_min, 60_000);
        assert!((bar.volume - 1.0).abs() < 1e-9, "discarded trade must not contribute volume");
    }

    #[test]
    fn empty_minute_gap_permitted() {
        let mut agg = BarAggregator::new(5_000);
        agg.on_quote(quote(0, 99.9, 100.1));
        agg.on_trade(trade(0, 100.0, 1.0));
        // next trade two minutes later; the middle minute is simply absent
        let (bar, _) = agg.on_trade(trade(130_000, 105.0, 1.0)).unwrap();
        assert_eq!(bar.ts_min, 0);
    }

    #[test]
    fn discard_drops_in_flight_bar() {
        let mut agg = BarAggregator::new(5_000);
        agg.on_quote(quote(0, 99.9, 100.1));
        agg.on_trade(trade(0, 100.0, 1.0));
        agg.discard_current();
        let out = agg.on_trade(trade(60_000, 101.0, 1.0));
        assert!(out.is_none());
    }
}

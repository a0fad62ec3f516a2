/// rolling_window.rs — C2: bounded history of closed bars
///
/// A plain `VecDeque` eviction buffer; the feature engine reads through
/// `bars()` and never mutates it directly.
use std::collections::VecDeque;

use crate::types::Bar1m;

pub struct RollingWindow {
    capacity: usize,
    bars: VecDeque<Bar1m>,
}

impl RollingWindow {
    /// `rolling_window_minutes` bars plus the 60-bar margin the spread
    /// average needs when the configured window is shorter than 60.
    pub fn new(rolling_window_minutes: usize) -> Self {
        let capacity = rolling_window_minutes.max(60) + 60;
        Self { capacity, bars: VecDeque::with_capacity(capacity) }
    }

    pub fn push(&mut self, bar: Bar1m) {
        self.bars.push_back(bar);
        while self.bars.len() > self.capacity {
            self.bars.pop_front();
        }
    }

    pub fn bars(&self) -> &VecDeque<Bar1m> {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Last `n` bars, oldest first.
    pub fn tail(&self, n: usize) -> impl Iterator<Item = &Bar1m> {
        let len = self.bars.len();
        let skip = len.saturating_sub(n);
        self.bars.iter().skip(skip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(ts_min: i64, close: f64) -> Bar1m {
        Bar1m {
            ts_min, open: close, high: close, low: close, close,
            volume: 1.0, vwap: close, trade_count: 1,
            bid_px_close: close - 0.1, bid_sz_close: 1.0,
            ask_px_close: close + 0.1, ask_sz_close: 1.0,
        }
    }

    #[test]
    fn evicts_from_front_past_capacity() {
        let mut w = RollingWindow::new(2);
        for i in 0..100 {
            w.push(bar(i * 60_000, i as f64));
        }
        assert_eq!(w.len(), 62);
        assert_eq!(w.bars().front().unwrap().close, 38.0);
    }

    #[test]
    fn tail_returns_oldest_first() {
        let mut w = RollingWindow::new(10);
        for i in 0..5 {
            w.push(bar(i * 60_000, i as f64));
        }
        let last3: Vec<f64> = w.tail(3).map(|b| b.close).collect();
        assert_eq!(last3, vec![2.0, 3.0, 4.0]);
    }
}

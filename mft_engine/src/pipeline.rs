/// pipeline.rs — wires C1-C6 together for one symbol
///
/// Grounded in `orchestrator.py`'s `Orchestrator`: a trade closes a bar,
/// a closed bar walks through the feature engine, the signal engine, and
/// the position manager in that order, and every quote drives a fast exit
/// check against the open position. `Pipeline` owns none of the transport
/// or storage wiring itself — those are handed in so the same sequence
/// runs unchanged for both the `backtest` CSV replay and `live_trader`'s
/// WebSocket loop.
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::bar_aggregator::BarAggregator;
use crate::config::AppConfig;
use crate::execution::ExecutionAdapter;
use crate::feature_engine::FeatureEngine;
use crate::position_manager::{PositionManager, PositionManagerStats, SignalOutcome};
use crate::rolling_window::RollingWindow;
use crate::signal_engine::SignalEngine;
use crate::storage::{BarSink, FeatureSink, SignalSink, TradeSink};
use crate::transport::MarketEvent;
use crate::types::{Action, Quote, Signal, Trade, TradeRecord};

#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineStats {
    pub bars_processed: u64,
    pub signals_generated: u64,
    pub trades_executed: u64,
}

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub pipeline: PipelineStats,
    pub position: PositionManagerStats,
}

/// Optional persistence sinks. Every field is independently optional so a
/// caller that only wants trade records, say, need not stand up the rest.
#[derive(Default, Clone)]
pub struct Sinks {
    pub bar: Option<Arc<dyn BarSink>>,
    pub feature: Option<Arc<dyn FeatureSink>>,
    pub signal: Option<Arc<dyn SignalSink>>,
    pub trade: Option<Arc<dyn TradeSink>>,
}

/// Drives one instrument's worth of C1-C6 from raw market events.
/// `E` is the execution adapter in use: `PaperExecutionAdapter` for a
/// backtest or shadow run, `BybitExecutionAdapter` for live trading.
pub struct Pipeline<E: ExecutionAdapter> {
    bar_aggregator: BarAggregator,
    window: RollingWindow,
    feature_engine: FeatureEngine,
    signal_engine: SignalEngine,
    position_manager: PositionManager,
    execution: E,
    sinks: Sinks,
    use_limit_for_entry: bool,
    latest_quote: Option<Quote>,
    stats: PipelineStats,
}

impl<E: ExecutionAdapter> Pipeline<E> {
    pub fn new(cfg: &AppConfig, execution: E, start_ts: i64) -> Self {
        let instrument = &cfg.instrument;
        Self {
            bar_aggregator: BarAggregator::new(cfg.order_flow.max_quote_staleness_ms),
            window: RollingWindow::new(instrument.rolling_window_minutes),
            feature_engine: FeatureEngine::new(
                instrument.tick_size,
                cfg.value_area.clone(),
                cfg.order_flow.clone(),
                instrument.rolling_window_minutes,
            ),
            signal_engine: SignalEngine::new(
                cfg.signal.clone(),
                cfg.order_flow.clone(),
                instrument.tick_size,
                cfg.risk.stop_buffer_ticks,
                cfg.risk.cooldown_minutes,
            ),
            position_manager: PositionManager::new(
                cfg.backtest.initial_capital,
                cfg.sizing.clone(),
                cfg.risk.clone(),
                cfg.execution.clone(),
                cfg.signal.enable_flip_on_signal,
                start_ts,
            ),
            execution,
            sinks: Sinks::default(),
            use_limit_for_entry: cfg.execution.use_limit_for_entry,
            latest_quote: None,
            stats: PipelineStats::default(),
        }
    }

    pub fn with_sinks(mut self, sinks: Sinks) -> Self {
        self.sinks = sinks;
        self
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn report(&self) -> PipelineReport {
        PipelineReport { pipeline: self.stats, position: self.position_manager.get_stats() }
    }

    pub fn trades(&self) -> &[TradeRecord] {
        self.position_manager.trades()
    }

    /// Called on shutdown: drops whatever trades have accumulated into the
    /// bar currently being built so no partial bar is ever emitted on the
    /// next event loop startup.
    pub fn discard_in_flight_bar(&mut self) {
        self.bar_aggregator.discard_current();
    }

    /// Single entry point for both a trade and a quote event, matching the
    /// orchestrator's `_on_trade`/`_on_quote` dispatch.
    pub async fn on_market_event(&mut self, event: MarketEvent) -> Result<()> {
        match event {
            MarketEvent::Trade(trade) => self.on_trade(trade).await,
            MarketEvent::Quote(quote) => self.on_quote(quote).await,
        }
    }

    async fn on_trade(&mut self, trade: Trade) -> Result<()> {
        if let Some((bar, flow)) = self.bar_aggregator.on_trade(trade) {
            self.window.push(bar);
            self.stats.bars_processed += 1;
            if let Some(sink) = &self.sinks.bar {
                sink.write_bar(&bar).await;
            }

            let features = self.feature_engine.on_bar(&bar, &self.window, &flow);
            if let Some(sink) = &self.sinks.feature {
                sink.write_features(&features).await;
            }

            let signal = self.signal_engine.process(&features);
            if let Some(sink) = &self.sinks.signal {
                sink.write_signal(&signal).await;
            }

            if signal.action != Action::Hold {
                self.stats.signals_generated += 1;
                self.execute_signal(signal).await?;
            }
        }
        Ok(())
    }

    async fn on_quote(&mut self, quote: Quote) -> Result<()> {
        self.bar_aggregator.on_quote(quote);
        self.latest_quote = Some(quote);
        if self.position_manager.position().is_some() {
            self.check_position_exits(quote).await?;
        }
        Ok(())
    }

    /// Route a non-hold signal through the position manager, then submit
    /// the resulting order through the execution adapter as a side effect.
    /// Bookkeeping (size, entry price, PnL) is owned entirely by the
    /// position manager; the execution adapter's reported fill is logged
    /// and persisted but never re-prices a trade already recorded against
    /// the quote mid used to size it, keeping one source of truth for PnL.
    async fn execute_signal(&mut self, signal: Signal) -> Result<()> {
        let quote = match self.latest_quote {
            Some(q) => q,
            None => {
                warn!("signal {:?} dropped: no quote available to price against", signal.signal_type);
                return Ok(());
            }
        };
        let current_price = quote.mid();
        let current_ts = signal.ts_min;

        let outcome = self.position_manager.process_signal(&signal, current_price, current_ts);
        match outcome {
            SignalOutcome::Entered(side) | SignalOutcome::Flipped(side) => {
                self.stats.trades_executed += 1;
                if let Some(closed) = self.closed_trade_if_flip(&outcome) {
                    self.emit_trade(closed).await;
                }
                if let Some(pos) = self.position_manager.position() {
                    let limit_price = self.use_limit_for_entry.then_some(current_price);
                    match self.execution.enter_position(side, pos.size, limit_price, Some(quote)).await {
                        Ok(res) if res.success => {
                            info!("entry submitted: {side:?} size={} fill={:?}", pos.size, res.filled_price)
                        }
                        Ok(res) => warn!("entry execution rejected: {:?}", res.error),
                        Err(e) => warn!("entry execution error: {e:#}"),
                    }
                }
            }
            SignalOutcome::Exited(_) => {
                self.stats.trades_executed += 1;
                if let Some(trade) = self.position_manager.trades().last().cloned() {
                    self.submit_close(&trade, quote).await;
                    self.emit_trade(trade).await;
                }
            }
            SignalOutcome::Blocked(reason) => debug!("signal blocked: {reason}"),
            SignalOutcome::BlockedAndClosed(reason, trade) => {
                debug!("signal blocked: {reason}, open position force-closed");
                self.stats.trades_executed += 1;
                self.submit_close(&trade, quote).await;
                self.emit_trade(trade).await;
            }
            SignalOutcome::Hold => {}
        }
        Ok(())
    }

    /// A flip closes the prior leg before opening the new one; surface that
    /// closed trade so it gets the same audit trail as any other exit.
    fn closed_trade_if_flip(&self, outcome: &SignalOutcome) -> Option<TradeRecord> {
        match outcome {
            SignalOutcome::Flipped(_) => self.position_manager.trades().last().cloned(),
            _ => None,
        }
    }

    async fn submit_close(&self, trade: &TradeRecord, quote: Quote) {
        match self.execution.exit_position(trade.side, trade.size, Some(quote)).await {
            Ok(res) if res.success => info!("exit submitted: {:?} fill={:?}", trade.side, res.filled_price),
            Ok(res) => warn!("exit execution rejected: {:?}", res.error),
            Err(e) => warn!("exit execution error: {e:#}"),
        }
    }

    /// Fast exit path: stop/TP1/TP2/time are evaluated against the ask/bid
    /// proxy on every quote, independent of bar closes.
    async fn check_position_exits(&mut self, quote: Quote) -> Result<()> {
        if let Some(trade) =
            self.position_manager.check_exits(quote.ask_px, quote.bid_px, quote.mid(), quote.ts_ms)
        {
            self.stats.trades_executed += 1;
            self.submit_close(&trade, quote).await;
            self.emit_trade(trade).await;
        }
        Ok(())
    }

    async fn emit_trade(&self, trade: TradeRecord) {
        if let Some(sink) = &self.sinks.trade {
            sink.write_trade(&trade).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::execution::PaperExecutionAdapter;
    use crate::types::Trade;

    fn test_pipeline() -> Pipeline<PaperExecutionAdapter> {
        let cfg = AppConfig::default();
        let execution = PaperExecutionAdapter::new(
            cfg.instrument.tick_size,
            cfg.execution.slippage_ticks_entry,
            cfg.execution.slippage_ticks_exit,
        );
        Pipeline::new(&cfg, execution, 0)
    }

    #[tokio::test]
    async fn quote_before_any_bar_updates_latest_quote_without_panicking() {
        let mut pipeline = test_pipeline();
        let quote = Quote { ts_ms: 0, bid_px: 99.9, bid_sz: 1.0, ask_px: 100.1, ask_sz: 1.0 };
        pipeline.on_market_event(MarketEvent::Quote(quote)).await.unwrap();
        assert_eq!(pipeline.stats().bars_processed, 0);
        assert!(pipeline.position_manager.position().is_none());
    }

    /// Trades clustered inside one minute do not close a bar; a trade in
    /// the following minute closes the first bar and drives it through the
    /// feature/signal stages without a live position ever forming (a single
    /// bar can't satisfy the acceptance sequence a real signal needs).
    #[tokio::test]
    async fn minute_boundary_trade_closes_exactly_one_bar() {
        let mut pipeline = test_pipeline();

        let quote = Quote { ts_ms: 0, bid_px: 99.95, bid_sz: 1.0, ask_px: 100.05, ask_sz: 1.0 };
        pipeline.on_market_event(MarketEvent::Quote(quote)).await.unwrap();

        for (i, price) in [100.0, 100.05, 99.98].into_iter().enumerate() {
            let trade = Trade { ts_ms: (i as i64) * 10_000, price, size: 0.2 };
            pipeline.on_market_event(MarketEvent::Trade(trade)).await.unwrap();
        }
        assert_eq!(pipeline.stats().bars_processed, 0);

        let trade = Trade { ts_ms: 61_000, price: 100.1, size: 0.3 };
        pipeline.on_market_event(MarketEvent::Trade(trade)).await.unwrap();
        assert_eq!(pipeline.stats().bars_processed, 1);

        let report = pipeline.report();
        assert_eq!(report.pipeline.bars_processed, 1);
        assert_eq!(report.position.trade_count, 0);
    }

    /// A trade in-flight toward the next bar must not survive a shutdown
    /// discard: the following minute's close must show only its own trade.
    #[tokio::test]
    async fn discard_in_flight_bar_drops_partial_bar_on_shutdown() {
        let mut pipeline = test_pipeline();
        let quote = Quote { ts_ms: 0, bid_px: 99.95, bid_sz: 1.0, ask_px: 100.05, ask_sz: 1.0 };
        pipeline.on_market_event(MarketEvent::Quote(quote)).await.unwrap();
        pipeline
            .on_market_event(MarketEvent::Trade(Trade { ts_ms: 0, price: 100.0, size: 1.0 }))
            .await
            .unwrap();

        pipeline.discard_in_flight_bar();

        let trade = Trade { ts_ms: 61_000, price: 100.1, size: 0.3 };
        pipeline.on_market_event(MarketEvent::Trade(trade)).await.unwrap();
        assert_eq!(pipeline.stats().bars_processed, 0, "discarded bar must never close");
    }
}

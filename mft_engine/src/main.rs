/// main.rs — Backtest Entry Point
///
/// Replays a CSV of trade/quote events through the full C1-C6 pipeline
/// using the deterministic paper-fill execution adapter, then prints the
/// position manager's realized-trade report. Grounded in
/// `orchestrator.py`'s `TradingMode.BACKTEST` path, which wires a
/// `MockCollector` feed into the same orchestrator used for live trading.
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use mft_engine::config::AppConfig;
use mft_engine::csv_source;
use mft_engine::execution::{ExecutionAdapter, PaperExecutionAdapter};
use mft_engine::pipeline::Pipeline;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("╔══════════════════════════════════════════════╗");
    info!("║      AUCTION ENGINE  —  BACKTEST MODE         ║");
    info!("╚══════════════════════════════════════════════╝");

    let csv_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .context("usage: backtest <events.csv> [config.yaml]")?;
    let config_path = std::env::args().nth(2).map(PathBuf::from);

    let cfg = AppConfig::load(config_path.as_deref())?;
    info!(
        "Config: symbol={} tick_size={} rolling_window_minutes={}",
        cfg.instrument.symbol, cfg.instrument.tick_size, cfg.instrument.rolling_window_minutes
    );

    info!("Loading events from {}", csv_path.display());
    let events = csv_source::load_events(&csv_path)?;
    if events.is_empty() {
        anyhow::bail!("no events loaded from {}", csv_path.display());
    }
    info!("Loaded {} events", events.len());

    let execution = PaperExecutionAdapter::new(
        cfg.instrument.tick_size,
        cfg.execution.slippage_ticks_entry,
        cfg.execution.slippage_ticks_exit,
    );
    execution.start().await.ok();

    let start_ts = match &events[0] {
        mft_engine::transport::MarketEvent::Trade(t) => t.ts_ms,
        mft_engine::transport::MarketEvent::Quote(q) => q.ts_ms,
    };
    let mut pipeline = Pipeline::new(&cfg, execution, start_ts);

    for event in events {
        pipeline.on_market_event(event).await?;
    }

    let report = pipeline.report();
    println!("\n─── Backtest Report ───────────────────────────");
    println!("bars processed:    {}", report.pipeline.bars_processed);
    println!("signals generated: {}", report.pipeline.signals_generated);
    println!("trades executed:   {}", report.pipeline.trades_executed);
    println!("trade count:       {}", report.position.trade_count);
    println!("win rate:          {:.2}%", report.position.win_rate * 100.0);
    println!("avg win:           {:.4}", report.position.avg_win);
    println!("avg loss:          {:.4}", report.position.avg_loss);
    println!("max drawdown:      {:.4}", report.position.max_drawdown);
    println!("total fees:        {:.4}", report.position.total_fees);
    println!("total funding:     {:.4}", report.position.total_funding);

    Ok(())
}

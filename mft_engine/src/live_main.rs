/// live_main.rs — Live Trading Entry Point
///
/// Single-threaded cooperative event loop: the market-data task owns a
/// WebSocket collector task over an `mpsc` channel and `select!`s between
/// the next market event and `ctrl_c`, driving C1-C5 to completion per
/// event before yielding again. Grounded in `collector.py`'s
/// `BybitCollector` reconnect model and `cli.py`'s live-mode bootstrap
/// (config load, credential check, final stats dump on shutdown).
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mft_engine::config::AppConfig;
use mft_engine::execution::BybitExecutionAdapter;
use mft_engine::pipeline::{Pipeline, Sinks};
use mft_engine::storage::{BarJsonlSink, FeatureJsonlSink, SignalJsonlSink, TradeJsonlSink};
use mft_engine::transport::BybitMarketDataClient;
use mft_engine::EngineError;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("╔══════════════════════════════════════════════╗");
    info!("║      AUCTION ENGINE  —  LIVE TRADING MODE     ║");
    info!("╚══════════════════════════════════════════════╝");

    let config_path = std::env::args().nth(1).map(std::path::PathBuf::from);
    let cfg = AppConfig::load(config_path.as_deref())?;

    if cfg.credentials.api_key.is_empty() || cfg.credentials.api_secret.is_empty() {
        return Err(EngineError::Fatal(
            "BYBIT_API_KEY / BYBIT_API_SECRET must be set for live trading".into(),
        )
        .into());
    }
    if !cfg.credentials.use_testnet {
        warn!("LIVE MODE — mainnet credentials in use, real funds are at risk");
    }

    info!(
        "Config: symbol={} tick_size={} testnet={}",
        cfg.instrument.symbol, cfg.instrument.tick_size, cfg.credentials.use_testnet
    );

    let data_dir = Path::new(&cfg.database.data_dir);
    std::fs::create_dir_all(data_dir).with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let sinks = Sinks {
        bar: Some(Arc::new(BarJsonlSink::spawn(data_dir.join(&cfg.database.raw_db))?)),
        feature: Some(Arc::new(FeatureJsonlSink::spawn(data_dir.join(&cfg.database.features_db))?)),
        signal: Some(Arc::new(SignalJsonlSink::spawn(data_dir.join(&cfg.database.signals_db))?)),
        trade: Some(Arc::new(TradeJsonlSink::spawn(data_dir.join(&cfg.database.execution_db))?)),
    };

    let execution = BybitExecutionAdapter::new(
        cfg.credentials.api_key.clone(),
        cfg.credentials.api_secret.clone(),
        cfg.rest_base_url().to_string(),
        cfg.instrument.symbol.clone(),
        cfg.execution.limit_order_timeout_minutes,
    );

    let start_ts = chrono::Utc::now().timestamp_millis();
    let mut pipeline = Pipeline::new(&cfg, execution, start_ts).with_sinks(sinks);

    let collector = BybitMarketDataClient::new(cfg.ws_base_url().to_string(), cfg.instrument.symbol.clone());
    let (tx, mut rx) = mpsc::channel(4_096);
    let collector_handle = tokio::spawn(async move {
        if let Err(e) = collector.run(tx).await {
            error!("market data collector exited: {e:#}");
        }
    });

    info!("entering live event loop");
    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(event) => {
                        if let Err(e) = pipeline.on_market_event(event).await {
                            error!("pipeline error processing market event: {e:#}");
                        }
                    }
                    None => {
                        warn!("market data channel closed, shutting down");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    collector_handle.abort();
    pipeline.discard_in_flight_bar();

    let report = pipeline.report();
    info!(
        "final stats: bars={} signals={} trades={} win_rate={:.2}% total_fees={:.4}",
        report.pipeline.bars_processed,
        report.pipeline.signals_generated,
        report.pipeline.trades_executed,
        report.position.win_rate * 100.0,
        report.position.total_fees,
    );

    Ok(())
}

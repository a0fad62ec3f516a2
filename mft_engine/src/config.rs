/// config.rs — Hierarchical configuration, loaded from env and/or YAML
///
/// Mirrors the reference system's section-per-concern layout (one struct
/// per concern, composed into a single top-level config) rather than the
/// flat env-var bag this crate started from. `AppConfig::from_env` keeps
/// the original parse-with-default idiom; `AppConfig::load`/`save` add a
/// YAML file round trip on top, so a deployment can check a config file
/// into version control instead of wiring two dozen environment variables.
use std::env;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Fee model constants (Bybit USDT perpetual defaults).
pub const DEFAULT_MAKER_FEE_BPS: f64 = 1.0; // 0.01%
pub const DEFAULT_TAKER_FEE_BPS: f64 = 6.0; // 0.06%
pub const DEFAULT_SLIPPAGE_TICKS: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    pub symbol: String,
    pub exchange: String,
    pub timeframe: String,
    pub tick_size: f64,
    pub rolling_window_minutes: usize,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".into(),
            exchange: "bybit".into(),
            timeframe: "1m".into(),
            tick_size: 0.1,
            rolling_window_minutes: 240,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueAreaConfig {
    pub va_fraction: f64,
    pub base_bin_ticks: f64,
    pub alpha_bin: f64,
    pub bin_width_max_ticks: f64,
    pub rebucket_interval_minutes: usize,
    pub rebucket_change_pct: f64,
    pub min_va_bins: usize,
}

impl Default for ValueAreaConfig {
    fn default() -> Self {
        Self {
            va_fraction: 0.70,
            base_bin_ticks: 5.0,
            alpha_bin: 1.0,
            bin_width_max_ticks: 50.0,
            rebucket_interval_minutes: 15,
            rebucket_change_pct: 0.25,
            min_va_bins: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFlowConfig {
    pub max_quote_staleness_ms: i64,
    pub ambiguous_trade_frac_max: f64,
    pub use_tick_rule_fallback: bool,
    pub use_qimb: bool,
    pub qimb_entry_min: f64,
    pub qimb_breakout_min: f64,
    pub qimb_fail_max: f64,
    pub spread_lookback_minutes: usize,
}

impl Default for OrderFlowConfig {
    fn default() -> Self {
        Self {
            max_quote_staleness_ms: 5_000,
            ambiguous_trade_frac_max: 0.35,
            use_tick_rule_fallback: true,
            use_qimb: true,
            qimb_entry_min: 0.10,
            qimb_breakout_min: 0.10,
            qimb_fail_max: 0.05,
            spread_lookback_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalConfig {
    pub of_entry_min: f64,
    pub of_entry_min_norm: f64,
    pub of_breakout_min: f64,
    pub of_breakout_min_norm: f64,
    pub of_fail_max: f64,
    pub of_fail_max_norm: f64,
    pub accept_outside_k: u32,
    pub enable_retest_mode: bool,
    pub enable_flip_on_signal: bool,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            of_entry_min: 0.0,
            of_entry_min_norm: 0.05,
            of_breakout_min: 0.0,
            of_breakout_min_norm: 0.05,
            of_fail_max: 0.0,
            of_fail_max_norm: 0.05,
            accept_outside_k: 3,
            enable_retest_mode: false,
            enable_flip_on_signal: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizingConfig {
    pub risk_pct: f64,
    pub max_leverage: f64,
    pub tp1_pct: f64,
    pub tp2_pct: f64,
    pub move_stop_to_breakeven_after_tp1: bool,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            risk_pct: 0.01,
            max_leverage: 5.0,
            tp1_pct: 0.5,
            tp2_pct: 0.5,
            move_stop_to_breakeven_after_tp1: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    pub max_hold_minutes: i64,
    pub extend_if_profitable: bool,
    pub cooldown_minutes: i64,
    pub stop_buffer_ticks: f64,
    pub max_daily_loss: Option<f64>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_hold_minutes: 240,
            extend_if_profitable: true,
            cooldown_minutes: 5,
            stop_buffer_ticks: 2.0,
            max_daily_loss: Some(100.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub use_limit_for_entry: bool,
    pub limit_order_timeout_minutes: f64,
    pub slippage_ticks_entry: f64,
    pub slippage_ticks_exit: f64,
    pub taker_fee_bps: f64,
    pub maker_fee_bps: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            use_limit_for_entry: true,
            limit_order_timeout_minutes: 1.0,
            slippage_ticks_entry: DEFAULT_SLIPPAGE_TICKS,
            slippage_ticks_exit: DEFAULT_SLIPPAGE_TICKS,
            taker_fee_bps: DEFAULT_TAKER_FEE_BPS,
            maker_fee_bps: DEFAULT_MAKER_FEE_BPS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub funding_rate_8h_bps: f64,
    pub initial_capital: f64,
    pub workers: usize,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self { funding_rate_8h_bps: 1.0, initial_capital: 10_000.0, workers: 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub data_dir: String,
    pub raw_db: String,
    pub features_db: String,
    pub signals_db: String,
    pub execution_db: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".into(),
            raw_db: "raw.jsonl".into(),
            features_db: "features.jsonl".into(),
            signals_db: "signals.jsonl".into(),
            execution_db: "execution.jsonl".into(),
        }
    }
}

/// Exchange credentials, kept separate from the rest so they're the only
/// section typically sourced from the environment rather than a checked-in
/// YAML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CredentialsConfig {
    pub api_key: String,
    pub api_secret: String,
    pub use_testnet: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AppConfig {
    pub instrument: InstrumentConfig,
    pub value_area: ValueAreaConfig,
    pub order_flow: OrderFlowConfig,
    pub signal: SignalConfig,
    pub sizing: SizingConfig,
    pub risk: RiskConfig,
    pub execution: ExecutionConfig,
    pub backtest: BacktestConfig,
    pub database: DatabaseConfig,
    pub credentials: CredentialsConfig,
}

impl AppConfig {
    /// Load credentials and the use_testnet flag from the environment
    /// (after `.env`), leaving every other section at its default. Intended
    /// to be layered under `load()` when a YAML file supplies the rest.
    pub fn credentials_from_env() -> CredentialsConfig {
        dotenv::dotenv().ok();
        CredentialsConfig {
            api_key: env::var("BYBIT_API_KEY").unwrap_or_default(),
            api_secret: env::var("BYBIT_API_SECRET").unwrap_or_default(),
            use_testnet: env::var("BYBIT_USE_TESTNET")
                .unwrap_or_else(|_| "true".into())
                .to_lowercase()
                == "true",
        }
    }

    /// Load defaults, then layer environment-sourced credentials on top.
    pub fn from_env() -> Result<Self> {
        let mut cfg = AppConfig::default();
        cfg.credentials = Self::credentials_from_env();
        Ok(cfg)
    }

    /// Load from a YAML file at `path`, falling back to `from_env()` if
    /// `path` is `None` or the file does not exist — mirrors the reference
    /// loader's "`AUCTION_TRADER_CONFIG` env var, then `./config/default.yaml`,
    /// else defaults" search order, collapsed to an explicit optional path
    /// since this crate has no implicit config-discovery convention yet.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("reading config file {}", p.display()))?;
                let mut cfg: AppConfig = serde_yaml::from_str(&raw)
                    .with_context(|| format!("parsing config file {}", p.display()))?;
                cfg.credentials = Self::credentials_from_env();
                Ok(cfg)
            }
            _ => Self::from_env(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("serializing config to YAML")?;
        std::fs::write(path, yaml)
            .with_context(|| format!("writing config file {}", path.display()))
    }

    pub fn rest_base_url(&self) -> &'static str {
        if self.credentials.use_testnet {
            "https://api-testnet.bybit.com"
        } else {
            "https://api.bybit.com"
        }
    }

    pub fn ws_base_url(&self) -> &'static str {
        if self.credentials.use_testnet {
            "wss://stream-testnet.bybit.com/v5/public/linear"
        } else {
            "wss://stream.bybit.com/v5/public/linear"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_round_trip_preserves_equality() {
        let cfg = AppConfig::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let back: AppConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn default_urls_pick_testnet() {
        let mut cfg = AppConfig::default();
        cfg.credentials.use_testnet = true;
        assert!(cfg.rest_base_url().contains("testnet"));
        cfg.credentials.use_testnet = false;
        assert!(!cfg.rest_base_url().contains("testnet"));
    }
}

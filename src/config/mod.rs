//! Parameters for a run, read from a JSON file. Every field has a default so a file only needs
//! to name what it changes.
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::exchange::FeeCurrency;
use crate::orderbook::DEFAULT_BUCKET_RESOLUTION;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    #[default]
    Market,
    Limit,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub timer: TimerConfig,
    pub strategy: StrategyConfig,
    pub backtest: BacktestConfig,
    pub live: LiveConfig,
}

impl EngineConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("could not open parameter file {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("could not parse parameter file {}", path.display()))
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Ticks per second.
    pub frequency: f64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self { frequency: 1.0 }
    }
}

/// All times are in seconds of the engine clock.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Base volume of every order.
    pub volume: f64,
    /// Warm-up after the first tick during which nothing is traded.
    pub waiting_time: f64,
    /// Minimum spacing between two open decisions.
    pub refractory_interval: f64,
    /// Trailing window searched for the historical maximum buy price.
    pub max_window: f64,
    /// Trailing window the buy price slope is fitted over.
    pub slope_window: f64,
    /// The historical maximum must exceed the current buy price times this to open.
    pub drop_ratio: f64,
    pub slope_threshold: f64,
    pub min_quote_balance: f64,
    pub take_profit_ratio: f64,
    pub stop_loss_ratio: f64,
    pub max_holding_time: f64,
    pub poll_interval: f64,
    pub order_timeout: f64,
    pub cancel_timeout: f64,
    pub order_kind: OrderKind,
    /// Limit buys are placed at the current buy price times this.
    pub limit_ratio: f64,
    pub fee_currency: FeeCurrency,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            volume: 1.0,
            waiting_time: 60.0,
            refractory_interval: 60.0,
            max_window: 600.0,
            slope_window: 60.0,
            drop_ratio: 1.01,
            slope_threshold: 0.0,
            min_quote_balance: 0.0,
            take_profit_ratio: 1.01,
            stop_loss_ratio: 0.98,
            max_holding_time: 3600.0,
            poll_interval: 1.0,
            order_timeout: 10.0,
            cancel_timeout: 10.0,
            order_kind: OrderKind::Market,
            limit_ratio: 1.0,
            fee_currency: FeeCurrency::Quote,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub maker_fee: f64,
    pub taker_fee: f64,
    pub max_execution_delay: f64,
    pub initial_base: f64,
    pub initial_quote: f64,
    pub seed: u64,
    pub bucket_resolution: f64,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            maker_fee: 0.0008,
            taker_fee: 0.001,
            max_execution_delay: 1.0,
            initial_base: 0.0,
            initial_quote: 1000.0,
            seed: 0,
            bucket_resolution: DEFAULT_BUCKET_RESOLUTION,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LiveConfig {
    pub retry_attempts: u32,
    pub retry_backoff: f64,
    pub collect_interval: f64,
    pub max_age: f64,
    /// Snapshots closer together than this are merged into one bucket.
    pub bucket_resolution: f64,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_backoff: 1.0,
            collect_interval: 1.0,
            max_age: 3600.0,
            bucket_resolution: DEFAULT_BUCKET_RESOLUTION,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::{EngineConfig, OrderKind};
    use crate::exchange::FeeCurrency;

    #[test]
    fn test_that_partial_file_keeps_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"strategy": {"volume": 0.5, "order_kind": "limit", "fee_currency": "base"},
                "backtest": {"seed": 7}}"#,
        )
        .unwrap();

        assert_eq!(config.strategy.volume, 0.5);
        assert_eq!(config.strategy.order_kind, OrderKind::Limit);
        assert_eq!(config.strategy.fee_currency, FeeCurrency::Base);
        assert_eq!(config.strategy.poll_interval, 1.0);
        assert_eq!(config.backtest.seed, 7);
        assert_eq!(config.timer.frequency, 1.0);
        assert_eq!(config.live.retry_attempts, 3);
    }

    #[test]
    fn test_that_live_bucket_resolution_is_independent_of_backtest() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"backtest": {"bucket_resolution": 5.0}, "live": {"bucket_resolution": 0.5}}"#,
        )
        .unwrap();

        assert_eq!(config.backtest.bucket_resolution, 5.0);
        assert_eq!(config.live.bucket_resolution, 0.5);
        assert_eq!(
            EngineConfig::default().live.bucket_resolution,
            EngineConfig::default().backtest.bucket_resolution
        );
    }

    #[test]
    fn test_that_config_loads_from_path() {
        let path = std::env::temp_dir().join("bookrunner_config_test.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(br#"{"timer": {"frequency": 4.0}}"#).unwrap();

        let config = EngineConfig::from_path(&path).unwrap();
        assert_eq!(config.timer.frequency, 4.0);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_that_missing_file_is_reported() {
        let err = EngineConfig::from_path("/nonexistent/params.json").unwrap_err();
        assert!(err.to_string().contains("could not open"));
    }
}

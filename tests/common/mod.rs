#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};

use bookrunner::config::{EngineConfig, StrategyConfig};
use bookrunner::orderbook::{Level, OrderBookStore, Side};

/// Best ask at `second`: a slow wave around 100 with an amplitude of 5.
pub fn wave_price(second: usize) -> f64 {
    100.0 + 5.0 * (second as f64 / 40.0).sin()
}

/// Three levels of one unit on each side at `second`, asks first.
pub fn wave_levels(second: usize) -> (Vec<Level>, Vec<Level>) {
    let ask = wave_price(second);
    let asks = (0..3)
        .map(|level| Level::new(ask + 0.1 * level as f64, 1.0))
        .collect();
    let bids = (0..3)
        .map(|level| Level::new(ask - 0.1 - 0.1 * level as f64, 1.0))
        .collect();
    (asks, bids)
}

/// One snapshot a second for `seconds`.
pub fn wave_store(seconds: usize) -> OrderBookStore {
    let store = OrderBookStore::new();
    for second in 0..seconds {
        let (asks, bids) = wave_levels(second);
        store.insert(Side::Ask, second as f64, asks);
        store.insert(Side::Bid, second as f64, bids);
    }
    store
}

pub fn wave_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.strategy = StrategyConfig {
        volume: 1.0,
        waiting_time: 10.0,
        refractory_interval: 20.0,
        max_window: 60.0,
        slope_window: 5.0,
        drop_ratio: 1.01,
        slope_threshold: 0.0,
        min_quote_balance: 10.0,
        take_profit_ratio: 1.005,
        stop_loss_ratio: 0.98,
        max_holding_time: 120.0,
        poll_interval: 1.0,
        order_timeout: 5.0,
        cancel_timeout: 5.0,
        ..StrategyConfig::default()
    };
    config.backtest.initial_quote = 10_000.0;
    config.backtest.max_execution_delay = 1.0;
    config.backtest.seed = 42;
    config
}

/// Writes the wave as replay CSV files into `dir` and returns the ask and bid paths.
pub fn write_wave_csv(dir: &Path, seconds: usize) -> (PathBuf, PathBuf) {
    std::fs::create_dir_all(dir).unwrap();
    let asks_path = dir.join("asks.csv");
    let bids_path = dir.join("bids.csv");
    let mut asks = std::fs::File::create(&asks_path).unwrap();
    let mut bids = std::fs::File::create(&bids_path).unwrap();
    writeln!(asks, "price,volume,exchange_timestamp,local_timestamp").unwrap();
    writeln!(bids, "price,volume,exchange_timestamp,local_timestamp").unwrap();
    for second in 0..seconds {
        let time = second as f64;
        let (ask_levels, bid_levels) = wave_levels(second);
        for level in ask_levels {
            writeln!(asks, "{},{},{time},{}", level.price, level.volume, time + 0.05).unwrap();
        }
        for level in bid_levels {
            writeln!(bids, "{},{},{time},{}", level.price, level.volume, time + 0.05).unwrap();
        }
    }
    (asks_path, bids_path)
}

use std::env;
use std::sync::Arc;

use anyhow::{bail, Result};
use log::info;

use bookrunner::config::EngineConfig;
use bookrunner::input::load_replay;
use bookrunner::perf::{report_statistics, CsvStatisticsSink};
use bookrunner::runner::run_backtest;

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 5 {
        bail!("usage: backtest <config.json> <asks.csv> <bids.csv> <stats.csv>");
    }

    let config = EngineConfig::from_path(&args[1])?;
    let store = Arc::new(load_replay(
        &args[2],
        &args[3],
        config.backtest.bucket_resolution,
    )?);
    info!(
        "BACKTEST: Loaded {} ask and {} bid snapshots",
        store.asks().len(),
        store.bids().len()
    );

    // Single-threaded so a replay with a fixed seed is reproducible.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let strategy = runtime.block_on(run_backtest(&config, store))?;

    let mut sink = CsvStatisticsSink::from_path(&args[4])?;
    let cursor = report_statistics(&strategy, 0, &mut sink)?;
    let statistics = strategy.get_statistics(0);
    info!(
        "BACKTEST: {} position(s), {} closed, {} errored, profit {:.6}, cursor {cursor}",
        strategy.positions().len(),
        statistics.closed.len(),
        statistics.errors,
        statistics.total_profit()
    );
    Ok(())
}

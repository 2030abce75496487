//! Wires a store, clock, exchange, strategy and timer into a complete run.
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info};
use tokio::sync::watch;

use crate::clock::{Clock, RealClock, VirtualClock};
use crate::config::EngineConfig;
use crate::exchange::{BacktestExchangeBuilder, ExchangeClient, LiveExchangeBuilder};
use crate::orderbook::OrderBookStore;
use crate::strategy::{ReboundStrategy, ReboundStrategyBuilder};
use crate::timer::TimerBuilder;

/// Replays `store` from its first to its last timestamp and returns the strategy once its
/// finishing phase is done.
pub async fn run_backtest(
    config: &EngineConfig,
    store: Arc<OrderBookStore>,
) -> Result<Arc<ReboundStrategy>> {
    let (start, stop_time) = store
        .time_span()
        .context("replay contains no order book data")?;
    info!(target: "bookrunner::runner", "RUNNER: Replaying {start} to {stop_time}");

    let clock = Arc::new(VirtualClock::new(start));
    let backtest = &config.backtest;
    let exchange = Arc::new(
        BacktestExchangeBuilder::new(store, clock.clone())
            .with_initial_balance(backtest.initial_base, backtest.initial_quote)
            .with_fees(backtest.maker_fee, backtest.taker_fee)
            .with_max_execution_delay(backtest.max_execution_delay)
            .with_seed(backtest.seed)
            .build(),
    );
    let strategy = Arc::new(
        ReboundStrategyBuilder::new(exchange, clock.clone())
            .with_config(config.strategy.clone())
            .build(),
    );
    let timer = TimerBuilder::new(strategy.clone())
        .with_frequency(config.timer.frequency)
        .with_virtual_clock(clock, stop_time)
        .build()?;

    timer.start();
    timer.join().await;
    Ok(strategy)
}

/// Trades live until `shutdown` resolves or the order book collector dies, then runs the
/// finishing phase.
pub async fn run_live<C, F>(
    config: &EngineConfig,
    client: C,
    shutdown: F,
) -> Result<Arc<ReboundStrategy>>
where
    C: ExchangeClient + 'static,
    F: Future<Output = ()>,
{
    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let live = &config.live;
    let exchange = Arc::new(
        LiveExchangeBuilder::new(client, Arc::clone(&clock))
            .with_store(Arc::new(OrderBookStore::with_resolution(
                live.bucket_resolution,
            )))
            .with_retry(live.retry_attempts, live.retry_backoff)
            .with_collection(live.collect_interval, live.max_age)
            .build()?,
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut collector = exchange.spawn_collector(stop_rx);

    let strategy = Arc::new(
        ReboundStrategyBuilder::new(exchange.clone(), Arc::clone(&clock))
            .with_config(config.strategy.clone())
            .build(),
    );
    let timer = TimerBuilder::new(strategy.clone())
        .with_frequency(config.timer.frequency)
        .with_real_clock(clock)
        .build()?;
    timer.start();

    let collector_done = tokio::select! {
        _ = shutdown => false,
        res = &mut collector => {
            match res {
                Ok(Err(err)) => {
                    error!(target: "bookrunner::runner", "RUNNER: Collector died: {err}")
                }
                Err(err) => {
                    error!(target: "bookrunner::runner", "RUNNER: Collector failed: {err}")
                }
                Ok(Ok(())) => {}
            }
            true
        }
    };

    info!(target: "bookrunner::runner", "RUNNER: Shutting down");
    timer.stop().await;
    stop_tx.send_replace(true);
    if !collector_done {
        if let Ok(Err(err)) = collector.await {
            error!(target: "bookrunner::runner", "RUNNER: Collector ended with {err}");
        }
    }
    Ok(strategy)
}

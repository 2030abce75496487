//! # What is Bookrunner?
//!
//! Bookrunner runs a trading strategy against order-book data. The same strategy code runs live,
//! against a venue reached through an [ExchangeClient](crate::exchange::ExchangeClient), or
//! against a replay of recorded depth where time is virtual and the run is deterministic.
//!
//! # Implementation
//!
//! A run is composed of:
//! - An [OrderBookStore](crate::orderbook::OrderBookStore) holding timestamped depth snapshots for
//! each side, filled either by [load_replay](crate::input::load_replay) or by the live collector.
//! - A [PriceModel](crate::price::PriceModel) turning a snapshot and a volume into the
//! volume-weighted price of filling that volume.
//! - A [Clock](crate::clock::Clock). [RealClock](crate::clock::RealClock) follows the system
//! time, [VirtualClock](crate::clock::VirtualClock) only moves when the timer steps it.
//! - An [Exchange](crate::exchange::Exchange). The
//! [BacktestExchange](crate::exchange::BacktestExchange) resolves orders against the store and
//! keeps its own fee and balance ledger; the [LiveExchange](crate::exchange::LiveExchange) sends
//! them to the venue with retries.
//! - A [Strategy](crate::strategy::Strategy), [ReboundStrategy](crate::strategy::ReboundStrategy)
//! being the one shipped here, which opens and closes positions through the exchange.
//! - A [Timer](crate::timer::Timer) calling the strategy at a fixed frequency and running its
//! finishing phase at shutdown.
//!
//! Closed positions are drained with [report_statistics](crate::perf::report_statistics) into a
//! [StatisticsSink](crate::perf::StatisticsSink).
//!
//! [run_backtest](crate::runner::run_backtest) and [run_live](crate::runner::run_live) wire these
//! together. The `backtest` binary drives the former from a JSON parameter file and two CSV files.
pub mod clock;
pub mod config;
pub mod error;
pub mod exchange;
pub mod input;
pub mod orderbook;
pub mod perf;
pub mod price;
pub mod runner;
pub mod strategy;
pub mod timer;

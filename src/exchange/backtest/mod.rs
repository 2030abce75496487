//! Replays orders against the stored order book.
//!
//! Every order is resolved at placement time. A market order executes at a random instant within
//! `max_execution_delay` of placement, priced off the snapshot visible at that instant, and always
//! pays the taker fee. A limit order scans forward for the first snapshot whose VWAP satisfies the
//! limit: if that is the very first snapshot scanned it behaved like a market order and pays the
//! taker fee, otherwise it rested on the book and pays the maker fee. If nothing in the remaining
//! data satisfies it the order never fills and stays open until canceled.
//!
//! The balance effect is booked in the ledger immediately, stamped with the execution time, so
//! balance queries before that instant do not see it. Callers still have to poll for the status
//! to turn closed.
mod ledger;

pub use ledger::{BalancePosition, Execution, Ledger, Order};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Uniform};

use crate::clock::Clock;
use crate::error::Result;
use crate::exchange::{
    validate_limit, validate_volume, Balance, Exchange, FeeCurrency, OrderId, OrderSide,
    OrderStatus,
};
use crate::orderbook::{OrderBookStore, Side};
use crate::price::{quote_side, weighted_price, PriceModel};

#[derive(Debug)]
pub struct BacktestExchange {
    clock: Arc<dyn Clock>,
    prices: PriceModel,
    ledger: Mutex<Ledger>,
    rng: Mutex<StdRng>,
    maker_fee: f64,
    taker_fee: f64,
    max_execution_delay: f64,
    log_target: String,
}

impl BacktestExchange {
    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn execution_delay(&self) -> f64 {
        if self.max_execution_delay <= 0.0 {
            return 0.0;
        }
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        Uniform::new_inclusive(0.0, self.max_execution_delay).sample(&mut *rng)
    }

    fn fee_amount(volume: f64, fee_rate: f64, price: f64) -> f64 {
        volume * fee_rate * price
    }

    fn book(&self, order: Order) -> OrderId {
        let order_id = order.order_id;
        info!(
            target: self.log_target.as_str(),
            "BACKTEST: Booked {} order {} for {} at {} ({:?}, fee {})",
            order.side,
            order_id,
            order.volume,
            order.price,
            order.execution,
            order.fee_amount
        );
        self.ledger().record(order);
        order_id
    }

    /// Ledger snapshot for inspection, mostly by tests and reports.
    pub fn balance_positions(&self) -> Vec<BalancePosition> {
        self.ledger().positions().to_vec()
    }

    pub fn order(&self, order_id: OrderId) -> Option<Order> {
        self.ledger().order(order_id).cloned()
    }

    pub fn store(&self) -> &Arc<OrderBookStore> {
        self.prices.store()
    }
}

#[async_trait]
impl Exchange for BacktestExchange {
    async fn get_balance(&self) -> Result<Balance> {
        let now = self.clock.now();
        Ok(self.ledger().balance_at(now))
    }

    async fn get_buy_price(&self, volume: f64) -> Result<f64> {
        self.prices.price_at(Side::Ask, volume, self.clock.now())
    }

    async fn get_sell_price(&self, volume: f64) -> Result<f64> {
        self.prices.price_at(Side::Bid, volume, self.clock.now())
    }

    async fn get_buy_price_history(
        &self,
        volume: f64,
        start: f64,
        end: f64,
    ) -> Result<Vec<(f64, f64)>> {
        self.prices.history(Side::Ask, volume, start, end)
    }

    async fn get_sell_price_history(
        &self,
        volume: f64,
        start: f64,
        end: f64,
    ) -> Result<Vec<(f64, f64)>> {
        self.prices.history(Side::Bid, volume, start, end)
    }

    async fn get_avg_buy_price(&self, volume: f64, start: f64, end: f64) -> Result<f64> {
        self.prices.average(Side::Ask, volume, start, end)
    }

    async fn get_avg_sell_price(&self, volume: f64, start: f64, end: f64) -> Result<f64> {
        self.prices.average(Side::Bid, volume, start, end)
    }

    async fn get_slope_buy_price(&self, volume: f64, start: f64, end: f64) -> Result<f64> {
        self.prices.slope(Side::Ask, volume, start, end)
    }

    async fn get_slope_sell_price(&self, volume: f64, start: f64, end: f64) -> Result<f64> {
        self.prices.slope(Side::Bid, volume, start, end)
    }

    async fn place_market_order(
        &self,
        side: OrderSide,
        volume: f64,
        fee_currency: FeeCurrency,
    ) -> Result<Vec<OrderId>> {
        validate_volume(volume)?;
        let now = self.clock.now();
        let execution_time = now + self.execution_delay();
        let price = self
            .prices
            .price_at(quote_side(side.is_buy()), volume, execution_time)?;

        let order_id = self.ledger().next_id();
        let order = Order {
            order_id,
            side,
            creation_time: now,
            execution: Execution::At(execution_time),
            fee_rate: self.taker_fee,
            fee_amount: Self::fee_amount(volume, self.taker_fee, price),
            fee_currency,
            volume,
            price,
            canceled: false,
        };
        Ok(vec![self.book(order)])
    }

    async fn place_limit_order(
        &self,
        side: OrderSide,
        volume: f64,
        limit_price: f64,
        fee_currency: FeeCurrency,
    ) -> Result<Vec<OrderId>> {
        validate_volume(volume)?;
        validate_limit(limit_price)?;
        let now = self.clock.now();
        let is_buy = side.is_buy();

        let fill = self
            .store()
            .side(quote_side(is_buy))
            .scan_from(now, |snapshot| {
                let price = weighted_price(volume, &snapshot.levels).ok()?;
                let satisfied = if is_buy {
                    price <= limit_price
                } else {
                    price >= limit_price
                };
                satisfied.then_some((snapshot.time, price))
            });

        let (execution, price, fee_rate) = match fill {
            Some((0, (time, price))) => (Execution::At(time), price, self.taker_fee),
            Some((_, (time, price))) => (Execution::At(time), price, self.maker_fee),
            None => {
                debug!(
                    target: self.log_target.as_str(),
                    "BACKTEST: No remaining snapshot satisfies {side} limit {limit_price} for {volume}"
                );
                (Execution::Unfilled, limit_price, self.maker_fee)
            }
        };
        let fee_amount = match execution {
            Execution::At(_) => Self::fee_amount(volume, fee_rate, price),
            Execution::Unfilled => 0.0,
        };

        let order_id = self.ledger().next_id();
        let order = Order {
            order_id,
            side,
            creation_time: now,
            execution,
            fee_rate,
            fee_amount,
            fee_currency,
            volume,
            price,
            canceled: false,
        };
        Ok(vec![self.book(order)])
    }

    async fn cancel_order(&self, order_id: OrderId) -> Result<()> {
        let now = self.clock.now();
        let changed = self.ledger().cancel(order_id, now)?;
        if changed {
            info!(target: self.log_target.as_str(), "BACKTEST: Canceled order {order_id}");
        } else {
            debug!(
                target: self.log_target.as_str(),
                "BACKTEST: Cancel of order {order_id} had no effect, order already final"
            );
        }
        Ok(())
    }

    async fn get_order_status(&self, order_id: OrderId) -> Result<OrderStatus> {
        let now = self.clock.now();
        self.ledger().status(order_id, now)
    }
}

pub struct BacktestExchangeBuilder {
    store: Arc<OrderBookStore>,
    clock: Arc<dyn Clock>,
    initial: Balance,
    maker_fee: f64,
    taker_fee: f64,
    max_execution_delay: f64,
    seed: u64,
    log_target: String,
}

impl BacktestExchangeBuilder {
    pub fn new(store: Arc<OrderBookStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            initial: Balance::default(),
            maker_fee: 0.0,
            taker_fee: 0.0,
            max_execution_delay: 0.0,
            seed: 0,
            log_target: "bookrunner::backtest".to_string(),
        }
    }

    pub fn with_initial_balance(&mut self, base: f64, quote: f64) -> &mut Self {
        self.initial = Balance { base, quote };
        self
    }

    pub fn with_fees(&mut self, maker_fee: f64, taker_fee: f64) -> &mut Self {
        self.maker_fee = maker_fee;
        self.taker_fee = taker_fee;
        self
    }

    pub fn with_max_execution_delay(&mut self, delay: f64) -> &mut Self {
        self.max_execution_delay = delay;
        self
    }

    pub fn with_seed(&mut self, seed: u64) -> &mut Self {
        self.seed = seed;
        self
    }

    pub fn with_log_target(&mut self, target: impl Into<String>) -> &mut Self {
        self.log_target = target.into();
        self
    }

    pub fn build(&self) -> BacktestExchange {
        BacktestExchange {
            clock: Arc::clone(&self.clock),
            prices: PriceModel::new(Arc::clone(&self.store)),
            ledger: Mutex::new(Ledger::new(self.initial)),
            rng: Mutex::new(StdRng::seed_from_u64(self.seed)),
            maker_fee: self.maker_fee,
            taker_fee: self.taker_fee,
            max_execution_delay: self.max_execution_delay,
            log_target: self.log_target.clone(),
        }
    }
}

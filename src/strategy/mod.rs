//! Strategies decide when to trade. The timer calls [Strategy::tick] at a fixed frequency and
//! [Strategy::finish] once at shutdown; everything else happens through an [Exchange].
//!
//! [ReboundStrategy] buys after the price has dropped from its recent high and has started to
//! climb back, then sells on take-profit, stop-loss or when the position has been held too long.
//! Placing an order and waiting for it to resolve can take many ticks, so every open and close
//! runs as its own task tracked in a [JoinSet]; the tick only decides and spawns. `finish` joins
//! whatever is still in flight before closing what is left open.
mod lifecycle;
mod position;

pub use lifecycle::{await_order, OrderOutcome, WaitPolicy};
pub use position::{Position, PositionId, PositionStatus, Positions};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::task::JoinSet;

use crate::clock::Clock;
use crate::config::{OrderKind, StrategyConfig};
use crate::error::{Error, Result};
use crate::exchange::{Exchange, FeeCurrency, OrderId, OrderSide};
use crate::perf::Statistics;

#[async_trait]
pub trait Strategy: Send + Sync {
    /// Called once per timer step with the current clock time. An error stops the timer, which
    /// still runs [Strategy::finish].
    async fn tick(&self, now: f64) -> Result<()>;
    async fn finish(&self);
}

#[derive(Debug, Default)]
struct TickState {
    first_tick: Option<f64>,
    last_open: Option<f64>,
}

/// State shared between the tick and the order tasks it spawns.
struct Engine {
    exchange: Arc<dyn Exchange>,
    clock: Arc<dyn Clock>,
    positions: Mutex<Positions>,
    config: StrategyConfig,
    log_target: String,
}

impl Engine {
    fn positions(&self) -> MutexGuard<'_, Positions> {
        self.positions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn policy(&self) -> WaitPolicy {
        WaitPolicy {
            poll_interval: self.config.poll_interval,
            order_timeout: self.config.order_timeout,
            cancel_timeout: self.config.cancel_timeout,
        }
    }

    async fn place_open_order(&self) -> Result<OrderId> {
        let volume = self.config.volume;
        let fee_currency = self.config.fee_currency;
        let ids = match self.config.order_kind {
            OrderKind::Market => {
                self.exchange
                    .place_market_order(OrderSide::Buy, volume, fee_currency)
                    .await?
            }
            OrderKind::Limit => {
                let limit = self.exchange.get_buy_price(volume).await? * self.config.limit_ratio;
                self.exchange
                    .place_limit_order(OrderSide::Buy, volume, limit, fee_currency)
                    .await?
            }
        };
        first_id(ids)
    }

    /// Places the opening buy, waits for it and records the position whatever the outcome.
    async fn open_position(&self) -> PositionId {
        let order_id = match self.place_open_order().await {
            Ok(order_id) => order_id,
            Err(err) => {
                error!(
                    target: self.log_target.as_str(),
                    "STRATEGY: Opening order could not be placed: {err}"
                );
                let now = self.clock.now();
                return self.positions().push(PositionStatus::Error, None, now, None);
            }
        };

        let outcome = await_order(
            self.exchange.as_ref(),
            self.clock.as_ref(),
            order_id,
            &self.policy(),
            &self.log_target,
        )
        .await;
        let now = self.clock.now();
        let status = match outcome {
            OrderOutcome::Filled(_) => PositionStatus::Open,
            OrderOutcome::Canceled(_) | OrderOutcome::Unresolved(_) => PositionStatus::Error,
        };
        let position_id = self
            .positions()
            .push(status, Some(order_id), now, outcome.last_status());
        match status {
            PositionStatus::Open => info!(
                target: self.log_target.as_str(),
                "STRATEGY: Opened position {position_id} with order {order_id} at {:?}",
                outcome.last_status().map(|s| s.price)
            ),
            _ => error!(
                target: self.log_target.as_str(),
                "STRATEGY: Position {position_id} failed to open, order {order_id} ended as {outcome:?}"
            ),
        }
        position_id
    }

    /// Base amount the position actually holds.
    fn holding(&self, position_id: PositionId) -> Option<f64> {
        let positions = self.positions();
        let open = positions.get(position_id)?.open_order_status?;
        let base_fee = match self.config.fee_currency {
            FeeCurrency::Base => open.fee,
            FeeCurrency::Quote => 0.0,
        };
        Some(open.executed_volume - base_fee)
    }

    fn resolve_close(
        &self,
        position_id: PositionId,
        status: PositionStatus,
        order_id: Option<OrderId>,
        outcome: Option<OrderOutcome>,
    ) {
        let now = self.clock.now();
        let mut positions = self.positions();
        if let Some(position) = positions.get_mut(position_id) {
            position.status = status;
            position.close_order_id = order_id;
            position.close_time = Some(now);
            position.close_order_status = outcome.and_then(|o| o.last_status());
        }
    }

    /// Sells a position already marked close pending and waits for the sale.
    async fn close_position(&self, position_id: PositionId) {
        let placed = match self.holding(position_id) {
            Some(volume) => self
                .exchange
                .place_market_order(OrderSide::Sell, volume, self.config.fee_currency)
                .await
                .and_then(first_id),
            None => Err(Error::invalid_order(format!(
                "position {position_id} has no filled opening order"
            ))),
        };
        let order_id = match placed {
            Ok(order_id) => order_id,
            Err(err) => {
                error!(
                    target: self.log_target.as_str(),
                    "STRATEGY: Closing order for position {position_id} could not be placed: {err}"
                );
                self.resolve_close(position_id, PositionStatus::Error, None, None);
                return;
            }
        };

        let outcome = await_order(
            self.exchange.as_ref(),
            self.clock.as_ref(),
            order_id,
            &self.policy(),
            &self.log_target,
        )
        .await;
        match outcome {
            OrderOutcome::Filled(status) => {
                info!(
                    target: self.log_target.as_str(),
                    "STRATEGY: Closed position {position_id} with order {order_id} at {}",
                    status.price
                );
                self.resolve_close(
                    position_id,
                    PositionStatus::Closed,
                    Some(order_id),
                    Some(outcome),
                );
            }
            _ => {
                error!(
                    target: self.log_target.as_str(),
                    "STRATEGY: Position {position_id} failed to close, order {order_id} ended as {outcome:?}"
                );
                self.resolve_close(
                    position_id,
                    PositionStatus::Error,
                    Some(order_id),
                    Some(outcome),
                );
            }
        }
    }

    /// Marks the position close pending if it is still open. Returns false if something else got
    /// to it first.
    fn mark_close_pending(&self, position_id: PositionId) -> bool {
        let mut positions = self.positions();
        match positions.get_mut(position_id) {
            Some(position) if position.status == PositionStatus::Open => {
                position.status = PositionStatus::ClosePending;
                true
            }
            _ => false,
        }
    }

    async fn should_open(&self, now: f64) -> Result<bool> {
        let config = &self.config;
        let buy_price = self.exchange.get_buy_price(config.volume).await?;
        let history = self
            .exchange
            .get_buy_price_history(config.volume, now - config.max_window, now)
            .await?;
        let max_price = history
            .iter()
            .map(|(_, price)| *price)
            .fold(f64::NEG_INFINITY, f64::max);
        if max_price <= buy_price * config.drop_ratio {
            return Ok(false);
        }

        let slope = self
            .exchange
            .get_slope_buy_price(config.volume, now - config.slope_window, now)
            .await?;
        if slope <= config.slope_threshold {
            return Ok(false);
        }

        let balance = self.exchange.get_balance().await?;
        if balance.quote <= config.min_quote_balance {
            debug!(
                target: self.log_target.as_str(),
                "STRATEGY: Signal to open but quote balance {} is below minimum", balance.quote
            );
            return Ok(false);
        }

        debug!(
            target: self.log_target.as_str(),
            "STRATEGY: Open signal, max {max_price} against buy {buy_price}, slope {slope}"
        );
        Ok(true)
    }

    /// Why an open position should be closed now, if it should.
    fn close_reason(
        &self,
        now: f64,
        position: &Position,
        sell_price: Option<f64>,
    ) -> Option<&'static str> {
        if now - position.open_time > self.config.max_holding_time {
            return Some("expired");
        }
        let (sell_price, open_price) = (sell_price?, position.open_price()?);
        if sell_price < open_price * self.config.stop_loss_ratio {
            Some("stop-loss")
        } else if sell_price >= open_price * self.config.take_profit_ratio {
            Some("take-profit")
        } else {
            None
        }
    }
}

fn first_id(ids: Vec<OrderId>) -> Result<OrderId> {
    ids.first()
        .copied()
        .ok_or_else(|| Error::backend("place_order", 1, "exchange returned no order id"))
}

pub struct ReboundStrategy {
    engine: Arc<Engine>,
    state: Mutex<TickState>,
    tasks: Mutex<JoinSet<()>>,
}

impl ReboundStrategy {
    fn tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> MutexGuard<'_, TickState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn log_target(&self) -> &str {
        &self.engine.log_target
    }

    /// Closed positions and error count after `since`; pass the returned cursor next time.
    pub fn get_statistics(&self, since: PositionId) -> Statistics {
        self.engine.positions().statistics(since)
    }

    pub fn positions(&self) -> Vec<Position> {
        self.engine.positions().all().to_vec()
    }

    pub fn in_flight(&self) -> usize {
        self.tasks().len()
    }

    fn spawn_open(&self) {
        let engine = Arc::clone(&self.engine);
        self.tasks().spawn(async move {
            engine.open_position().await;
        });
    }

    fn spawn_close(&self, position_id: PositionId) {
        let engine = Arc::clone(&self.engine);
        self.tasks().spawn(async move {
            engine.close_position(position_id).await;
        });
    }

    fn reap(&self) {
        let mut tasks = self.tasks();
        while let Some(res) = tasks.try_join_next() {
            if let Err(err) = res {
                error!(target: self.log_target(), "STRATEGY: Order task failed: {err}");
            }
        }
    }

    async fn evaluate_open(&self, now: f64) {
        let gated = match self.state().last_open {
            Some(last) => now - last < self.engine.config.refractory_interval,
            None => false,
        };
        if gated {
            return;
        }

        match self.engine.should_open(now).await {
            Ok(true) => {
                self.state().last_open = Some(now);
                info!(target: self.log_target(), "STRATEGY: Opening position at {now}");
                self.spawn_open();
            }
            Ok(false) => {}
            Err(err) if err.is_data_gap() => debug!(
                target: self.log_target(),
                "STRATEGY: Skipping open evaluation at {now}: {err}"
            ),
            Err(err) => warn!(
                target: self.log_target(),
                "STRATEGY: Open evaluation at {now} failed: {err}"
            ),
        }
    }

    async fn evaluate_close(&self, now: f64) {
        let open: Vec<Position> = self.engine.positions().open().cloned().collect();
        if open.is_empty() {
            return;
        }

        let volume = self.engine.config.volume;
        let sell_price = match self.engine.exchange.get_sell_price(volume).await {
            Ok(price) => Some(price),
            Err(err) => {
                debug!(
                    target: self.log_target(),
                    "STRATEGY: No sell price at {now}, only expiry is checked: {err}"
                );
                None
            }
        };

        for position in open {
            let Some(reason) = self.engine.close_reason(now, &position, sell_price) else {
                continue;
            };
            if self.engine.mark_close_pending(position.position_id) {
                info!(
                    target: self.log_target(),
                    "STRATEGY: Closing position {} on {reason}", position.position_id
                );
                self.spawn_close(position.position_id);
            }
        }
    }
}

#[async_trait]
impl Strategy for ReboundStrategy {
    async fn tick(&self, now: f64) -> Result<()> {
        let first = *self.state().first_tick.get_or_insert(now);
        if now - first >= self.engine.config.waiting_time {
            self.evaluate_open(now).await;
            self.evaluate_close(now).await;
        }
        self.reap();
        Ok(())
    }

    async fn finish(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks());
        info!(
            target: self.log_target(),
            "STRATEGY: Finishing, waiting on {} order task(s)",
            tasks.len()
        );
        while let Some(res) = tasks.join_next().await {
            if let Err(err) = res {
                error!(target: self.log_target(), "STRATEGY: Order task failed: {err}");
            }
        }

        let open: Vec<PositionId> = self
            .engine
            .positions()
            .open()
            .map(|position| position.position_id)
            .collect();
        for position_id in open {
            if self.engine.mark_close_pending(position_id) {
                info!(target: self.log_target(), "STRATEGY: Closing position {position_id} on finish");
                self.engine.close_position(position_id).await;
            }
        }

        let positions = self.engine.positions();
        let unresolved = positions
            .all()
            .iter()
            .filter(|position| !position.status.is_terminal())
            .count();
        if unresolved > 0 {
            warn!(
                target: self.log_target(),
                "STRATEGY: {unresolved} position(s) still unresolved after finish"
            );
        }
        info!(
            target: self.log_target(),
            "STRATEGY: Finished with {} position(s)",
            positions.len()
        );
    }
}

pub struct ReboundStrategyBuilder {
    exchange: Arc<dyn Exchange>,
    clock: Arc<dyn Clock>,
    config: StrategyConfig,
    log_target: String,
}

impl ReboundStrategyBuilder {
    pub fn new(exchange: Arc<dyn Exchange>, clock: Arc<dyn Clock>) -> Self {
        Self {
            exchange,
            clock,
            config: StrategyConfig::default(),
            log_target: "bookrunner::strategy".to_string(),
        }
    }

    pub fn with_config(&mut self, config: StrategyConfig) -> &mut Self {
        self.config = config;
        self
    }

    pub fn with_log_target(&mut self, target: impl Into<String>) -> &mut Self {
        self.log_target = target.into();
        self
    }

    pub fn build(&self) -> ReboundStrategy {
        ReboundStrategy {
            engine: Arc::new(Engine {
                exchange: Arc::clone(&self.exchange),
                clock: Arc::clone(&self.clock),
                positions: Mutex::new(Positions::new()),
                config: self.config.clone(),
                log_target: self.log_target.clone(),
            }),
            state: Mutex::new(TickState::default()),
            tasks: Mutex::new(JoinSet::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{Position, PositionStatus, ReboundStrategy, ReboundStrategyBuilder, Strategy};
    use crate::clock::{Clock, VirtualClock};
    use crate::config::StrategyConfig;
    use crate::exchange::{
        BacktestExchange, BacktestExchangeBuilder, OrderSide, OrderStatus, Status,
    };
    use crate::orderbook::{Level, OrderBookStore, Side};

    fn config() -> StrategyConfig {
        StrategyConfig {
            volume: 1.0,
            waiting_time: 2.0,
            refractory_interval: 100.0,
            max_window: 10.0,
            slope_window: 2.0,
            drop_ratio: 1.01,
            slope_threshold: 0.0,
            min_quote_balance: 10.0,
            take_profit_ratio: 1.02,
            stop_loss_ratio: 0.9,
            max_holding_time: 1000.0,
            poll_interval: 1.0,
            order_timeout: 5.0,
            cancel_timeout: 5.0,
            ..StrategyConfig::default()
        }
    }

    /// Price falls from 110 to 100 over the first 5 seconds then climbs a point a second.
    fn rebound_price(second: usize) -> f64 {
        let time = second as f64;
        if second <= 5 {
            110.0 - 2.0 * time
        } else {
            100.0 + (time - 5.0)
        }
    }

    fn store_from(price: impl Fn(usize) -> f64) -> Arc<OrderBookStore> {
        let store = OrderBookStore::new();
        for second in 0..60 {
            let time = second as f64;
            let price = price(second);
            store.insert(Side::Ask, time, vec![Level::new(price, 10.0)]);
            store.insert(Side::Bid, time, vec![Level::new(price - 0.5, 10.0)]);
        }
        Arc::new(store)
    }

    fn setup(
        config: StrategyConfig,
        quote: f64,
    ) -> (Arc<VirtualClock>, Arc<BacktestExchange>, ReboundStrategy) {
        setup_with(store_from(rebound_price), config, quote)
    }

    fn setup_with(
        store: Arc<OrderBookStore>,
        config: StrategyConfig,
        quote: f64,
    ) -> (Arc<VirtualClock>, Arc<BacktestExchange>, ReboundStrategy) {
        let clock = Arc::new(VirtualClock::new(0.0));
        let exchange = Arc::new(
            BacktestExchangeBuilder::new(store, clock.clone())
                .with_initial_balance(0.0, quote)
                .build(),
        );
        let strategy = ReboundStrategyBuilder::new(exchange.clone(), clock.clone())
            .with_config(config)
            .build();
        (clock, exchange, strategy)
    }

    async fn run(clock: &VirtualClock, strategy: &ReboundStrategy, until: f64) {
        while clock.now() <= until {
            strategy.tick(clock.now()).await.unwrap();
            clock.advance(1.0);
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_that_nothing_trades_during_warm_up() {
        let config = StrategyConfig {
            waiting_time: 50.0,
            ..config()
        };
        let (clock, _exchange, strategy) = setup(config, 1000.0);
        run(&clock, &strategy, 20.0).await;
        assert_eq!(strategy.in_flight(), 0);
        assert!(strategy.positions().is_empty());
    }

    #[tokio::test]
    async fn test_that_rebound_opens_then_takes_profit() {
        let (clock, _exchange, strategy) = setup(config(), 1000.0);
        run(&clock, &strategy, 30.0).await;
        strategy.finish().await;

        let positions = strategy.positions();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].status, PositionStatus::Closed);
        let stats = strategy.get_statistics(0);
        assert_eq!(stats.closed.len(), 1);
        assert!(stats.closed[0].quote_returned > stats.closed[0].quote_invested);
    }

    #[tokio::test]
    async fn test_that_low_balance_blocks_opening() {
        let (clock, _exchange, strategy) = setup(config(), 5.0);
        run(&clock, &strategy, 30.0).await;
        assert!(strategy.positions().is_empty());
    }

    #[tokio::test]
    async fn test_that_finish_closes_open_positions() {
        let config = StrategyConfig {
            take_profit_ratio: 10.0,
            ..config()
        };
        let (clock, exchange, strategy) = setup(config, 1000.0);
        run(&clock, &strategy, 15.0).await;
        assert_eq!(strategy.positions()[0].status, PositionStatus::Open);

        strategy.finish().await;
        let positions = strategy.positions();
        assert_eq!(positions[0].status, PositionStatus::Closed);
        assert_eq!(exchange.balance_positions().len(), 2);
    }

    #[tokio::test]
    async fn test_that_price_crash_triggers_stop_loss() {
        let config = StrategyConfig {
            take_profit_ratio: 10.0,
            ..config()
        };
        let crash = |second: usize| {
            if second >= 20 {
                50.0
            } else {
                rebound_price(second)
            }
        };
        let (clock, _exchange, strategy) = setup_with(store_from(crash), config, 1000.0);
        run(&clock, &strategy, 19.0).await;
        assert_eq!(strategy.positions()[0].status, PositionStatus::Open);

        run(&clock, &strategy, 30.0).await;
        let positions = strategy.positions();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].status, PositionStatus::Closed);
        let close_time = positions[0].close_time.unwrap();
        assert!((20.0..=23.0).contains(&close_time), "closed at {close_time}");
        let stats = strategy.get_statistics(0);
        assert!(stats.closed[0].quote_returned < stats.closed[0].quote_invested);
    }

    #[tokio::test]
    async fn test_that_position_expires_after_max_holding_time() {
        let config = StrategyConfig {
            take_profit_ratio: 10.0,
            stop_loss_ratio: 0.0,
            max_holding_time: 30.0,
            ..config()
        };
        let (clock, _exchange, strategy) = setup(config, 1000.0);
        run(&clock, &strategy, 30.0).await;
        let open_time = strategy.positions()[0].open_time;
        assert_eq!(strategy.positions()[0].status, PositionStatus::Open);

        run(&clock, &strategy, 50.0).await;
        let position = strategy.positions()[0].clone();
        assert_eq!(position.status, PositionStatus::Closed);
        let held = position.close_time.unwrap() - open_time;
        assert!(held > 30.0 && held <= 34.0, "held for {held}");
    }

    #[tokio::test]
    async fn test_that_expiry_is_checked_before_price_exits() {
        let (_clock, _exchange, strategy) = setup(config(), 1000.0);
        let position = Position {
            position_id: 1,
            status: PositionStatus::Open,
            open_order_id: Some(1),
            open_time: 0.0,
            open_order_status: Some(OrderStatus {
                status: Status::Closed,
                requested_volume: 1.0,
                executed_volume: 1.0,
                fee: 0.0,
                price: 100.0,
                side: OrderSide::Buy,
            }),
            close_order_id: None,
            close_time: None,
            close_order_status: None,
        };
        let engine = &strategy.engine;

        assert_eq!(engine.close_reason(2000.0, &position, Some(50.0)), Some("expired"));
        assert_eq!(engine.close_reason(2000.0, &position, Some(200.0)), Some("expired"));
        assert_eq!(engine.close_reason(2000.0, &position, None), Some("expired"));
        assert_eq!(engine.close_reason(10.0, &position, Some(50.0)), Some("stop-loss"));
        assert_eq!(engine.close_reason(10.0, &position, Some(102.0)), Some("take-profit"));
        assert_eq!(engine.close_reason(10.0, &position, Some(101.0)), None);
        assert_eq!(engine.close_reason(10.0, &position, None), None);
    }
}

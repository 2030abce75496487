//! Exchange backed by a venue reached over the network.
//!
//! The network client itself is an [ExchangeClient]: it issues a request and either returns a
//! typed value or fails. [LiveExchange] wraps every client call in a bounded retry with a fixed
//! backoff, paced by the engine clock, and surfaces an exhausted retry as a backend error.
//!
//! Prices are not fetched per query. A collector loop polls the client for the current book,
//! stores both sides in the exchange's own [OrderBookStore] and evicts anything older than
//! `max_age`; price queries then go through the same [PriceModel] the backtest uses. If the
//! collector exhausts its retries it stops and reports itself dead through
//! [LiveExchange::is_collector_alive] so the host can decide whether to halt.
mod http;

pub use http::{HttpExchangeClient, PlaceOrderRequest, PlaceOrderResponse};

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::exchange::{
    validate_limit, validate_volume, Balance, Exchange, FeeCurrency, OrderId, OrderSide,
    OrderStatus,
};
use crate::orderbook::{Level, OrderBookStore, Side};
use crate::price::PriceModel;

/// Both sides of the book as returned by one poll of the venue, best level first.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct BookUpdate {
    pub asks: Vec<Level>,
    pub bids: Vec<Level>,
}

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn fetch_order_book(&self) -> anyhow::Result<BookUpdate>;
    async fn fetch_balance(&self) -> anyhow::Result<Balance>;
    async fn submit_market_order(
        &self,
        side: OrderSide,
        volume: f64,
        fee_currency: FeeCurrency,
    ) -> anyhow::Result<OrderId>;
    async fn submit_limit_order(
        &self,
        side: OrderSide,
        volume: f64,
        limit_price: f64,
        fee_currency: FeeCurrency,
    ) -> anyhow::Result<OrderId>;
    async fn cancel_order(&self, order_id: OrderId) -> anyhow::Result<()>;
    async fn fetch_order(&self, order_id: OrderId) -> anyhow::Result<OrderStatus>;
}

#[derive(Debug)]
pub struct LiveExchange<C: ExchangeClient> {
    client: C,
    clock: Arc<dyn Clock>,
    prices: PriceModel,
    retry_attempts: u32,
    retry_backoff: f64,
    collect_interval: f64,
    max_age: f64,
    collector_alive: AtomicBool,
    log_target: String,
}

impl<C: ExchangeClient> LiveExchange<C> {
    async fn with_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        T: Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<T>> + Send,
    {
        let attempts = self.retry_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    warn!(
                        target: self.log_target.as_str(),
                        "LIVE: {operation} failed on attempt {attempt}/{attempts}: {err:#}"
                    );
                    last_error = format!("{err:#}");
                    if attempt < attempts {
                        self.clock.suspend(self.retry_backoff).await;
                    }
                }
            }
        }
        error!(
            target: self.log_target.as_str(),
            "LIVE: {operation} gave up after {attempts} attempt(s): {last_error}"
        );
        Err(Error::backend(operation, attempts, last_error))
    }

    pub fn store(&self) -> &Arc<OrderBookStore> {
        self.prices.store()
    }

    pub fn is_collector_alive(&self) -> bool {
        self.collector_alive.load(Ordering::SeqCst)
    }

    /// Polls the venue book until `stop` flips to true. Returns the backend error, and marks the
    /// collector dead, if a poll exhausts its retries.
    pub async fn run_collector(&self, mut stop: watch::Receiver<bool>) -> Result<()> {
        self.collector_alive.store(true, Ordering::SeqCst);
        info!(target: self.log_target.as_str(), "LIVE: Order book collector started");
        loop {
            if *stop.borrow() {
                break;
            }

            let book = match self
                .with_retry("fetch_order_book", || self.client.fetch_order_book())
                .await
            {
                Ok(book) => book,
                Err(err) => {
                    self.collector_alive.store(false, Ordering::SeqCst);
                    error!(
                        target: self.log_target.as_str(),
                        "LIVE: Order book collector is dead: {err}"
                    );
                    return Err(err);
                }
            };

            let now = self.clock.now();
            let store = self.store();
            store.insert(Side::Ask, now, book.asks);
            store.insert(Side::Bid, now, book.bids);
            store.evict_older_than(self.max_age, now);

            tokio::select! {
                _ = self.clock.suspend(self.collect_interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        self.collector_alive.store(false, Ordering::SeqCst);
        info!(target: self.log_target.as_str(), "LIVE: Order book collector stopped");
        Ok(())
    }
}

impl<C: ExchangeClient + 'static> LiveExchange<C> {
    pub fn spawn_collector(
        self: &Arc<Self>,
        stop: watch::Receiver<bool>,
    ) -> JoinHandle<Result<()>> {
        let exchange = Arc::clone(self);
        tokio::spawn(async move { exchange.run_collector(stop).await })
    }
}

#[async_trait]
impl<C: ExchangeClient> Exchange for LiveExchange<C> {
    async fn get_balance(&self) -> Result<Balance> {
        self.with_retry("get_balance", || self.client.fetch_balance())
            .await
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
        let order_id = self
            .with_retry("place_market_order", || {
                self.client.submit_market_order(side, volume, fee_currency)
            })
            .await?;
        info!(
            target: self.log_target.as_str(),
            "LIVE: Placed {side} market order {order_id} for {volume}"
        );
        Ok(vec![order_id])
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
        let order_id = self
            .with_retry("place_limit_order", || {
                self.client
                    .submit_limit_order(side, volume, limit_price, fee_currency)
            })
            .await?;
        info!(
            target: self.log_target.as_str(),
            "LIVE: Placed {side} limit order {order_id} for {volume} at {limit_price}"
        );
        Ok(vec![order_id])
    }

    async fn cancel_order(&self, order_id: OrderId) -> Result<()> {
        self.with_retry("cancel_order", || self.client.cancel_order(order_id))
            .await
    }

    async fn get_order_status(&self, order_id: OrderId) -> Result<OrderStatus> {
        self.with_retry("get_order_status", || self.client.fetch_order(order_id))
            .await
    }
}

pub struct LiveExchangeBuilder<C: ExchangeClient> {
    client: Option<C>,
    clock: Arc<dyn Clock>,
    store: Arc<OrderBookStore>,
    retry_attempts: u32,
    retry_backoff: f64,
    collect_interval: f64,
    max_age: f64,
    log_target: String,
}

impl<C: ExchangeClient> LiveExchangeBuilder<C> {
    pub fn new(client: C, clock: Arc<dyn Clock>) -> Self {
        Self {
            client: Some(client),
            clock,
            store: Arc::new(OrderBookStore::new()),
            retry_attempts: 3,
            retry_backoff: 1.0,
            collect_interval: 1.0,
            max_age: 3600.0,
            log_target: "bookrunner::live".to_string(),
        }
    }

    pub fn with_store(&mut self, store: Arc<OrderBookStore>) -> &mut Self {
        self.store = store;
        self
    }

    pub fn with_retry(&mut self, attempts: u32, backoff: f64) -> &mut Self {
        self.retry_attempts = attempts;
        self.retry_backoff = backoff;
        self
    }

    pub fn with_collection(&mut self, interval: f64, max_age: f64) -> &mut Self {
        self.collect_interval = interval;
        self.max_age = max_age;
        self
    }

    pub fn with_log_target(&mut self, target: impl Into<String>) -> &mut Self {
        self.log_target = target.into();
        self
    }

    pub fn build(&mut self) -> anyhow::Result<LiveExchange<C>> {
        let client = match self.client.take() {
            Some(client) => client,
            None => anyhow::bail!("live exchange builder has already been used"),
        };
        Ok(LiveExchange {
            client,
            clock: Arc::clone(&self.clock),
            prices: PriceModel::new(Arc::clone(&self.store)),
            retry_attempts: self.retry_attempts,
            retry_backoff: self.retry_backoff,
            collect_interval: self.collect_interval,
            max_age: self.max_age,
            collector_alive: AtomicBool::new(false),
            log_target: self.log_target.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use anyhow::anyhow;
    use async_trait::async_trait;
    use tokio::sync::watch;

    use super::{BookUpdate, ExchangeClient, LiveExchange, LiveExchangeBuilder};
    use crate::clock::VirtualClock;
    use crate::error::Error;
    use crate::exchange::{
        Balance, Exchange, FeeCurrency, OrderId, OrderSide, OrderStatus, Status,
    };
    use crate::orderbook::Level;

    /// Fails the first `failures` calls of every kind, then answers with fixed data.
    #[derive(Debug, Default)]
    struct FlakyClient {
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyClient {
        fn attempt(&self) -> anyhow::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(anyhow!("timeout on call {call}"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ExchangeClient for FlakyClient {
        async fn fetch_order_book(&self) -> anyhow::Result<BookUpdate> {
            self.attempt()?;
            Ok(BookUpdate {
                asks: vec![Level::new(101.0, 5.0)],
                bids: vec![Level::new(99.0, 5.0)],
            })
        }

        async fn fetch_balance(&self) -> anyhow::Result<Balance> {
            self.attempt()?;
            Ok(Balance {
                base: 1.0,
                quote: 500.0,
            })
        }

        async fn submit_market_order(
            &self,
            _side: OrderSide,
            _volume: f64,
            _fee_currency: FeeCurrency,
        ) -> anyhow::Result<OrderId> {
            self.attempt()?;
            Ok(7)
        }

        async fn submit_limit_order(
            &self,
            _side: OrderSide,
            _volume: f64,
            _limit_price: f64,
            _fee_currency: FeeCurrency,
        ) -> anyhow::Result<OrderId> {
            self.attempt()?;
            Ok(8)
        }

        async fn cancel_order(&self, _order_id: OrderId) -> anyhow::Result<()> {
            self.attempt()
        }

        async fn fetch_order(&self, _order_id: OrderId) -> anyhow::Result<OrderStatus> {
            self.attempt()?;
            Ok(OrderStatus {
                status: Status::Closed,
                requested_volume: 1.0,
                executed_volume: 1.0,
                fee: 0.1,
                price: 101.0,
                side: OrderSide::Buy,
            })
        }
    }

    fn exchange(failures: u32, attempts: u32) -> LiveExchange<FlakyClient> {
        let client = FlakyClient {
            failures,
            calls: AtomicU32::new(0),
        };
        LiveExchangeBuilder::new(client, Arc::new(VirtualClock::new(1000.0)))
            .with_retry(attempts, 0.0)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_that_transient_failures_are_retried() {
        let exchange = exchange(2, 3);
        let balance = exchange.get_balance().await.unwrap();
        assert_eq!(balance.quote, 500.0);
        assert_eq!(exchange.client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_that_exhausted_retries_surface_as_backend_error() {
        let exchange = exchange(10, 3);
        let res = exchange
            .place_market_order(OrderSide::Buy, 1.0, FeeCurrency::Quote)
            .await;
        match res {
            Err(Error::Backend {
                operation,
                attempts,
                ..
            }) => {
                assert_eq!(operation, "place_market_order");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected backend error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_that_invalid_order_never_reaches_client() {
        let exchange = exchange(0, 3);
        let res = exchange
            .place_limit_order(OrderSide::Sell, 1.0, 0.0, FeeCurrency::Quote)
            .await;
        assert!(matches!(res, Err(Error::InvalidOrder { .. })));
        assert_eq!(exchange.client.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_that_collector_feeds_prices_until_stopped() {
        let exchange = Arc::new(exchange(0, 1));
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = exchange.spawn_collector(stop_rx);

        while exchange.store().asks().is_empty() {
            tokio::task::yield_now().await;
        }
        assert!(exchange.is_collector_alive());
        assert_eq!(exchange.get_buy_price(1.0).await.unwrap(), 101.0);
        assert_eq!(exchange.get_sell_price(1.0).await.unwrap(), 99.0);

        stop_tx.send(true).unwrap();
        assert!(handle.await.unwrap().is_ok());
        assert!(!exchange.is_collector_alive());
    }

    #[tokio::test]
    async fn test_that_collector_dies_on_exhausted_retries() {
        let exchange = exchange(100, 2);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let res = exchange.run_collector(stop_rx).await;
        assert!(matches!(res, Err(Error::Backend { .. })));
        assert!(!exchange.is_collector_alive());
    }
}

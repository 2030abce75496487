use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::exchange::{Balance, FeeCurrency, OrderId, OrderSide, OrderStatus, Status};

/// When a replayed order executes. Orders that no remaining snapshot would fill are `Unfilled`
/// rather than carrying a sentinel time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Execution {
    At(f64),
    Unfilled,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Order {
    pub order_id: OrderId,
    pub side: OrderSide,
    pub creation_time: f64,
    pub execution: Execution,
    pub fee_rate: f64,
    pub fee_amount: f64,
    pub fee_currency: FeeCurrency,
    pub volume: f64,
    pub price: f64,
    pub canceled: bool,
}

impl Order {
    pub fn status(&self, now: f64) -> OrderStatus {
        let (status, executed_volume, fee) = if self.canceled {
            (Status::Canceled, 0.0, 0.0)
        } else {
            match self.execution {
                Execution::At(time) if now >= time => (Status::Closed, self.volume, self.fee_amount),
                _ => (Status::Open, 0.0, 0.0),
            }
        };
        OrderStatus {
            status,
            requested_volume: self.volume,
            executed_volume,
            fee,
            price: self.price,
            side: self.side,
        }
    }

    /// Balance effect of this order once it executes.
    fn deltas(&self) -> (f64, f64) {
        let (base_fee, quote_fee) = match self.fee_currency {
            FeeCurrency::Base => (self.fee_amount, 0.0),
            FeeCurrency::Quote => (0.0, self.fee_amount),
        };
        let notional = self.volume * self.price;
        match self.side {
            OrderSide::Buy => (self.volume - base_fee, -notional - quote_fee),
            OrderSide::Sell => (-self.volume - base_fee, notional - quote_fee),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BalancePosition {
    pub order_id: OrderId,
    pub time: f64,
    pub base_delta: f64,
    pub quote_delta: f64,
}

/// Orders and their balance effects. Balance positions stay sorted by time whatever order they
/// are inserted in.
#[derive(Debug)]
pub struct Ledger {
    orders: HashMap<OrderId, Order>,
    positions: Vec<BalancePosition>,
    initial: Balance,
    last_id: OrderId,
}

impl Ledger {
    pub fn new(initial: Balance) -> Self {
        Self {
            orders: HashMap::new(),
            positions: Vec::new(),
            initial,
            last_id: 0,
        }
    }

    pub fn next_id(&mut self) -> OrderId {
        self.last_id += 1;
        self.last_id
    }

    /// Stores the order and, if it will execute, books its balance effect at the execution time.
    pub fn record(&mut self, order: Order) {
        if let Execution::At(time) = order.execution {
            let (base_delta, quote_delta) = order.deltas();
            let idx = self.positions.partition_point(|position| position.time <= time);
            self.positions.insert(
                idx,
                BalancePosition {
                    order_id: order.order_id,
                    time,
                    base_delta,
                    quote_delta,
                },
            );
        }
        self.orders.insert(order.order_id, order);
    }

    pub fn balance_at(&self, now: f64) -> Balance {
        let visible = self.positions.partition_point(|position| position.time <= now);
        self.positions[..visible]
            .iter()
            .fold(self.initial, |balance, position| Balance {
                base: balance.base + position.base_delta,
                quote: balance.quote + position.quote_delta,
            })
    }

    pub fn status(&self, order_id: OrderId, now: f64) -> Result<OrderStatus> {
        self.orders
            .get(&order_id)
            .map(|order| order.status(now))
            .ok_or(Error::NotFound { order_id })
    }

    /// Cancels the order if it has not executed by `now`. Returns whether anything changed; an
    /// order that already executed keeps its fill.
    pub fn cancel(&mut self, order_id: OrderId, now: f64) -> Result<bool> {
        let order = self
            .orders
            .get_mut(&order_id)
            .ok_or(Error::NotFound { order_id })?;

        if order.canceled {
            return Ok(false);
        }
        if let Execution::At(time) = order.execution {
            if now >= time {
                return Ok(false);
            }
        }

        order.canceled = true;
        order.execution = Execution::Unfilled;
        self.positions.retain(|position| position.order_id != order_id);
        Ok(true)
    }

    pub fn positions(&self) -> &[BalancePosition] {
        &self.positions
    }

    pub fn order(&self, order_id: OrderId) -> Option<&Order> {
        self.orders.get(&order_id)
    }
}

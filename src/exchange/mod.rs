//! Exchanges are the only way the strategy touches the market. [Exchange] is the contract every
//! backend satisfies; the strategy is written against it and never knows whether prices and
//! fills come from a replay ([BacktestExchange]) or from a venue ([LiveExchange]).
//!
//! Any call can fail with a backend error. Callers treat that as "this call failed" and carry on,
//! the exchange itself stays usable.
pub mod backtest;
pub mod live;

pub use backtest::{BacktestExchange, BacktestExchangeBuilder};
pub use live::{
    BookUpdate, ExchangeClient, HttpExchangeClient, LiveExchange, LiveExchangeBuilder,
};

use std::fmt::{self, Display};
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub type OrderId = u64;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn is_buy(&self) -> bool {
        matches!(self, Self::Buy)
    }
}

impl Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

impl FromStr for OrderSide {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "buy" => Ok(Self::Buy),
            "sell" => Ok(Self::Sell),
            other => Err(Error::invalid_order(format!("unknown side {other:?}"))),
        }
    }
}

/// Currency the fee is charged in.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeCurrency {
    Base,
    #[default]
    Quote,
}

impl FeeCurrency {
    pub fn is_base(&self) -> bool {
        matches!(self, Self::Base)
    }
}

impl FromStr for FeeCurrency {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "base" => Ok(Self::Base),
            "quote" => Ok(Self::Quote),
            other => Err(Error::invalid_order(format!("unknown fee mode {other:?}"))),
        }
    }
}

impl From<bool> for FeeCurrency {
    fn from(in_base: bool) -> Self {
        if in_base {
            Self::Base
        } else {
            Self::Quote
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Open,
    Closed,
    Canceled,
    Expired,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Canceled | Self::Expired)
    }
}

/// Point-in-time view of an order as reported by an exchange. Not persisted anywhere.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub struct OrderStatus {
    pub status: Status,
    pub requested_volume: f64,
    pub executed_volume: f64,
    pub fee: f64,
    pub price: f64,
    pub side: OrderSide,
}

/// Base and quote amounts held.
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Balance {
    pub base: f64,
    pub quote: f64,
}

pub(crate) fn validate_volume(volume: f64) -> Result<()> {
    if volume > 0.0 && volume.is_finite() {
        Ok(())
    } else {
        Err(Error::invalid_order(format!(
            "volume must be positive, got {volume}"
        )))
    }
}

pub(crate) fn validate_limit(limit_price: f64) -> Result<()> {
    if limit_price > 0.0 && limit_price.is_finite() {
        Ok(())
    } else {
        Err(Error::invalid_order(format!(
            "limit price must be positive, got {limit_price}"
        )))
    }
}

#[async_trait]
pub trait Exchange: Send + Sync {
    async fn get_balance(&self) -> Result<Balance>;

    async fn get_buy_price(&self, volume: f64) -> Result<f64>;
    async fn get_sell_price(&self, volume: f64) -> Result<f64>;

    /// `(relative_time, price)` pairs over `[start, end]`, time starting at zero.
    async fn get_buy_price_history(&self, volume: f64, start: f64, end: f64)
        -> Result<Vec<(f64, f64)>>;
    async fn get_sell_price_history(&self, volume: f64, start: f64, end: f64)
        -> Result<Vec<(f64, f64)>>;

    /// Median price over the window.
    async fn get_avg_buy_price(&self, volume: f64, start: f64, end: f64) -> Result<f64>;
    async fn get_avg_sell_price(&self, volume: f64, start: f64, end: f64) -> Result<f64>;

    /// Regression slope of price against time over the window.
    async fn get_slope_buy_price(&self, volume: f64, start: f64, end: f64) -> Result<f64>;
    async fn get_slope_sell_price(&self, volume: f64, start: f64, end: f64) -> Result<f64>;

    /// Returns exactly one id on success.
    async fn place_market_order(
        &self,
        side: OrderSide,
        volume: f64,
        fee_currency: FeeCurrency,
    ) -> Result<Vec<OrderId>>;

    async fn place_limit_order(
        &self,
        side: OrderSide,
        volume: f64,
        limit_price: f64,
        fee_currency: FeeCurrency,
    ) -> Result<Vec<OrderId>>;

    /// Idempotent once the order is terminal.
    async fn cancel_order(&self, order_id: OrderId) -> Result<()>;

    async fn get_order_status(&self, order_id: OrderId) -> Result<OrderStatus>;
}

#[cfg(test)]
mod tests {
    use super::{FeeCurrency, OrderSide, Status};
    use crate::error::Error;

    #[test]
    fn test_that_sides_parse_case_insensitively() {
        assert_eq!("BUY".parse::<OrderSide>().unwrap(), OrderSide::Buy);
        assert_eq!("sell".parse::<OrderSide>().unwrap(), OrderSide::Sell);
        assert!(matches!(
            "hold".parse::<OrderSide>(),
            Err(Error::InvalidOrder { .. })
        ));
    }

    #[test]
    fn test_that_unknown_fee_mode_is_invalid() {
        assert_eq!("base".parse::<FeeCurrency>().unwrap(), FeeCurrency::Base);
        assert!(matches!(
            "usd".parse::<FeeCurrency>(),
            Err(Error::InvalidOrder { .. })
        ));
        assert_eq!(FeeCurrency::from(true), FeeCurrency::Base);
    }

    #[test]
    fn test_that_only_final_states_are_terminal() {
        assert!(Status::Closed.is_terminal());
        assert!(Status::Canceled.is_terminal());
        assert!(Status::Expired.is_terminal());
        assert!(!Status::Open.is_terminal());
        assert!(!Status::Pending.is_terminal());
    }
}

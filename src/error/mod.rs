//! Errors shared by the store, price model, exchanges and strategy.
//!
//! Price and history queries hand these straight back to the caller. Order tasks catch them at
//! the task boundary and turn them into an errored position, so nothing here is expected to
//! reach the timer loop in normal operation.
use derive_more::Display;

use crate::exchange::OrderId;

#[derive(Debug, Display, derive_more::Error, Clone, PartialEq)]
pub enum Error {
    /// No snapshot has been stored yet.
    #[display("order book store is empty")]
    EmptyStore,
    /// The visible depth cannot absorb the requested volume.
    #[display("insufficient depth: requested {requested}, available {available}")]
    InsufficientDepth { requested: f64, available: f64 },
    /// Network or API failure after retries, malformed response, or exhausted replay data.
    #[display("backend failure in {operation} after {attempts} attempt(s): {message}")]
    Backend {
        operation: String,
        attempts: u32,
        message: String,
    },
    #[display("invalid order: {reason}")]
    InvalidOrder { reason: String },
    #[display("unknown order id {order_id}")]
    NotFound { order_id: OrderId },
}

impl Error {
    pub fn backend(operation: impl Into<String>, attempts: u32, message: impl ToString) -> Self {
        Self::Backend {
            operation: operation.into(),
            attempts,
            message: message.to_string(),
        }
    }

    pub fn invalid_order(reason: impl Into<String>) -> Self {
        Self::InvalidOrder {
            reason: reason.into(),
        }
    }

    /// Errors that only mean "no price right now" rather than a broken backend.
    pub fn is_data_gap(&self) -> bool {
        matches!(self, Self::EmptyStore | Self::InsufficientDepth { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

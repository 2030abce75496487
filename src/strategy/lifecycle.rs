use log::{error, info, warn};

use crate::clock::Clock;
use crate::exchange::{Exchange, OrderId, OrderStatus, Status};

/// How long to wait on an order. All values are seconds of the engine clock.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WaitPolicy {
    pub poll_interval: f64,
    pub order_timeout: f64,
    pub cancel_timeout: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OrderOutcome {
    Filled(OrderStatus),
    /// Canceled or expired, either by us after a timeout or by the venue.
    Canceled(OrderStatus),
    /// Cancellation was requested but never confirmed. Holds the last status seen, if any.
    Unresolved(Option<OrderStatus>),
}

impl OrderOutcome {
    pub fn last_status(&self) -> Option<OrderStatus> {
        match self {
            Self::Filled(status) | Self::Canceled(status) => Some(*status),
            Self::Unresolved(status) => *status,
        }
    }
}

enum Poll {
    Done(OrderOutcome),
    TimedOut(Option<OrderStatus>),
}

/// Polls `order_id` until it is terminal or `timeout` passes. Status errors are logged and
/// polling carries on; only the deadline ends the loop.
async fn poll_until_terminal(
    exchange: &dyn Exchange,
    clock: &dyn Clock,
    order_id: OrderId,
    timeout: f64,
    policy: &WaitPolicy,
    log_target: &str,
    mut last: Option<OrderStatus>,
) -> Poll {
    let start = clock.now();
    loop {
        match exchange.get_order_status(order_id).await {
            Ok(status) => {
                last = Some(status);
                match status.status {
                    Status::Closed => return Poll::Done(OrderOutcome::Filled(status)),
                    Status::Canceled | Status::Expired => {
                        return Poll::Done(OrderOutcome::Canceled(status))
                    }
                    Status::Pending | Status::Open => {}
                }
            }
            Err(err) => {
                warn!(target: log_target, "STRATEGY: Status of order {order_id} unavailable: {err}");
            }
        }

        if clock.now() - start >= timeout {
            return Poll::TimedOut(last);
        }
        clock.suspend(policy.poll_interval).await;
    }
}

/// Waits for `order_id` to fill. On timeout it requests cancellation once and then waits up to
/// the cancel timeout for the venue to confirm.
pub async fn await_order(
    exchange: &dyn Exchange,
    clock: &dyn Clock,
    order_id: OrderId,
    policy: &WaitPolicy,
    log_target: &str,
) -> OrderOutcome {
    let last = match poll_until_terminal(
        exchange,
        clock,
        order_id,
        policy.order_timeout,
        policy,
        log_target,
        None,
    )
    .await
    {
        Poll::Done(outcome) => return outcome,
        Poll::TimedOut(last) => last,
    };

    info!(
        target: log_target,
        "STRATEGY: Order {order_id} not filled after {}s, canceling", policy.order_timeout
    );
    if let Err(err) = exchange.cancel_order(order_id).await {
        error!(target: log_target, "STRATEGY: cancel_order failed for order {order_id}: {err}");
    }

    match poll_until_terminal(
        exchange,
        clock,
        order_id,
        policy.cancel_timeout,
        policy,
        log_target,
        last,
    )
    .await
    {
        Poll::Done(outcome) => outcome,
        Poll::TimedOut(last) => {
            error!(
                target: log_target,
                "STRATEGY: Cancellation of order {order_id} unconfirmed after {}s",
                policy.cancel_timeout
            );
            OrderOutcome::Unresolved(last)
        }
    }
}

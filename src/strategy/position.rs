use serde::{Deserialize, Serialize};

use crate::exchange::{OrderId, OrderStatus};
use crate::perf::{ClosedPositionRecord, Statistics};

pub type PositionId = u64;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    ClosePending,
    Closed,
    Error,
}

impl PositionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Position {
    pub position_id: PositionId,
    pub status: PositionStatus,
    pub open_order_id: Option<OrderId>,
    pub open_time: f64,
    pub open_order_status: Option<OrderStatus>,
    pub close_order_id: Option<OrderId>,
    pub close_time: Option<f64>,
    pub close_order_status: Option<OrderStatus>,
}

impl Position {
    pub fn open_price(&self) -> Option<f64> {
        self.open_order_status.map(|status| status.price)
    }

    fn closed_record(&self) -> Option<ClosedPositionRecord> {
        if self.status != PositionStatus::Closed {
            return None;
        }
        let open = self.open_order_status?;
        let close = self.close_order_status?;
        Some(ClosedPositionRecord {
            position_id: self.position_id,
            open_time: self.open_time,
            close_time: self.close_time?,
            quote_invested: open.executed_volume * open.price + open.fee,
            quote_returned: close.executed_volume * close.price - close.fee,
        })
    }
}

/// Every position the strategy has created, in creation order. Ids start at one and are dense.
#[derive(Debug, Default)]
pub struct Positions {
    inner: Vec<Position>,
}

impl Positions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a position built from the opening order's outcome and returns its id.
    pub fn push(
        &mut self,
        status: PositionStatus,
        open_order_id: Option<OrderId>,
        open_time: f64,
        open_order_status: Option<OrderStatus>,
    ) -> PositionId {
        let position_id = self.inner.len() as PositionId + 1;
        self.inner.push(Position {
            position_id,
            status,
            open_order_id,
            open_time,
            open_order_status,
            close_order_id: None,
            close_time: None,
            close_order_status: None,
        });
        position_id
    }

    pub fn get(&self, position_id: PositionId) -> Option<&Position> {
        let idx = usize::try_from(position_id).ok()?.checked_sub(1)?;
        self.inner.get(idx)
    }

    pub fn get_mut(&mut self, position_id: PositionId) -> Option<&mut Position> {
        let idx = usize::try_from(position_id).ok()?.checked_sub(1)?;
        self.inner.get_mut(idx)
    }

    pub fn open(&self) -> impl Iterator<Item = &Position> {
        self.inner
            .iter()
            .filter(|position| position.status == PositionStatus::Open)
    }

    pub fn all(&self) -> &[Position] {
        &self.inner
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Closed positions and the error count after `since`.
    ///
    /// The returned cursor is the highest id reported, which stops before the first position
    /// that is not yet terminal. Advancing it past an open position would lose that position's
    /// result once it closes. The cost is that one long-held position delays every later
    /// result until it closes or errors.
    pub fn statistics(&self, since: PositionId) -> Statistics {
        let start = usize::try_from(since).unwrap_or(usize::MAX).min(self.inner.len());
        let mut statistics = Statistics {
            cursor: since,
            ..Statistics::default()
        };
        for position in &self.inner[start..] {
            if !position.status.is_terminal() {
                break;
            }
            match position.closed_record() {
                Some(record) => statistics.closed.push(record),
                None => statistics.errors += 1,
            }
            statistics.cursor = position.position_id;
        }
        statistics
    }
}

#[cfg(test)]
mod tests {
    use super::{PositionStatus, Positions};
    use crate::exchange::{OrderSide, OrderStatus, Status};

    fn filled(side: OrderSide, price: f64) -> Option<OrderStatus> {
        Some(OrderStatus {
            status: Status::Closed,
            requested_volume: 2.0,
            executed_volume: 2.0,
            fee: 0.5,
            price,
            side,
        })
    }

    fn close(positions: &mut Positions, id: u64, price: f64) {
        let position = positions.get_mut(id).unwrap();
        position.status = PositionStatus::Closed;
        position.close_order_id = Some(id * 100);
        position.close_time = Some(50.0);
        position.close_order_status = filled(OrderSide::Sell, price);
    }

    #[test]
    fn test_that_ids_are_dense_from_one() {
        let mut positions = Positions::new();
        assert_eq!(positions.push(PositionStatus::Open, Some(1), 0.0, None), 1);
        assert_eq!(positions.push(PositionStatus::Error, None, 1.0, None), 2);
        assert!(positions.get(0).is_none());
        assert_eq!(positions.get(2).unwrap().status, PositionStatus::Error);
        assert!(positions.get(3).is_none());
    }

    #[test]
    fn test_that_statistics_compute_invested_and_returned_with_fees() {
        let mut positions = Positions::new();
        positions.push(PositionStatus::Open, Some(1), 10.0, filled(OrderSide::Buy, 100.0));
        close(&mut positions, 1, 110.0);

        let stats = positions.statistics(0);
        assert_eq!(stats.closed.len(), 1);
        assert_eq!(stats.closed[0].quote_invested, 200.5);
        assert_eq!(stats.closed[0].quote_returned, 219.5);
        assert_eq!(stats.closed[0].open_time, 10.0);
        assert_eq!(stats.closed[0].close_time, 50.0);
        assert_eq!(stats.cursor, 1);
    }

    #[test]
    fn test_that_cursor_never_returns_a_position_twice() {
        let mut positions = Positions::new();
        positions.push(PositionStatus::Open, Some(1), 0.0, filled(OrderSide::Buy, 100.0));
        positions.push(PositionStatus::Error, None, 0.0, None);
        positions.push(PositionStatus::Open, Some(3), 0.0, filled(OrderSide::Buy, 100.0));
        close(&mut positions, 1, 101.0);

        let first = positions.statistics(0);
        assert_eq!(first.closed.len(), 1);
        assert_eq!(first.errors, 1);
        assert_eq!(first.cursor, 2);

        let again = positions.statistics(first.cursor);
        assert!(again.closed.is_empty());
        assert_eq!(again.errors, 0);
        assert_eq!(again.cursor, 2);

        close(&mut positions, 3, 99.0);
        let last = positions.statistics(again.cursor);
        assert_eq!(last.closed.len(), 1);
        assert_eq!(last.closed[0].position_id, 3);
        assert_eq!(last.cursor, 3);
    }

    #[test]
    fn test_that_open_position_holds_back_later_results_until_it_closes() {
        let mut positions = Positions::new();
        positions.push(PositionStatus::Open, Some(1), 0.0, filled(OrderSide::Buy, 100.0));
        positions.push(PositionStatus::Error, None, 0.0, None);

        let held = positions.statistics(0);
        assert!(held.closed.is_empty());
        assert_eq!(held.errors, 0);
        assert_eq!(held.cursor, 0);

        close(&mut positions, 1, 105.0);
        let released = positions.statistics(held.cursor);
        assert_eq!(released.closed.len(), 1);
        assert_eq!(released.closed[0].position_id, 1);
        assert_eq!(released.errors, 1);
        assert_eq!(released.cursor, 2);
    }

    #[test]
    fn test_that_cursor_beyond_end_is_empty() {
        let positions = Positions::new();
        let stats = positions.statistics(10);
        assert!(stats.closed.is_empty());
        assert_eq!(stats.cursor, 10);
    }
}

//! Converts order-book snapshots into executable prices.
//!
//! [weighted_price] walks depth levels best-first and returns the volume-weighted average price of
//! filling the requested volume. It is the same function for both sides, callers only differ in
//! which side of the store they read. [PriceModel] binds it to a store and adds the derived
//! history, median and trend statistics that exchanges expose.
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::orderbook::{Level, OrderBookStore, Side};

/// Volume-weighted average price of consuming `levels` in order until `volume` is filled.
///
/// Fails with [Error::InsufficientDepth] if the levels run out first; a partial price is never
/// returned.
pub fn weighted_price(volume: f64, levels: &[Level]) -> Result<f64> {
    if volume <= 0.0 || !volume.is_finite() {
        return Err(Error::invalid_order(format!(
            "volume must be positive, got {volume}"
        )));
    }

    let mut remaining = volume;
    let mut notional = 0.0;
    for level in levels {
        let take = remaining.min(level.volume);
        notional += take * level.price;
        remaining -= take;
        if remaining <= 0.0 {
            return Ok(notional / volume);
        }
    }

    Err(Error::InsufficientDepth {
        requested: volume,
        available: volume - remaining,
    })
}

/// Median of `values`, averaging the two middle values for an even count. `None` when empty.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Least-squares slope of `(time, price)` pairs. Zero when there are fewer than two points or
/// every point shares one time.
pub fn slope(points: &[(f64, f64)]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    let count = points.len() as f64;
    let mean_t = points.iter().map(|(t, _)| t).sum::<f64>() / count;
    let mean_p = points.iter().map(|(_, p)| p).sum::<f64>() / count;

    let mut covariance = 0.0;
    let mut variance = 0.0;
    for (t, p) in points {
        covariance += (t - mean_t) * (p - mean_p);
        variance += (t - mean_t) * (t - mean_t);
    }
    if variance == 0.0 {
        return 0.0;
    }
    covariance / variance
}

/// Side of the book that prices an order in the given direction.
pub fn quote_side(is_buy: bool) -> Side {
    if is_buy {
        Side::Ask
    } else {
        Side::Bid
    }
}

#[derive(Clone, Debug)]
pub struct PriceModel {
    store: Arc<OrderBookStore>,
}

impl PriceModel {
    pub fn new(store: Arc<OrderBookStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<OrderBookStore> {
        &self.store
    }

    /// Price of `volume` against the snapshot visible at `time`.
    pub fn price_at(&self, side: Side, volume: f64, time: f64) -> Result<f64> {
        let snapshot = self.store.side(side).snapshot_at_or_before(time)?;
        weighted_price(volume, &snapshot.levels)
    }

    /// `(relative_time, price)` for every snapshot in `[start, end]`, time re-based so the first
    /// point is at zero.
    pub fn history(&self, side: Side, volume: f64, start: f64, end: f64) -> Result<Vec<(f64, f64)>> {
        let snapshots = self.store.side(side).range(start, end)?;
        let origin = snapshots.first().map(|point| point.time).unwrap_or(start);
        snapshots
            .iter()
            .map(|point| Ok((point.time - origin, weighted_price(volume, &point.levels)?)))
            .collect()
    }

    pub fn average(&self, side: Side, volume: f64, start: f64, end: f64) -> Result<f64> {
        let prices: Vec<f64> = self
            .history(side, volume, start, end)?
            .into_iter()
            .map(|(_, price)| price)
            .collect();
        median(&prices).ok_or(Error::EmptyStore)
    }

    /// Positive when the price is trending up over the window.
    pub fn slope(&self, side: Side, volume: f64, start: f64, end: f64) -> Result<f64> {
        Ok(slope(&self.history(side, volume, start, end)?))
    }
}

//! Time-series store of order-book snapshots.
//!
//! Each side of the book is held in its own [DepthSeries]: a vector of [Snapshot] sorted ascending
//! by time behind a single mutex. Raw observations that land in the same time bucket are merged
//! into one snapshot by concatenating their levels, so several ticks arriving at (nearly) the
//! same instant build up one snapshot rather than overwriting each other.
//!
//! Lookups saturate: asking for a point after the end of the series returns the last point and
//! asking for a point before the start returns the first. Only an empty series is an error.
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default width of a merge bucket in seconds.
pub const DEFAULT_BUCKET_RESOLUTION: f64 = 0.001;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Side {
    Bid,
    Ask,
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub struct Level {
    pub price: f64,
    pub volume: f64,
}

impl Level {
    pub fn new(price: f64, volume: f64) -> Self {
        Self { price, volume }
    }
}

/// One side of the book as observed at `time`. Levels are kept in arrival order, which the
/// price model assumes is best-first.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Snapshot {
    pub time: f64,
    pub levels: Vec<Level>,
}

impl Snapshot {
    pub fn depth(&self) -> f64 {
        self.levels.iter().map(|level| level.volume).sum()
    }
}

#[derive(Debug)]
pub struct DepthSeries {
    inner: Mutex<Vec<Snapshot>>,
    resolution: f64,
}

impl Default for DepthSeries {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKET_RESOLUTION)
    }
}

impl DepthSeries {
    pub fn new(resolution: f64) -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
            resolution,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Snapshot>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bucket(&self, time: f64) -> i64 {
        if self.resolution > 0.0 {
            (time / self.resolution).floor() as i64
        } else {
            time.to_bits() as i64
        }
    }

    /// Merges into an existing snapshot in the same bucket or inserts a new one at its sorted
    /// position.
    pub fn insert(&self, time: f64, levels: Vec<Level>) {
        let bucket = self.bucket(time);
        let mut points = self.lock();
        let idx = points.partition_point(|point| point.time < time);

        if let Some(point) = points.get_mut(idx) {
            if self.bucket(point.time) == bucket {
                point.levels.extend(levels);
                return;
            }
        }
        if idx > 0 {
            let point = &mut points[idx - 1];
            if self.bucket(point.time) == bucket {
                point.levels.extend(levels);
                return;
            }
        }
        points.insert(idx, Snapshot { time, levels });
    }

    pub fn snapshot_at_or_after(&self, time: f64) -> Result<Snapshot> {
        let points = self.lock();
        if points.is_empty() {
            return Err(Error::EmptyStore);
        }
        let idx = points
            .partition_point(|point| point.time < time)
            .min(points.len() - 1);
        Ok(points[idx].clone())
    }

    /// The snapshot that was visible at `time`. Saturates to the first point when `time` is
    /// before the series starts.
    pub fn snapshot_at_or_before(&self, time: f64) -> Result<Snapshot> {
        let points = self.lock();
        if points.is_empty() {
            return Err(Error::EmptyStore);
        }
        let idx = points
            .partition_point(|point| point.time <= time)
            .saturating_sub(1);
        Ok(points[idx].clone())
    }

    /// All points with `start <= time <= end`. When no point falls inside the window the nearest
    /// point at or after `start` is returned on its own, saturating to the last point, so a
    /// non-empty series never yields an empty range.
    pub fn range(&self, start: f64, end: f64) -> Result<Vec<Snapshot>> {
        let points = self.lock();
        if points.is_empty() {
            return Err(Error::EmptyStore);
        }
        let first = points
            .partition_point(|point| point.time < start)
            .min(points.len() - 1);
        let last = points.partition_point(|point| point.time <= end);
        if last <= first {
            return Ok(vec![points[first].clone()]);
        }
        Ok(points[first..last].to_vec())
    }

    /// Walks points with `time >= start` in order and returns the offset of the first one for
    /// which `check` yields a value. The offset is zero when the first scanned point matches.
    /// Runs under the store lock, so `check` must not block.
    pub fn scan_from<T, F>(&self, start: f64, mut check: F) -> Option<(usize, T)>
    where
        F: FnMut(&Snapshot) -> Option<T>,
    {
        let points = self.lock();
        let first = points.partition_point(|point| point.time < start);
        points[first..]
            .iter()
            .enumerate()
            .find_map(|(offset, point)| check(point).map(|found| (offset, found)))
    }

    /// Drops every point older than `now - max_age` and returns how many were removed.
    pub fn evict_older_than(&self, max_age: f64, now: f64) -> usize {
        let cutoff = now - max_age;
        let mut points = self.lock();
        let cut = points.partition_point(|point| point.time < cutoff);
        points.drain(..cut);
        cut
    }

    pub fn first_time(&self) -> Option<f64> {
        self.lock().first().map(|point| point.time)
    }

    pub fn last_time(&self) -> Option<f64> {
        self.lock().last().map(|point| point.time)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Both sides of the book. Asks price buys, bids price sells.
#[derive(Debug, Default)]
pub struct OrderBookStore {
    asks: DepthSeries,
    bids: DepthSeries,
}

impl OrderBookStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resolution(resolution: f64) -> Self {
        Self {
            asks: DepthSeries::new(resolution),
            bids: DepthSeries::new(resolution),
        }
    }

    pub fn side(&self, side: Side) -> &DepthSeries {
        match side {
            Side::Ask => &self.asks,
            Side::Bid => &self.bids,
        }
    }

    pub fn asks(&self) -> &DepthSeries {
        &self.asks
    }

    pub fn bids(&self) -> &DepthSeries {
        &self.bids
    }

    pub fn insert(&self, side: Side, time: f64, levels: Vec<Level>) {
        self.side(side).insert(time, levels);
    }

    pub fn evict_older_than(&self, max_age: f64, now: f64) -> usize {
        self.asks.evict_older_than(max_age, now) + self.bids.evict_older_than(max_age, now)
    }

    /// Earliest and latest time seen on either side.
    pub fn time_span(&self) -> Option<(f64, f64)> {
        let starts = [self.asks.first_time(), self.bids.first_time()];
        let ends = [self.asks.last_time(), self.bids.last_time()];
        let start = starts.into_iter().flatten().reduce(f64::min)?;
        let end = ends.into_iter().flatten().reduce(f64::max)?;
        Some((start, end))
    }
}

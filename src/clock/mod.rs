//! Time source shared by every component that waits or timestamps.
//!
//! Strategy code only ever sees the [Clock] trait so it runs unchanged against wall-clock time or
//! a replay. [RealClock] reads the system time and sleeps for real. [VirtualClock] holds its own
//! time which moves only when the timer calls [VirtualClock::advance]; suspended tasks are parked
//! on a watch channel and re-check their deadline each time the timer steps, so a backtest runs
//! at CPU speed without spinning.
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::watch;

#[async_trait]
pub trait Clock: Debug + Send + Sync {
    /// Current time in seconds.
    fn now(&self) -> f64;
    /// Blocks the calling task for `duration` seconds of this clock's time.
    async fn suspend(&self, duration: f64);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RealClock;

impl RealClock {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Clock for RealClock {
    fn now(&self) -> f64 {
        OffsetDateTime::now_utc().unix_timestamp_nanos() as f64 / 1e9
    }

    async fn suspend(&self, duration: f64) {
        if duration > 0.0 && duration.is_finite() {
            tokio::time::sleep(Duration::from_secs_f64(duration)).await;
        }
    }
}

#[derive(Debug)]
pub struct VirtualClock {
    time: watch::Sender<f64>,
}

impl VirtualClock {
    pub fn new(start: f64) -> Self {
        let (time, _) = watch::channel(start);
        Self { time }
    }

    /// Steps time forward and wakes every suspended task so it can re-check its deadline. Only
    /// the timer should call this.
    pub fn advance(&self, step: f64) {
        self.time.send_modify(|now| *now += step);
    }
}

#[async_trait]
impl Clock for VirtualClock {
    fn now(&self) -> f64 {
        *self.time.borrow()
    }

    async fn suspend(&self, duration: f64) {
        let mut receiver = self.time.subscribe();
        let start = *receiver.borrow_and_update();
        loop {
            if *receiver.borrow_and_update() - start >= duration {
                return;
            }
            //Sender lives as long as the clock, which outlives anything suspended on it
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

//! Drives a [Strategy] at a fixed frequency.
//!
//! In virtual mode the timer owns the passage of time: after each tick it steps the
//! [VirtualClock] by one interval and yields so every task suspended on the clock can re-check its
//! deadline, and it stops once the clock passes `stop_time`. In real mode it sleeps for whatever
//! is left of the interval and runs until [Timer::stop] is called.
//!
//! Either way, when the loop ends the strategy's `finish` runs as a background task. A virtual
//! timer keeps stepping the clock while it runs so that order waits inside `finish` still make
//! progress.
use std::sync::{Arc, Mutex, PoisonError};

use log::{error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clock::{Clock, VirtualClock};
use crate::strategy::Strategy;

#[derive(Clone, Debug)]
enum Mode {
    Virtual {
        clock: Arc<VirtualClock>,
        stop_time: f64,
    },
    Real {
        clock: Arc<dyn Clock>,
    },
}

impl Mode {
    fn now(&self) -> f64 {
        match self {
            Self::Virtual { clock, .. } => clock.now(),
            Self::Real { clock } => clock.now(),
        }
    }
}

struct TimerLoop {
    strategy: Arc<dyn Strategy>,
    mode: Mode,
    interval: f64,
    stop: watch::Receiver<bool>,
    log_target: String,
}

impl TimerLoop {
    async fn run(mut self) {
        let mut ticks: u64 = 0;
        loop {
            if *self.stop.borrow() {
                info!(target: self.log_target.as_str(), "TIMER: Stop requested");
                break;
            }
            let now = self.mode.now();
            if let Mode::Virtual { stop_time, .. } = self.mode {
                if now > stop_time {
                    info!(
                        target: self.log_target.as_str(),
                        "TIMER: Reached stop time {stop_time}"
                    );
                    break;
                }
            }

            if let Err(err) = self.strategy.tick(now).await {
                error!(
                    target: self.log_target.as_str(),
                    "TIMER: Tick at {now} failed, stopping: {err}"
                );
                break;
            }
            ticks += 1;

            match &self.mode {
                Mode::Virtual { clock, .. } => {
                    clock.advance(self.interval);
                    tokio::task::yield_now().await;
                }
                Mode::Real { clock } => {
                    let elapsed = clock.now() - now;
                    if elapsed > self.interval {
                        warn!(
                            target: self.log_target.as_str(),
                            "TIMER: Tick at {now} overran its interval by {}s",
                            elapsed - self.interval
                        );
                        continue;
                    }
                    tokio::select! {
                        _ = clock.suspend(self.interval - elapsed) => {}
                        changed = self.stop.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
        info!(
            target: self.log_target.as_str(),
            "TIMER: Ran {ticks} tick(s), finishing"
        );
        self.finish().await;
    }

    async fn finish(&self) {
        let strategy = Arc::clone(&self.strategy);
        let task = tokio::spawn(async move { strategy.finish().await });
        if let Mode::Virtual { clock, .. } = &self.mode {
            while !task.is_finished() {
                clock.advance(self.interval);
                tokio::task::yield_now().await;
            }
        }
        match task.await {
            Ok(()) => info!(target: self.log_target.as_str(), "TIMER: Finished"),
            Err(err) => error!(
                target: self.log_target.as_str(),
                "TIMER: Finishing task failed: {err}"
            ),
        }
    }
}

pub struct Timer {
    runner: Mutex<Option<TimerLoop>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    stop: watch::Sender<bool>,
    log_target: String,
}

impl Timer {
    /// Spawns the tick loop. Calling it again does nothing.
    pub fn start(&self) {
        let runner = self
            .runner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match runner {
            Some(runner) => {
                info!(
                    target: self.log_target.as_str(),
                    "TIMER: Starting at {} every {}s",
                    runner.mode.now(),
                    runner.interval
                );
                let handle = tokio::spawn(runner.run());
                *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
            }
            None => warn!(target: self.log_target.as_str(), "TIMER: Already started"),
        }
    }

    /// Signals the loop to stop and waits for it and the finishing phase to complete.
    pub async fn stop(&self) {
        self.stop.send_replace(true);
        self.join().await;
    }

    /// Waits for the loop and the finishing phase to complete without signaling it. A virtual
    /// timer ends on its own at `stop_time`; a real one only after [Timer::stop].
    pub async fn join(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(target: self.log_target.as_str(), "TIMER: Tick loop failed: {err}");
            }
        }
    }
}

pub struct TimerBuilder {
    strategy: Arc<dyn Strategy>,
    frequency: f64,
    mode: Option<Mode>,
    log_target: String,
}

impl TimerBuilder {
    pub fn new(strategy: Arc<dyn Strategy>) -> Self {
        Self {
            strategy,
            frequency: 1.0,
            mode: None,
            log_target: "bookrunner::timer".to_string(),
        }
    }

    /// Ticks per second.
    pub fn with_frequency(&mut self, frequency: f64) -> &mut Self {
        self.frequency = frequency;
        self
    }

    pub fn with_virtual_clock(&mut self, clock: Arc<VirtualClock>, stop_time: f64) -> &mut Self {
        self.mode = Some(Mode::Virtual { clock, stop_time });
        self
    }

    pub fn with_real_clock(&mut self, clock: Arc<dyn Clock>) -> &mut Self {
        self.mode = Some(Mode::Real { clock });
        self
    }

    pub fn with_log_target(&mut self, target: impl Into<String>) -> &mut Self {
        self.log_target = target.into();
        self
    }

    pub fn build(&self) -> anyhow::Result<Timer> {
        if !(self.frequency > 0.0 && self.frequency.is_finite()) {
            anyhow::bail!("timer frequency must be positive, got {}", self.frequency);
        }
        let Some(mode) = self.mode.clone() else {
            anyhow::bail!("timer needs a virtual or real clock");
        };

        let (stop, stop_rx) = watch::channel(false);
        let runner = TimerLoop {
            strategy: Arc::clone(&self.strategy),
            mode,
            interval: 1.0 / self.frequency,
            stop: stop_rx,
            log_target: self.log_target.clone(),
        };
        Ok(Timer {
            runner: Mutex::new(Some(runner)),
            handle: Mutex::new(None),
            stop,
            log_target: self.log_target.clone(),
        })
    }
}

//! Timers owned by the event loop. Dropping or cancelling one discards the
//! pending work, so nothing outlives the session that scheduled it.

use std::pin::Pin;
use std::time::Duration;
use tokio::time::{self, Instant, Interval, MissedTickBehavior, Sleep};

/// One-shot timer that can be re-armed or cancelled.
#[derive(Default)]
pub struct Deadline {
    sleep: Option<Pin<Box<Sleep>>>,
}

impl Deadline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, after: Duration) {
        let at = Instant::now() + after;
        match self.sleep.as_mut() {
            Some(sleep) => sleep.as_mut().reset(at),
            None => self.sleep = Some(Box::pin(time::sleep_until(at))),
        }
    }

    pub fn cancel(&mut self) {
        self.sleep = None;
    }

    pub fn is_armed(&self) -> bool {
        self.sleep.is_some()
    }

    /// Resolves once when the armed deadline passes; pends forever otherwise.
    /// Cancel safe: dropping the future keeps the deadline armed.
    pub async fn wait(&mut self) {
        match self.sleep.as_mut() {
            Some(sleep) => {
                sleep.as_mut().await;
                self.sleep = None;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

/// Periodic timer whose first tick lands one period after `start`.
#[derive(Default)]
pub struct Ticker {
    interval: Option<Interval>,
}

impl Ticker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, period: Duration) {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.interval = Some(interval);
    }

    pub fn stop(&mut self) {
        self.interval = None;
    }

    pub fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    pub async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

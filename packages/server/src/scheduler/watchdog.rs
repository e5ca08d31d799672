//! Watchdog: periodic sweep protecting against stuck clients.
//!
//! Runs independently of the scheduler loop. Jobs whose stop signal went
//! unacknowledged past the grace period are forcibly terminated, the
//! duration / stop-time limits get a backstop, and the recently-completed
//! ring is trimmed to its bound.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::core::Scheduler;

pub struct Watchdog {
    scheduler: Arc<Scheduler>,
    interval: Duration,
    shutdown: CancellationToken,
}

impl Watchdog {
    pub fn new(scheduler: Arc<Scheduler>, interval: Duration, shutdown: CancellationToken) -> Self {
        Self {
            scheduler,
            interval,
            shutdown,
        }
    }

    pub async fn run(self) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = self.interval.as_secs(), "watchdog starting");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tick.tick() => self.scheduler.sweep().await,
            }
        }
        info!("watchdog stopped");
    }
}

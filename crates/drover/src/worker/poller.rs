//! Polling drain loop with exponential backoff and an optional wakeup seam.
//!
//! The loop sleeps between drains, backing off while the claim pool is empty
//! and snapping back to the minimum interval when work appears. An external
//! event bus can hand the loop a `Notify` to cut the wait short; without one
//! the loop degrades to pure polling.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use super::Worker;
use crate::persistence::SchedulerStore;

/// Drain loop configuration.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Sleep after a drain that made progress.
    pub min_interval: Duration,
    /// Upper bound on the backoff sleep.
    pub max_interval: Duration,
    /// Growth factor applied while drains come back empty.
    pub backoff_multiplier: f64,
    /// Random fraction added to each sleep so idle workers desynchronize.
    pub jitter: f64,
    /// Claim budget per drain pass.
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            jitter: 0.1,
            batch_size: 10,
        }
    }
}

impl PollerConfig {
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

enum WaitOutcome {
    Slept,
    Woken,
    Shutdown,
}

/// Runs a [`Worker`] in a loop until shutdown is signalled.
pub struct DrainLoop<S: SchedulerStore> {
    worker: Worker<S>,
    config: PollerConfig,
    shutdown: watch::Receiver<bool>,
    wakeup: Option<Arc<Notify>>,
}

impl<S: SchedulerStore> DrainLoop<S> {
    pub fn new(worker: Worker<S>, config: PollerConfig, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            worker,
            config,
            shutdown,
            wakeup: None,
        }
    }

    /// Attach a wakeup handle. Notifying it cuts the current sleep short and
    /// resets the backoff.
    pub fn with_wakeup(mut self, wakeup: Arc<Notify>) -> Self {
        self.wakeup = Some(wakeup);
        self
    }

    /// Drain until shutdown. Store errors are logged and retried after the
    /// current backoff interval rather than crashing the loop.
    pub async fn run(mut self) {
        info!(worker_id = %self.worker.worker_id(), "drain loop started");

        let mut interval = self.config.min_interval;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match self.worker.try_drain(self.config.batch_size).await {
                Ok(report) if report.made_progress() => {
                    debug!(
                        recovered = report.recovered,
                        executed = report.executed,
                        "drain made progress"
                    );
                    interval = self.config.min_interval;
                }
                Ok(_) => {
                    interval = next_backoff(interval, &self.config);
                }
                Err(e) => {
                    warn!("drain failed: {}", e);
                    interval = next_backoff(interval, &self.config);
                }
            }

            match self.wait(with_jitter(interval, self.config.jitter)).await {
                WaitOutcome::Slept => {}
                WaitOutcome::Woken => {
                    debug!("woken early");
                    interval = self.config.min_interval;
                }
                WaitOutcome::Shutdown => break,
            }
        }

        info!(worker_id = %self.worker.worker_id(), "drain loop stopped");
    }

    async fn wait(&mut self, sleep_for: Duration) -> WaitOutcome {
        let wakeup = self.wakeup.clone();

        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => WaitOutcome::Slept,
            _ = async {
                match &wakeup {
                    Some(notify) => notify.notified().await,
                    None => std::future::pending().await,
                }
            } => WaitOutcome::Woken,
            _ = self.shutdown.changed() => WaitOutcome::Shutdown,
        }
    }
}

fn next_backoff(current: Duration, config: &PollerConfig) -> Duration {
    let scaled = current.mul_f64(config.backoff_multiplier);
    scaled.min(config.max_interval).max(config.min_interval)
}

fn with_jitter(interval: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return interval;
    }
    let factor = 1.0 + rand::thread_rng().gen_range(0.0..jitter);
    interval.mul_f64(factor)
}

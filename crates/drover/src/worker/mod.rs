//! Step execution: claiming, leasing, running handlers, and recording
//! outcomes.
//!
//! A [`Worker`] drains runnable steps from the store one claim at a time.
//! While a handler runs, a background task extends the lease so slow steps
//! are not reaped; if the process dies instead, the lease expires and
//! recovery hands the step's fate to the next drain.

pub mod poller;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::model::{Direction, RunState, StepClaim};
use crate::persistence::{SchedulerStore, StoreError};
use crate::registry::StepRegistry;
use crate::step::StepContext;

pub use poller::{DrainLoop, PollerConfig};

/// Worker-level failures.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity recorded on claimed steps. Unique per process by default.
    pub worker_id: String,
    /// How long a claim is valid before recovery may reap it.
    pub lease_duration: Duration,
    /// How often the lease is extended while a handler runs. Should be well
    /// under `lease_duration`.
    pub heartbeat_interval: Duration,
    /// Maximum expired leases reaped per drain.
    pub recover_batch_limit: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            lease_duration: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            recover_batch_limit: 100,
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn with_heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    pub fn with_recover_batch_limit(mut self, limit: i64) -> Self {
        self.recover_batch_limit = limit;
        self
    }
}

/// Outcome of one [`Worker::try_drain`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Expired leases reaped before claiming.
    pub recovered: u64,
    /// Steps claimed and executed in this pass.
    pub executed: usize,
}

impl DrainReport {
    /// Whether the pass did anything at all.
    pub fn made_progress(&self) -> bool {
        self.recovered > 0 || self.executed > 0
    }
}

/// Claims and executes steps against a [`SchedulerStore`].
pub struct Worker<S: SchedulerStore> {
    store: Arc<S>,
    registry: Arc<StepRegistry>,
    context: Arc<StepContext>,
    config: WorkerConfig,
}

impl<S: SchedulerStore> Clone for Worker<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            context: Arc::clone(&self.context),
            config: self.config.clone(),
        }
    }
}

impl<S: SchedulerStore> Worker<S> {
    pub fn new(
        store: Arc<S>,
        registry: Arc<StepRegistry>,
        context: Arc<StepContext>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            context,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Reap expired leases, then claim and execute up to `max_claims` steps.
    /// Returns once the claim pool is empty or the budget is spent.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn try_drain(&self, max_claims: usize) -> Result<DrainReport, WorkerError> {
        let recovered = self
            .store
            .recover_expired_running_steps(self.config.recover_batch_limit)
            .await?;
        if recovered > 0 {
            warn!(recovered, "reaped expired step leases");
        }

        let mut executed = 0;
        while executed < max_claims {
            let claim = self
                .store
                .claim_one_step(&self.config.worker_id, self.config.lease_duration)
                .await?;
            let Some(claim) = claim else {
                break;
            };
            self.execute_claim(claim).await?;
            executed += 1;
        }

        Ok(DrainReport {
            recovered,
            executed,
        })
    }

    /// Execute one claimed step to a recorded outcome.
    #[instrument(
        skip(self, claim),
        fields(run_id = %claim.run_id, step_id = %claim.step_id, direction = %claim.direction)
    )]
    async fn execute_claim(&self, claim: StepClaim) -> Result<(), WorkerError> {
        // Cooperative cancellation: forward work already claimed is dropped
        // without invoking the handler. Compensating work always proceeds.
        if claim.direction == Direction::Do {
            let cancelled = self
                .store
                .get_run(claim.run_id)
                .await?
                .map(|run| run.state == RunState::CancelRequested)
                .unwrap_or(false);
            if cancelled {
                debug!("run cancelled; dropping step without executing");
                self.store.mark_step_cancelled(&claim).await?;
                return Ok(());
            }
        }

        let handler = match self.registry.get_step(&claim.step_id) {
            Ok(handler) => handler,
            Err(e) => {
                error!("cannot execute step: {}", e);
                self.fail_claim(&claim, &e.to_string()).await?;
                return Ok(());
            }
        };

        let heartbeat = self.spawn_heartbeat(claim.clone());

        let outcome = {
            let ctx = Arc::clone(&self.context);
            let fut = async {
                match claim.direction {
                    Direction::Do => handler.run(&ctx, &claim).await,
                    Direction::Undo => handler.undo(&ctx, &claim).await,
                }
            };
            AssertUnwindSafe(fut).catch_unwind().await
        };

        heartbeat.abort();
        let _ = heartbeat.await;

        match outcome {
            Ok(Ok(())) => {
                debug!(attempt = claim.attempt, "step succeeded");
                self.store.mark_step_succeeded(&claim).await?;
                self.store.try_finalize_run(claim.run_id).await?;
            }
            Ok(Err(step_error)) => {
                warn!(attempt = claim.attempt, "step failed: {}", step_error);
                self.fail_claim(&claim, &step_error.to_string()).await?;
            }
            Err(panic) => {
                let message = panic_message(panic);
                error!(attempt = claim.attempt, "step panicked: {}", message);
                self.fail_claim(&claim, &format!("step panicked: {message}"))
                    .await?;
            }
        }

        Ok(())
    }

    /// Failure policy by direction: a failed DO step is abandoned (and the
    /// run cancelled by the store), a failed UNDO step waits for an operator.
    async fn fail_claim(&self, claim: &StepClaim, error: &str) -> Result<(), WorkerError> {
        match claim.direction {
            Direction::Do => self.store.mark_step_abandoned(claim, error).await?,
            Direction::Undo => self.store.mark_step_waiting_manual(claim, error).await?,
        }
        Ok(())
    }

    fn spawn_heartbeat(&self, claim: StepClaim) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let interval = self.config.heartbeat_interval;
        let extend_by = self.config.lease_duration;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; the claim already carries a
            // fresh lease.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = store.heartbeat_step(&claim, extend_by).await {
                    warn!(
                        run_id = %claim.run_id,
                        step_id = %claim.step_id,
                        "heartbeat failed: {}",
                        e
                    );
                }
            }
        })
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

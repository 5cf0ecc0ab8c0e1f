//! [`SchedulerStore`] trait definition.

use std::time::Duration;

use async_trait::async_trait;

use crate::model::{
    DagTemplate, DesiredState, ManualAction, NodeRecord, RunId, RunKind, RunRecord, StepClaim,
    StepRecord,
};

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error.
    #[error("database error: {0}")]
    Database(String),

    /// A persisted value could not be decoded (unknown state string, ...).
    #[error("decode error: {0}")]
    Decode(String),
}

/// Everything needed to open a new run against a node in one atomic step:
/// desired-state bump, run creation, active-run pointer, and DAG
/// materialization.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub node_id: String,
    pub desired_state: DesiredState,
    /// New desired spec, or `None` to keep the node's current spec
    /// (teardowns do not rewrite the spec they are dismantling).
    pub desired_spec: Option<serde_json::Value>,
    pub kind: RunKind,
    /// Operator-supplied reason, recorded on the run row (teardowns).
    pub reason: Option<String>,
    /// Template to materialize in the run's relevant direction.
    pub template: DagTemplate,
}

/// Persistence contract for the scheduler.
///
/// The relational store is the only shared state between workers; every
/// cross-worker invariant is expressed through these operations. Each
/// operation is atomic on its own. Implementations must be thread-safe.
///
/// Failure policy baked into the store, not left to callers:
/// a DO step moving to `Abandoned` also flips its run to `CancelRequested`
/// in the same atomic operation, since a forward failure halts the whole run. An
/// UNDO failure never cancels anything; it parks as `WaitingManual` because
/// guessing whether a rollback is safe to retry could orphan resources.
#[async_trait]
pub trait SchedulerStore: Send + Sync + 'static {
    // =========================================================================
    // Node / run lifecycle
    // =========================================================================

    /// Atomically: lock the node (creating it if absent), bump its desired
    /// state/spec/generation, create a run of `request.kind`, point
    /// `active_run_id` at it, and materialize the template's steps and
    /// dependency edges in the run's relevant direction.
    ///
    /// Returns the new run's id. Materialization is idempotent, so a retried
    /// call after a partial failure cannot duplicate step rows.
    async fn begin_run(&self, request: RunRequest) -> Result<RunId, StoreError>;

    /// Read a node row.
    async fn get_node(&self, node_id: &str) -> Result<Option<NodeRecord>, StoreError>;

    /// Read a run row.
    async fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>, StoreError>;

    /// All step executions of a run, both directions.
    async fn list_steps(&self, run_id: RunId) -> Result<Vec<StepRecord>, StoreError>;

    /// Cooperatively request cancellation of a run. Workers observe this
    /// before starting new DO work; in-flight steps are not interrupted.
    async fn mark_run_cancel_requested(&self, run_id: RunId) -> Result<(), StoreError>;

    /// If every step in the run's relevant direction (DO for APPLY, UNDO for
    /// TEARDOWN) is `Succeeded` or `Skipped`, mark the run `Succeeded` and
    /// clear the node's `active_run_id`, but only when that pointer still
    /// equals this run, so an older run can never clear a newer run's
    /// pointer. Idempotent; safe to call after every step completion.
    ///
    /// Returns whether the run is (now) finalized.
    async fn try_finalize_run(&self, run_id: RunId) -> Result<bool, StoreError>;

    /// Whether any step of the run is `WaitingManual` or `Abandoned`.
    async fn run_has_problems(&self, run_id: RunId) -> Result<bool, StoreError>;

    // =========================================================================
    // Step claiming / leasing
    // =========================================================================

    /// Claim one runnable step, or `None` when nothing is claimable.
    ///
    /// A step is a candidate iff it is `Pending`, unleased or lease-expired,
    /// and every dependency in its direction is `Succeeded` or `Skipped`.
    /// The least-recently-modified candidate is locked with skip-locked
    /// semantics and atomically moved to `Running` with `attempt + 1`, the
    /// claiming `worker_id`, and `lease_until = now + lease_duration`.
    /// Callers should back off when this returns `None`.
    async fn claim_one_step(
        &self,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<StepClaim>, StoreError>;

    /// Extend a claimed step's lease: `max(lease_until, now) + extend_by`,
    /// so leases never shrink. A no-op if the claim is no longer owned.
    async fn heartbeat_step(&self, claim: &StepClaim, extend_by: Duration)
        -> Result<(), StoreError>;

    /// Mark a claimed step `Succeeded` and release its lease. Scoped to the
    /// claim's worker so a reaped claim cannot be finalized late.
    async fn mark_step_succeeded(&self, claim: &StepClaim) -> Result<(), StoreError>;

    /// Release a claimed step as `Cancelled`: the run's cancellation was
    /// observed before the handler started, so the step was dropped without
    /// executing. Not an error state; `run_has_problems` ignores it.
    async fn mark_step_cancelled(&self, claim: &StepClaim) -> Result<(), StoreError>;

    /// Record a failure that stops the run: step → `Abandoned`, lease
    /// released, error persisted; a DO-direction claim also flips the run to
    /// `CancelRequested`.
    async fn mark_step_abandoned(&self, claim: &StepClaim, error: &str)
        -> Result<(), StoreError>;

    /// Park a failed step for an operator decision: step → `WaitingManual`,
    /// lease released, error persisted.
    async fn mark_step_waiting_manual(
        &self,
        claim: &StepClaim,
        error: &str,
    ) -> Result<(), StoreError>;

    /// Reap `Running` steps whose lease expired (crashed or hung workers),
    /// up to `limit`, applying the same DO → abandon-and-cancel /
    /// UNDO → waiting-manual policy as live failures. Returns the number of
    /// steps reaped. Must be invoked periodically and before drain cycles.
    async fn recover_expired_running_steps(&self, limit: i64) -> Result<u64, StoreError>;

    // =========================================================================
    // Manual recovery
    // =========================================================================

    /// Apply an operator decision to a `WaitingManual` step: RETRY resets it
    /// to `Pending` (clearing `last_error`), SKIP marks it `Skipped`. The
    /// audit fields of `action` are persisted either way.
    ///
    /// Returns `false` when the step was not `WaitingManual` (nothing
    /// changed).
    async fn apply_manual_action(
        &self,
        run_id: RunId,
        step_id: &str,
        action: &ManualAction,
    ) -> Result<bool, StoreError>;
}

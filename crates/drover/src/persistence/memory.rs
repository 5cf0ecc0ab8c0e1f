//! In-memory implementation of [`SchedulerStore`] for tests and local
//! development.
//!
//! Mirrors the PostgreSQL store's semantics, with one `parking_lot` mutex
//! standing in for the database's transactional guarantees. Claim ordering,
//! lease arithmetic, and the finalization guard all behave the same way so
//! scenario tests exercise the real state machine.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::store::{RunRequest, SchedulerStore, StoreError};
use crate::model::{
    Direction, ManualAction, ManualActionKind, NodeRecord, RunId, RunRecord, RunState, StepClaim,
    StepRecord, StepState,
};

const LEASE_EXPIRED_ERROR: &str = "lease expired while running; previous worker likely died";

#[derive(Debug, Clone)]
struct StepCell {
    record: StepRecord,
    modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    nodes: HashMap<String, NodeRecord>,
    runs: HashMap<RunId, RunRecord>,
    steps: HashMap<(RunId, String, Direction), StepCell>,
    // (run_id, direction, step_id, depends_on_step_id)
    deps: HashSet<(RunId, Direction, String, String)>,
}

impl Inner {
    fn deps_satisfied(&self, run_id: RunId, direction: Direction, step_id: &str) -> bool {
        self.deps
            .iter()
            .filter(|(r, d, s, _)| *r == run_id && *d == direction && s == step_id)
            .all(|(r, d, _, dep)| {
                self.steps
                    .get(&(*r, dep.clone(), *d))
                    .map(|cell| cell.record.state.is_satisfied())
                    .unwrap_or(false)
            })
    }

    fn cancel_run(&mut self, run_id: RunId) {
        if let Some(run) = self.runs.get_mut(&run_id) {
            run.state = RunState::CancelRequested;
            run.cancel_requested_at = Some(Utc::now());
        }
    }
}

/// In-memory scheduler store.
#[derive(Debug, Default, Clone)]
pub struct InMemorySchedulerStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemorySchedulerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of step rows across all runs. Test helper.
    pub fn step_count(&self) -> usize {
        self.inner.lock().steps.len()
    }

    /// Snapshot of one step's state, if it exists. Test helper.
    pub fn step_state(
        &self,
        run_id: RunId,
        step_id: &str,
        direction: Direction,
    ) -> Option<StepState> {
        self.inner
            .lock()
            .steps
            .get(&(run_id, step_id.to_string(), direction))
            .map(|cell| cell.record.state)
    }
}

#[async_trait]
impl SchedulerStore for InMemorySchedulerStore {
    async fn begin_run(&self, request: RunRequest) -> Result<RunId, StoreError> {
        let direction = request.kind.relevant_direction();
        let run_id = Uuid::now_v7();
        let now = Utc::now();

        let mut inner = self.inner.lock();

        let node = inner
            .nodes
            .entry(request.node_id.clone())
            .or_insert_with(|| NodeRecord {
                node_id: request.node_id.clone(),
                desired_state: request.desired_state,
                desired_spec: serde_json::Value::Object(Default::default()),
                desired_generation: 0,
                active_run_id: None,
            });

        node.desired_state = request.desired_state;
        if let Some(spec) = request.desired_spec {
            node.desired_spec = spec;
        }
        node.desired_generation += 1;
        node.active_run_id = Some(run_id);
        let generation = node.desired_generation;

        inner.runs.insert(
            run_id,
            RunRecord {
                run_id,
                node_id: request.node_id.clone(),
                generation,
                kind: request.kind,
                state: request.kind.initial_state(),
                reason: request.reason,
                cancel_requested_at: None,
            },
        );

        for step_id in &request.template.nodes {
            inner
                .steps
                .entry((run_id, step_id.clone(), direction))
                .or_insert_with(|| StepCell {
                    record: StepRecord {
                        run_id,
                        step_id: step_id.clone(),
                        direction,
                        state: StepState::Pending,
                        attempt: 0,
                        worker_id: None,
                        lease_until: None,
                        last_error: None,
                        manual_required_at: None,
                        manual_action: None,
                        manual_action_by: None,
                        manual_action_at: None,
                        manual_action_reason: None,
                    },
                    modified: now,
                });
        }

        for (depends_on, step_id) in &request.template.edges {
            inner
                .deps
                .insert((run_id, direction, step_id.clone(), depends_on.clone()));
        }

        Ok(run_id)
    }

    async fn get_node(&self, node_id: &str) -> Result<Option<NodeRecord>, StoreError> {
        Ok(self.inner.lock().nodes.get(node_id).cloned())
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>, StoreError> {
        Ok(self.inner.lock().runs.get(&run_id).cloned())
    }

    async fn list_steps(&self, run_id: RunId) -> Result<Vec<StepRecord>, StoreError> {
        let inner = self.inner.lock();
        let mut steps: Vec<StepRecord> = inner
            .steps
            .values()
            .filter(|cell| cell.record.run_id == run_id)
            .map(|cell| cell.record.clone())
            .collect();
        steps.sort_by(|a, b| (a.direction, &a.step_id).cmp(&(b.direction, &b.step_id)));
        Ok(steps)
    }

    async fn mark_run_cancel_requested(&self, run_id: RunId) -> Result<(), StoreError> {
        self.inner.lock().cancel_run(run_id);
        Ok(())
    }

    async fn try_finalize_run(&self, run_id: RunId) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();

        let Some(run) = inner.runs.get(&run_id).cloned() else {
            return Ok(false);
        };

        let direction = run.kind.relevant_direction();
        let remaining = inner.steps.values().any(|cell| {
            cell.record.run_id == run_id
                && cell.record.direction == direction
                && !cell.record.state.is_satisfied()
        });
        if remaining {
            return Ok(false);
        }

        if let Some(run) = inner.runs.get_mut(&run_id) {
            run.state = RunState::Succeeded;
        }

        // Only clear the pointer if a newer run has not taken over.
        if let Some(node) = inner.nodes.get_mut(&run.node_id) {
            if node.active_run_id == Some(run_id) {
                node.active_run_id = None;
            }
        }

        Ok(true)
    }

    async fn run_has_problems(&self, run_id: RunId) -> Result<bool, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .steps
            .values()
            .any(|cell| cell.record.run_id == run_id && cell.record.state.is_problem()))
    }

    async fn claim_one_step(
        &self,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<StepClaim>, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock();

        let mut candidates: Vec<(DateTime<Utc>, RunId, String, Direction)> = inner
            .steps
            .values()
            .filter(|cell| {
                cell.record.state == StepState::Pending
                    && cell
                        .record
                        .lease_until
                        .map(|lease| lease < now)
                        .unwrap_or(true)
            })
            .filter(|cell| {
                inner.deps_satisfied(
                    cell.record.run_id,
                    cell.record.direction,
                    &cell.record.step_id,
                )
            })
            .map(|cell| {
                (
                    cell.modified,
                    cell.record.run_id,
                    cell.record.step_id.clone(),
                    cell.record.direction,
                )
            })
            .collect();
        candidates.sort();

        let Some((_, run_id, step_id, direction)) = candidates.into_iter().next() else {
            return Ok(None);
        };

        let lease_until = now
            + chrono::Duration::from_std(lease_duration)
                .map_err(|e| StoreError::Database(e.to_string()))?;

        let cell = inner
            .steps
            .get_mut(&(run_id, step_id.clone(), direction))
            .ok_or_else(|| StoreError::Database("claimed step vanished".to_string()))?;

        cell.record.state = StepState::Running;
        cell.record.attempt += 1;
        cell.record.worker_id = Some(worker_id.to_string());
        cell.record.lease_until = Some(lease_until);
        cell.modified = now;

        Ok(Some(StepClaim {
            run_id,
            step_id,
            direction,
            attempt: cell.record.attempt,
            worker_id: worker_id.to_string(),
            lease_until,
        }))
    }

    async fn heartbeat_step(
        &self,
        claim: &StepClaim,
        extend_by: Duration,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let extend = chrono::Duration::from_std(extend_by)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let mut inner = self.inner.lock();
        if let Some(cell) = inner
            .steps
            .get_mut(&(claim.run_id, claim.step_id.clone(), claim.direction))
        {
            if cell.record.state == StepState::Running
                && cell.record.worker_id.as_deref() == Some(claim.worker_id.as_str())
            {
                let base = cell.record.lease_until.map_or(now, |lease| lease.max(now));
                cell.record.lease_until = Some(base + extend);
            }
        }
        Ok(())
    }

    async fn mark_step_succeeded(&self, claim: &StepClaim) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(cell) = inner
            .steps
            .get_mut(&(claim.run_id, claim.step_id.clone(), claim.direction))
        {
            if cell.record.worker_id.as_deref() == Some(claim.worker_id.as_str()) {
                cell.record.state = StepState::Succeeded;
                cell.record.lease_until = None;
                cell.modified = Utc::now();
            }
        }
        Ok(())
    }

    async fn mark_step_cancelled(&self, claim: &StepClaim) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(cell) = inner
            .steps
            .get_mut(&(claim.run_id, claim.step_id.clone(), claim.direction))
        {
            if cell.record.worker_id.as_deref() == Some(claim.worker_id.as_str()) {
                cell.record.state = StepState::Cancelled;
                cell.record.lease_until = None;
                cell.record.worker_id = None;
                cell.modified = Utc::now();
            }
        }
        Ok(())
    }

    async fn mark_step_abandoned(&self, claim: &StepClaim, error: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let mut owned = false;
        if let Some(cell) = inner
            .steps
            .get_mut(&(claim.run_id, claim.step_id.clone(), claim.direction))
        {
            if cell.record.worker_id.as_deref() == Some(claim.worker_id.as_str()) {
                cell.record.state = StepState::Abandoned;
                cell.record.last_error = Some(error.to_string());
                cell.record.manual_required_at = None;
                cell.record.lease_until = None;
                cell.record.worker_id = None;
                cell.modified = Utc::now();
                owned = true;
            }
        }
        if owned && claim.direction == Direction::Do {
            inner.cancel_run(claim.run_id);
        }
        Ok(())
    }

    async fn mark_step_waiting_manual(
        &self,
        claim: &StepClaim,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(cell) = inner
            .steps
            .get_mut(&(claim.run_id, claim.step_id.clone(), claim.direction))
        {
            if cell.record.worker_id.as_deref() == Some(claim.worker_id.as_str()) {
                cell.record.state = StepState::WaitingManual;
                cell.record.last_error = Some(error.to_string());
                cell.record.manual_required_at = Some(Utc::now());
                cell.record.lease_until = None;
                cell.record.worker_id = None;
                cell.modified = Utc::now();
            }
        }
        Ok(())
    }

    async fn recover_expired_running_steps(&self, limit: i64) -> Result<u64, StoreError> {
        if limit <= 0 {
            return Ok(0);
        }

        let now = Utc::now();
        let mut inner = self.inner.lock();

        let mut expired: Vec<(DateTime<Utc>, RunId, String, Direction)> = inner
            .steps
            .values()
            .filter(|cell| {
                cell.record.state == StepState::Running
                    && cell
                        .record
                        .lease_until
                        .map(|lease| lease < now)
                        .unwrap_or(false)
            })
            .map(|cell| {
                (
                    cell.record.lease_until.unwrap_or(now),
                    cell.record.run_id,
                    cell.record.step_id.clone(),
                    cell.record.direction,
                )
            })
            .collect();
        expired.sort();
        expired.truncate(limit as usize);

        let mut reaped = 0u64;
        for (_, run_id, step_id, direction) in expired {
            if let Some(cell) = inner.steps.get_mut(&(run_id, step_id.clone(), direction)) {
                match direction {
                    Direction::Do => {
                        cell.record.state = StepState::Abandoned;
                        cell.record.manual_required_at = None;
                    }
                    Direction::Undo => {
                        cell.record.state = StepState::WaitingManual;
                        cell.record.manual_required_at = Some(now);
                    }
                }
                cell.record.last_error = Some(LEASE_EXPIRED_ERROR.to_string());
                cell.record.lease_until = None;
                cell.record.worker_id = None;
                cell.modified = now;
            }
            if direction == Direction::Do {
                inner.cancel_run(run_id);
            }
            reaped += 1;
        }

        Ok(reaped)
    }

    async fn apply_manual_action(
        &self,
        run_id: RunId,
        step_id: &str,
        action: &ManualAction,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();

        // Manual actions only apply to steps parked for an operator.
        let found = inner
            .steps
            .iter_mut()
            .find(|((r, s, _), cell)| {
                *r == run_id && s == step_id && cell.record.state == StepState::WaitingManual
            })
            .map(|(_, cell)| cell);

        let Some(cell) = found else {
            return Ok(false);
        };

        match action.kind {
            ManualActionKind::Retry => {
                cell.record.state = StepState::Pending;
                cell.record.last_error = None;
            }
            ManualActionKind::Skip => {
                cell.record.state = StepState::Skipped;
            }
        }
        cell.record.manual_action = Some(action.kind);
        cell.record.manual_action_by = Some(action.performed_by.clone());
        cell.record.manual_action_at = Some(Utc::now());
        cell.record.manual_action_reason = action.reason.clone();
        cell.record.lease_until = None;
        cell.record.worker_id = None;
        cell.modified = Utc::now();

        Ok(true)
    }
}

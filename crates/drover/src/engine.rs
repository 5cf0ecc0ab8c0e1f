//! Control-plane façade: opening runs, requesting cancellation, applying
//! operator decisions, and reading run status.
//!
//! Generic over [`SchedulerStore`] so the same engine drives PostgreSQL in
//! production and the in-memory store in tests.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{info, instrument};

use crate::dag;
use crate::model::{
    DagTemplate, DesiredState, ManualAction, RunId, RunKind, RunRecord, StepRecord,
};
use crate::persistence::{RunRequest, SchedulerStore, StoreError};
use crate::registry::{RegistryError, StepRegistry};

/// Engine-level failures.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("run not found: {0}")]
    RunNotFound(RunId),

    /// Compensating work must run to completion or stop at an operator
    /// decision; it cannot be cancelled mid-flight.
    #[error("teardown run {0} cannot be cancelled")]
    TeardownNotCancellable(RunId),

    #[error("step {step_id} of run {run_id} is not waiting for a manual action")]
    StepNotWaitingManual { run_id: RunId, step_id: String },
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Registry id of the forward (apply) workflow template.
    pub apply_workflow: String,
    /// Registry id of the teardown template. When no template is registered
    /// under this id, teardown falls back to the full reverse of the apply
    /// template.
    pub teardown_workflow: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            apply_workflow: "apply".to_string(),
            teardown_workflow: "teardown".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn with_apply_workflow(mut self, id: impl Into<String>) -> Self {
        self.apply_workflow = id.into();
        self
    }

    pub fn with_teardown_workflow(mut self, id: impl Into<String>) -> Self {
        self.teardown_workflow = id.into();
        self
    }
}

/// Combined view of a run and its steps.
#[derive(Debug, Clone)]
pub struct RunStatus {
    pub run: RunRecord,
    pub steps: Vec<StepRecord>,
    /// True when any step is abandoned or waiting for a manual action.
    pub has_problems: bool,
}

/// The scheduler engine. Cheap to clone; shares the store and registry.
pub struct Engine<S: SchedulerStore> {
    store: Arc<S>,
    registry: Arc<StepRegistry>,
    config: EngineConfig,
}

impl<S: SchedulerStore> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            config: self.config.clone(),
        }
    }
}

impl<S: SchedulerStore> Engine<S> {
    pub fn new(store: Arc<S>, registry: Arc<StepRegistry>, config: EngineConfig) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<StepRegistry> {
        &self.registry
    }

    /// Record that the node should be PRESENT with the given spec and open
    /// an APPLY run for it. A previously active run loses the node's
    /// `active_run_id` pointer, which prevents it from finalizing the node.
    #[instrument(skip(self, desired_spec))]
    pub async fn request_apply(
        &self,
        node_id: &str,
        desired_spec: serde_json::Value,
    ) -> Result<RunId, EngineError> {
        let template = self.registry.get_workflow(&self.config.apply_workflow)?;

        let run_id = self
            .store
            .begin_run(RunRequest {
                node_id: node_id.to_string(),
                desired_state: DesiredState::Present,
                desired_spec: Some(desired_spec),
                kind: RunKind::Apply,
                reason: None,
                template: template.clone(),
            })
            .await?;

        info!(%node_id, %run_id, "apply run opened");
        Ok(run_id)
    }

    /// Record that the node should be ABSENT and open a TEARDOWN run of
    /// compensating steps.
    #[instrument(skip(self))]
    pub async fn request_teardown(
        &self,
        node_id: &str,
        reason: Option<&str>,
    ) -> Result<RunId, EngineError> {
        let template = self.teardown_template()?;

        let run_id = self
            .store
            .begin_run(RunRequest {
                node_id: node_id.to_string(),
                desired_state: DesiredState::Absent,
                // The node's spec is left untouched; the store keeps the
                // current value inside the begin_run transaction.
                desired_spec: None,
                kind: RunKind::Teardown,
                reason: reason.map(String::from),
                template,
            })
            .await?;

        info!(%node_id, %run_id, reason, "teardown run opened");
        Ok(run_id)
    }

    /// Request cooperative cancellation of an APPLY run. Running steps finish
    /// their current attempt; pending steps are abandoned when claimed.
    ///
    /// Teardown runs are refused: compensating work must reach a terminal
    /// state.
    #[instrument(skip(self))]
    pub async fn request_cancel(&self, run_id: RunId) -> Result<(), EngineError> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;

        if run.kind == RunKind::Teardown {
            return Err(EngineError::TeardownNotCancellable(run_id));
        }

        self.store.mark_run_cancel_requested(run_id).await?;
        info!(%run_id, "cancellation requested");
        Ok(())
    }

    /// Apply an operator decision (retry or skip) to a step stuck in
    /// `WaitingManual`, then attempt finalization in case it was the last
    /// unsatisfied step.
    #[instrument(skip(self, action), fields(action = %action.kind))]
    pub async fn apply_manual_action(
        &self,
        run_id: RunId,
        step_id: &str,
        action: ManualAction,
    ) -> Result<(), EngineError> {
        let applied = self.store.apply_manual_action(run_id, step_id, &action).await?;
        if !applied {
            return Err(EngineError::StepNotWaitingManual {
                run_id,
                step_id: step_id.to_string(),
            });
        }

        info!(%run_id, %step_id, action = %action.kind, by = %action.performed_by, "manual action applied");
        self.store.try_finalize_run(run_id).await?;
        Ok(())
    }

    /// Read the run together with its steps and a problem summary.
    #[instrument(skip(self))]
    pub async fn run_status(&self, run_id: RunId) -> Result<RunStatus, EngineError> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        let steps = self.store.list_steps(run_id).await?;
        let has_problems = steps.iter().any(|s| s.state.is_problem());

        Ok(RunStatus {
            run,
            steps,
            has_problems,
        })
    }

    /// Build the compensating template for a subset of the apply template's
    /// steps: the subgraph induced by `steps_to_undo` with every edge
    /// reversed.
    pub fn build_undo_subdag(
        &self,
        steps_to_undo: &BTreeSet<String>,
    ) -> Result<DagTemplate, EngineError> {
        let apply = self.registry.get_workflow(&self.config.apply_workflow)?;
        let workflow_id = format!("{}.undo", apply.workflow_id);
        Ok(dag::reverse_subdag(apply, steps_to_undo, workflow_id))
    }

    fn teardown_template(&self) -> Result<DagTemplate, EngineError> {
        match self.registry.get_workflow(&self.config.teardown_workflow) {
            Ok(template) => Ok(template.clone()),
            Err(RegistryError::UnknownWorkflow(_)) => {
                let apply = self.registry.get_workflow(&self.config.apply_workflow)?;
                let all: BTreeSet<String> = apply.nodes.iter().cloned().collect();
                let workflow_id = format!("{}.undo", apply.workflow_id);
                Ok(dag::reverse_subdag(apply, &all, workflow_id))
            }
            Err(e) => Err(e.into()),
        }
    }
}

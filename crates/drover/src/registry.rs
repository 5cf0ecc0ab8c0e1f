//! Process-local registry of step handlers and workflow templates.
//!
//! Populated once at start-up by the workflow authors, shared read-only via
//! `Arc` afterwards. A lookup miss is a configuration error (a step id
//! referenced by a template but never registered) and must stop the run
//! rather than retry silently.

use std::collections::HashMap;
use std::sync::Arc;

use crate::model::DagTemplate;
use crate::step::StepHandler;

/// Errors from registry lookups. These are configuration errors, not
/// runtime/business errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No handler registered for the step id.
    #[error("no handler registered for step: {0}")]
    UnknownStep(String),

    /// No template registered for the workflow id.
    #[error("no template registered for workflow: {0}")]
    UnknownWorkflow(String),
}

/// Step-id → handler pair and workflow-id → template maps.
#[derive(Default)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn StepHandler>>,
    workflows: HashMap<String, DagTemplate>,
}

impl StepRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler pair for a step id. Re-registering replaces.
    pub fn register_step(&mut self, step_id: impl Into<String>, handler: Arc<dyn StepHandler>) {
        self.steps.insert(step_id.into(), handler);
    }

    /// Register a workflow template under its own `workflow_id`.
    pub fn register_workflow(&mut self, template: DagTemplate) {
        self.workflows.insert(template.workflow_id.clone(), template);
    }

    /// Resolve a step handler.
    pub fn get_step(&self, step_id: &str) -> Result<Arc<dyn StepHandler>, RegistryError> {
        self.steps
            .get(step_id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownStep(step_id.to_string()))
    }

    /// Resolve a workflow template.
    pub fn get_workflow(&self, workflow_id: &str) -> Result<&DagTemplate, RegistryError> {
        self.workflows
            .get(workflow_id)
            .ok_or_else(|| RegistryError::UnknownWorkflow(workflow_id.to_string()))
    }

    /// Registered step ids.
    pub fn step_ids(&self) -> impl Iterator<Item = &str> {
        self.steps.keys().map(|s| s.as_str())
    }

    /// Registered workflow ids.
    pub fn workflow_ids(&self) -> impl Iterator<Item = &str> {
        self.workflows.keys().map(|s| s.as_str())
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .field("workflows", &self.workflows.keys().collect::<Vec<_>>())
            .finish()
    }
}

//! Shared vocabulary: identifiers, enumerated states, and value objects.
//!
//! Everything the store persists and the engine/worker exchange lives here.
//! State enums round-trip through their snake_case string form, which is
//! also what the database columns hold.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of one run (one attempt to converge a node).
pub type RunId = Uuid;

/// Desired lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    /// The service should exist and be running.
    Present,
    /// The service should be fully torn down.
    Absent,
}

/// Whether a run converges toward PRESENT or ABSENT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Apply,
    Teardown,
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// APPLY run making forward progress.
    Applying,
    /// TEARDOWN run making compensating progress.
    TearingDown,
    /// Cooperative cancellation requested; no new DO work is started.
    CancelRequested,
    /// Every relevant-direction step reached a satisfied state.
    Succeeded,
}

/// State of one (run, step, direction) cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Succeeded,
    /// Failed in a way that requires an operator decision (retry/skip).
    WaitingManual,
    /// Manually marked satisfied; dependents treat this like success.
    Skipped,
    /// Dropped without executing because the run's cancellation was
    /// requested. Not a problem state.
    Cancelled,
    /// Failed and will not be retried automatically.
    Abandoned,
}

impl StepState {
    /// States that satisfy a dependency edge.
    pub fn is_satisfied(self) -> bool {
        matches!(self, StepState::Succeeded | StepState::Skipped)
    }

    /// States that should surface as actionable problems.
    pub fn is_problem(self) -> bool {
        matches!(self, StepState::WaitingManual | StepState::Abandoned)
    }
}

/// Execution direction of a step instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Forward (apply) work.
    Do,
    /// Compensating (rollback) work.
    Undo,
}

/// Operator decision for a step stuck in `WaitingManual`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualActionKind {
    /// Return the step to `Pending` so it re-enters the claim pool.
    Retry,
    /// Mark the step `Skipped` so dependents treat it as satisfied.
    Skip,
}

macro_rules! string_repr {
    ($ty:ty { $($variant:path => $s:literal),+ $(,)? }) => {
        impl $ty {
            /// Database string form.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($variant => $s,)+
                }
            }

            /// Parse the database string form.
            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($s => Some($variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_repr!(DesiredState {
    DesiredState::Present => "present",
    DesiredState::Absent => "absent",
});

string_repr!(RunKind {
    RunKind::Apply => "apply",
    RunKind::Teardown => "teardown",
});

string_repr!(RunState {
    RunState::Applying => "applying",
    RunState::TearingDown => "tearing_down",
    RunState::CancelRequested => "cancel_requested",
    RunState::Succeeded => "succeeded",
});

string_repr!(StepState {
    StepState::Pending => "pending",
    StepState::Running => "running",
    StepState::Succeeded => "succeeded",
    StepState::WaitingManual => "waiting_manual",
    StepState::Skipped => "skipped",
    StepState::Cancelled => "cancelled",
    StepState::Abandoned => "abandoned",
});

string_repr!(Direction {
    Direction::Do => "do",
    Direction::Undo => "undo",
});

string_repr!(ManualActionKind {
    ManualActionKind::Retry => "retry",
    ManualActionKind::Skip => "skip",
});

impl RunKind {
    /// Initial run state for this kind.
    pub fn initial_state(self) -> RunState {
        match self {
            RunKind::Apply => RunState::Applying,
            RunKind::Teardown => RunState::TearingDown,
        }
    }

    /// The direction whose steps must all be satisfied for the run to
    /// finalize: DO for APPLY, UNDO for TEARDOWN.
    pub fn relevant_direction(self) -> Direction {
        match self {
            RunKind::Apply => Direction::Do,
            RunKind::Teardown => Direction::Undo,
        }
    }
}

/// A workflow's execution order: a set of step identifiers plus dependency
/// edges. An edge is `(depends_on, step)`: `step` may not start until
/// `depends_on` is satisfied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagTemplate {
    pub workflow_id: String,
    pub nodes: BTreeSet<String>,
    pub edges: BTreeSet<(String, String)>,
}

impl DagTemplate {
    /// Create an empty template.
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            nodes: BTreeSet::new(),
            edges: BTreeSet::new(),
        }
    }

    /// Add a step identifier.
    pub fn with_node(mut self, step_id: impl Into<String>) -> Self {
        self.nodes.insert(step_id.into());
        self
    }

    /// Add a dependency edge: `step` waits for `depends_on`.
    ///
    /// Both endpoints are added to the node set.
    pub fn with_edge(mut self, depends_on: impl Into<String>, step: impl Into<String>) -> Self {
        let depends_on = depends_on.into();
        let step = step.into();
        self.nodes.insert(depends_on.clone());
        self.nodes.insert(step.clone());
        self.edges.insert((depends_on, step));
        self
    }

    /// Step identifiers with no incoming edges (claimable immediately).
    pub fn roots(&self) -> BTreeSet<&str> {
        self.nodes
            .iter()
            .filter(|n| !self.edges.iter().any(|(_, step)| step == *n))
            .map(|n| n.as_str())
            .collect()
    }
}

/// Ownership of one claimed step: everything a worker needs to execute it,
/// heartbeat it, and finalize it. Completion operations are scoped to
/// `(run_id, step_id, direction, worker_id)` so a worker can never finalize
/// a step it no longer owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepClaim {
    pub run_id: RunId,
    pub step_id: String,
    pub direction: Direction,
    pub attempt: i32,
    pub worker_id: String,
    pub lease_until: DateTime<Utc>,
}

/// An operator decision applied to a `WaitingManual` step, with audit fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualAction {
    pub kind: ManualActionKind,
    pub performed_by: String,
    pub reason: Option<String>,
}

impl ManualAction {
    pub fn retry(performed_by: impl Into<String>) -> Self {
        Self {
            kind: ManualActionKind::Retry,
            performed_by: performed_by.into(),
            reason: None,
        }
    }

    pub fn skip(performed_by: impl Into<String>) -> Self {
        Self {
            kind: ManualActionKind::Skip,
            performed_by: performed_by.into(),
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Payload for the optional wakeup channel: an external bus may deliver one
/// of these to ask workers to drain immediately instead of waiting out the
/// poll interval. Absence of the channel degrades to pure polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeupMessage {
    /// Node the wakeup concerns, if any.
    pub node_id: Option<String>,
    pub reason: String,
}

/// A node row as read back from the store.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub node_id: String,
    pub desired_state: DesiredState,
    pub desired_spec: serde_json::Value,
    pub desired_generation: i64,
    pub active_run_id: Option<RunId>,
}

/// A run row as read back from the store.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: RunId,
    pub node_id: String,
    pub generation: i64,
    pub kind: RunKind,
    pub state: RunState,
    pub reason: Option<String>,
    pub cancel_requested_at: Option<DateTime<Utc>>,
}

/// A step-execution row as read back from the store.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub run_id: RunId,
    pub step_id: String,
    pub direction: Direction,
    pub state: StepState,
    pub attempt: i32,
    pub worker_id: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub manual_required_at: Option<DateTime<Utc>>,
    pub manual_action: Option<ManualActionKind>,
    pub manual_action_by: Option<String>,
    pub manual_action_at: Option<DateTime<Utc>>,
    pub manual_action_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_strings_round_trip() {
        for state in [
            StepState::Pending,
            StepState::Running,
            StepState::Succeeded,
            StepState::WaitingManual,
            StepState::Skipped,
            StepState::Cancelled,
            StepState::Abandoned,
        ] {
            assert_eq!(StepState::parse(state.as_str()), Some(state));
        }
        assert_eq!(StepState::parse("nope"), None);
        assert_eq!(Direction::parse("undo"), Some(Direction::Undo));
        assert_eq!(RunState::parse("tearing_down"), Some(RunState::TearingDown));
    }

    #[test]
    fn run_kind_drives_initial_state_and_direction() {
        assert_eq!(RunKind::Apply.initial_state(), RunState::Applying);
        assert_eq!(RunKind::Teardown.initial_state(), RunState::TearingDown);
        assert_eq!(RunKind::Apply.relevant_direction(), Direction::Do);
        assert_eq!(RunKind::Teardown.relevant_direction(), Direction::Undo);
    }

    #[test]
    fn template_edges_imply_nodes() {
        let template = DagTemplate::new("apply")
            .with_edge("create_volume", "start_container")
            .with_node("register_dns");

        assert_eq!(template.nodes.len(), 3);
        assert!(template
            .edges
            .contains(&("create_volume".into(), "start_container".into())));
        let roots = template.roots();
        assert!(roots.contains("create_volume"));
        assert!(roots.contains("register_dns"));
        assert!(!roots.contains("start_container"));
    }

    #[test]
    fn satisfied_and_problem_states() {
        assert!(StepState::Succeeded.is_satisfied());
        assert!(StepState::Skipped.is_satisfied());
        assert!(!StepState::Pending.is_satisfied());
        assert!(StepState::WaitingManual.is_problem());
        assert!(StepState::Abandoned.is_problem());
        assert!(!StepState::Running.is_problem());
    }
}

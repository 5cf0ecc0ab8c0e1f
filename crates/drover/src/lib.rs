//! # Drover
//!
//! A convergence engine for dynamic services. Each service ("node") carries
//! a desired state (present or absent); drover converges reality toward it
//! by executing a persisted DAG of idempotent steps, with at most one active
//! execution per step across any number of concurrent workers.
//!
//! ```text
//!   Engine (request_apply / request_teardown / cancel / manual actions)
//!      |
//!      v
//!   SchedulerStore (Postgres or in-memory)
//!      nodes ── runs ── step executions ── step deps
//!      ^
//!      |  claim / heartbeat / complete / recover
//!   Worker (DrainLoop polls, executes StepHandlers, leases claims)
//! ```
//!
//! Key properties:
//!
//! - **Skip-locked claiming**: a step is handed to exactly one worker at a
//!   time, via `FOR UPDATE SKIP LOCKED` in the Postgres store.
//! - **Leases, not locks**: a claim expires unless heartbeated, so a dead
//!   worker's steps are reaped and their runs resolved, not stuck.
//! - **Compensating rollback**: every step has DO and UNDO handlers; a
//!   teardown run executes the reversed DAG.
//! - **Operator recovery**: a failed UNDO parks the step for a human, who
//!   retries or skips it with an audited decision.
//!
//! ## Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use drover::prelude::*;
//!
//! let mut registry = StepRegistry::new();
//! registry.register_step("create_volume", Arc::new(CreateVolume));
//! registry.register_workflow(
//!     DagTemplate::new("apply").with_edge("create_volume", "start_container"),
//! );
//!
//! let store = Arc::new(PostgresSchedulerStore::new(pool));
//! store.migrate().await?;
//!
//! let registry = Arc::new(registry);
//! let engine = Engine::new(store.clone(), registry.clone(), EngineConfig::default());
//! let run_id = engine.request_apply("node-1", serde_json::json!({"image": "svc:1"})).await?;
//!
//! let worker = Worker::new(store, registry, Arc::new(StepContext::new()), WorkerConfig::default());
//! worker.try_drain(10).await?;
//! ```

pub mod dag;
pub mod engine;
pub mod model;
pub mod persistence;
pub mod registry;
pub mod step;
pub mod worker;

pub use engine::{Engine, EngineConfig, EngineError, RunStatus};
pub use model::{
    DagTemplate, DesiredState, Direction, ManualAction, ManualActionKind, NodeRecord, RunId,
    RunKind, RunRecord, RunState, StepClaim, StepRecord, StepState, WakeupMessage,
};
pub use persistence::{
    InMemorySchedulerStore, PostgresSchedulerStore, RunRequest, SchedulerStore, StoreError,
};
pub use registry::{RegistryError, StepRegistry};
pub use step::{StepContext, StepError, StepHandler};
pub use worker::{DrainLoop, DrainReport, PollerConfig, Worker, WorkerConfig, WorkerError};

/// Commonly used types, in one import.
pub mod prelude {
    pub use crate::engine::{Engine, EngineConfig, EngineError, RunStatus};
    pub use crate::model::{
        DagTemplate, DesiredState, Direction, ManualAction, ManualActionKind, NodeRecord, RunId,
        RunKind, RunRecord, RunState, StepClaim, StepRecord, StepState,
    };
    pub use crate::persistence::{
        InMemorySchedulerStore, PostgresSchedulerStore, RunRequest, SchedulerStore, StoreError,
    };
    pub use crate::registry::StepRegistry;
    pub use crate::step::{StepContext, StepError, StepHandler};
    pub use crate::worker::{DrainLoop, PollerConfig, Worker, WorkerConfig};
}

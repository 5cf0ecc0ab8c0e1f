//! End-to-end scheduler scenarios against the in-memory store.
//!
//! These exercise the full engine + worker state machine: dependency-ordered
//! execution, failure policy in both directions, cooperative cancellation,
//! lease expiry recovery, manual operator actions, and finalization guards.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use drover::prelude::*;
use drover::worker::DrainReport;

type Log = Arc<Mutex<Vec<String>>>;

/// Test handler that records invocations and fails or panics on demand.
struct ScriptedStep {
    name: String,
    log: Log,
    fail_do: AtomicUsize,
    fail_undo: AtomicUsize,
    panic_on_do: bool,
}

impl ScriptedStep {
    fn new(name: &str, log: Log) -> Self {
        Self {
            name: name.to_string(),
            log,
            fail_do: AtomicUsize::new(0),
            fail_undo: AtomicUsize::new(0),
            panic_on_do: false,
        }
    }

    fn fail_do_times(self, times: usize) -> Self {
        self.fail_do.store(times, Ordering::SeqCst);
        self
    }

    fn fail_undo_times(self, times: usize) -> Self {
        self.fail_undo.store(times, Ordering::SeqCst);
        self
    }

    fn panic_on_do(mut self) -> Self {
        self.panic_on_do = true;
        self
    }

    fn record(&self, direction: &str) {
        self.log
            .lock()
            .unwrap()
            .push(format!("{direction}:{}", self.name));
    }
}

#[async_trait]
impl StepHandler for ScriptedStep {
    async fn run(&self, _ctx: &StepContext, _claim: &StepClaim) -> Result<(), StepError> {
        self.record("do");
        if self.panic_on_do {
            panic!("scripted panic in {}", self.name);
        }
        if self.fail_do.load(Ordering::SeqCst) > 0 {
            self.fail_do.fetch_sub(1, Ordering::SeqCst);
            return Err(StepError::new(format!("{} refused to apply", self.name)));
        }
        Ok(())
    }

    async fn undo(&self, _ctx: &StepContext, _claim: &StepClaim) -> Result<(), StepError> {
        self.record("undo");
        if self.fail_undo.load(Ordering::SeqCst) > 0 {
            self.fail_undo.fetch_sub(1, Ordering::SeqCst);
            return Err(StepError::new(format!("{} refused to roll back", self.name)));
        }
        Ok(())
    }
}

struct Fixture {
    store: Arc<InMemorySchedulerStore>,
    engine: Engine<InMemorySchedulerStore>,
    worker: Worker<InMemorySchedulerStore>,
    log: Log,
}

/// Linear DAG a -> b -> c with scripted handlers, customized by `tweak`.
fn chain_fixture(tweak: impl Fn(ScriptedStep) -> ScriptedStep) -> Fixture {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let store = Arc::new(InMemorySchedulerStore::new());

    let mut registry = StepRegistry::new();
    for name in ["a", "b", "c"] {
        registry.register_step(name, Arc::new(tweak(ScriptedStep::new(name, log.clone()))));
    }
    registry.register_workflow(DagTemplate::new("apply").with_edge("a", "b").with_edge("b", "c"));
    let registry = Arc::new(registry);

    let engine = Engine::new(store.clone(), registry.clone(), EngineConfig::default());
    let worker = Worker::new(
        store.clone(),
        registry,
        Arc::new(StepContext::new()),
        WorkerConfig::default().with_worker_id("test-worker"),
    );

    Fixture {
        store,
        engine,
        worker,
        log,
    }
}

fn spec() -> serde_json::Value {
    serde_json::json!({"image": "svc:1"})
}

fn step<'a>(status: &'a RunStatus, step_id: &str) -> &'a StepRecord {
    status
        .steps
        .iter()
        .find(|s| s.step_id == step_id)
        .unwrap_or_else(|| panic!("step {step_id} missing"))
}

#[test_log::test(tokio::test)]
async fn apply_run_executes_steps_in_dependency_order() {
    let fx = chain_fixture(|s| s);

    let run_id = fx.engine.request_apply("node-1", spec()).await.unwrap();
    let report = fx.worker.try_drain(10).await.unwrap();

    assert_eq!(report.executed, 3);
    assert_eq!(*fx.log.lock().unwrap(), vec!["do:a", "do:b", "do:c"]);

    let status = fx.engine.run_status(run_id).await.unwrap();
    assert_eq!(status.run.state, RunState::Succeeded);
    assert!(!status.has_problems);
    assert!(status.steps.iter().all(|s| s.state == StepState::Succeeded));

    let node = fx.store.get_node("node-1").await.unwrap().unwrap();
    assert_eq!(node.active_run_id, None);
    assert_eq!(node.desired_state, DesiredState::Present);
    assert_eq!(node.desired_generation, 1);
}

#[test_log::test(tokio::test)]
async fn do_failure_abandons_step_and_cancels_run() {
    let fx = chain_fixture(|s| if s.name == "b" { s.fail_do_times(1) } else { s });

    let run_id = fx.engine.request_apply("node-1", spec()).await.unwrap();
    fx.worker.try_drain(10).await.unwrap();

    let status = fx.engine.run_status(run_id).await.unwrap();
    assert_eq!(status.run.state, RunState::CancelRequested);
    assert!(status.run.cancel_requested_at.is_some());
    assert!(status.has_problems);

    assert_eq!(step(&status, "a").state, StepState::Succeeded);
    let b = step(&status, "b");
    assert_eq!(b.state, StepState::Abandoned);
    assert_eq!(b.last_error.as_deref(), Some("b refused to apply"));
    // c's dependency is never satisfied, so it stays pending forever.
    assert_eq!(step(&status, "c").state, StepState::Pending);

    // Nothing left to do.
    let report = fx.worker.try_drain(10).await.unwrap();
    assert_eq!(report, DrainReport::default());
    assert!(fx.store.run_has_problems(run_id).await.unwrap());
}

#[test_log::test(tokio::test)]
async fn cancellation_drops_claimed_forward_steps_without_executing() {
    let fx = chain_fixture(|s| s);

    let run_id = fx.engine.request_apply("node-1", spec()).await.unwrap();
    fx.engine.request_cancel(run_id).await.unwrap();
    fx.worker.try_drain(10).await.unwrap();

    // The handler never ran.
    assert!(fx.log.lock().unwrap().is_empty());

    let status = fx.engine.run_status(run_id).await.unwrap();
    assert_eq!(step(&status, "a").state, StepState::Cancelled);
    assert!(step(&status, "a").last_error.is_none());
    assert_eq!(step(&status, "b").state, StepState::Pending);
    assert_eq!(status.run.state, RunState::CancelRequested);
    // An operator-requested cancel is not a problem needing attention.
    assert!(!status.has_problems);
    assert!(!fx.store.run_has_problems(run_id).await.unwrap());
}

#[test_log::test(tokio::test)]
async fn teardown_executes_reversed_dag() {
    let fx = chain_fixture(|s| s);

    let apply_run = fx.engine.request_apply("node-1", spec()).await.unwrap();
    fx.worker.try_drain(10).await.unwrap();
    fx.log.lock().unwrap().clear();

    let teardown_run = fx
        .engine
        .request_teardown("node-1", Some("decommissioned"))
        .await
        .unwrap();
    assert_ne!(apply_run, teardown_run);

    fx.worker.try_drain(10).await.unwrap();
    assert_eq!(*fx.log.lock().unwrap(), vec!["undo:c", "undo:b", "undo:a"]);

    let status = fx.engine.run_status(teardown_run).await.unwrap();
    assert_eq!(status.run.kind, RunKind::Teardown);
    assert_eq!(status.run.state, RunState::Succeeded);
    assert_eq!(status.run.reason.as_deref(), Some("decommissioned"));
    assert!(status.steps.iter().all(|s| s.direction == Direction::Undo));

    let node = fx.store.get_node("node-1").await.unwrap().unwrap();
    assert_eq!(node.desired_state, DesiredState::Absent);
    assert_eq!(node.active_run_id, None);
    // Teardown flips the desired state but never rewrites the spec.
    assert_eq!(node.desired_spec["image"], "svc:1");
}

#[test_log::test(tokio::test)]
async fn failed_undo_waits_for_manual_retry() {
    let fx = chain_fixture(|s| if s.name == "b" { s.fail_undo_times(1) } else { s });

    fx.engine.request_apply("node-1", spec()).await.unwrap();
    fx.worker.try_drain(10).await.unwrap();

    let run_id = fx.engine.request_teardown("node-1", None).await.unwrap();
    fx.worker.try_drain(10).await.unwrap();

    let status = fx.engine.run_status(run_id).await.unwrap();
    let b = step(&status, "b");
    assert_eq!(b.state, StepState::WaitingManual);
    assert_eq!(b.last_error.as_deref(), Some("b refused to roll back"));
    assert!(b.manual_required_at.is_some());
    // a is downstream of b in the reversed DAG and stays blocked.
    assert_eq!(step(&status, "a").state, StepState::Pending);
    assert!(status.has_problems);

    // A second drain does not touch the parked step.
    let report = fx.worker.try_drain(10).await.unwrap();
    assert_eq!(report.executed, 0);

    fx.engine
        .apply_manual_action(run_id, "b", ManualAction::retry("op@example.com"))
        .await
        .unwrap();
    fx.worker.try_drain(10).await.unwrap();

    let status = fx.engine.run_status(run_id).await.unwrap();
    assert_eq!(status.run.state, RunState::Succeeded);
    let b = step(&status, "b");
    assert_eq!(b.state, StepState::Succeeded);
    assert_eq!(b.attempt, 2);
    assert_eq!(b.manual_action, Some(ManualActionKind::Retry));
    assert_eq!(b.manual_action_by.as_deref(), Some("op@example.com"));
}

#[test_log::test(tokio::test)]
async fn failed_undo_can_be_skipped() {
    let fx = chain_fixture(|s| {
        if s.name == "b" {
            s.fail_undo_times(usize::MAX)
        } else {
            s
        }
    });

    fx.engine.request_apply("node-1", spec()).await.unwrap();
    fx.worker.try_drain(10).await.unwrap();

    let run_id = fx.engine.request_teardown("node-1", None).await.unwrap();
    fx.worker.try_drain(10).await.unwrap();

    fx.engine
        .apply_manual_action(
            run_id,
            "b",
            ManualAction::skip("op@example.com").with_reason("resource already gone"),
        )
        .await
        .unwrap();
    fx.worker.try_drain(10).await.unwrap();

    let status = fx.engine.run_status(run_id).await.unwrap();
    assert_eq!(status.run.state, RunState::Succeeded);
    let b = step(&status, "b");
    assert_eq!(b.state, StepState::Skipped);
    assert_eq!(b.manual_action, Some(ManualActionKind::Skip));
    assert_eq!(b.manual_action_reason.as_deref(), Some("resource already gone"));
    assert_eq!(step(&status, "a").state, StepState::Succeeded);
}

#[test_log::test(tokio::test)]
async fn skipping_the_last_unsatisfied_step_finalizes_without_a_drain() {
    // In the reversed DAG, a is the leaf: c and b succeed first, then a
    // fails and is the only unsatisfied step left.
    let fx = chain_fixture(|s| if s.name == "a" { s.fail_undo_times(1) } else { s });

    fx.engine.request_apply("node-1", spec()).await.unwrap();
    fx.worker.try_drain(10).await.unwrap();

    let run_id = fx.engine.request_teardown("node-1", None).await.unwrap();
    fx.worker.try_drain(10).await.unwrap();

    let status = fx.engine.run_status(run_id).await.unwrap();
    assert_eq!(step(&status, "a").state, StepState::WaitingManual);

    // The skip satisfies the last step, so the manual action itself
    // finalizes the run.
    fx.engine
        .apply_manual_action(run_id, "a", ManualAction::skip("op"))
        .await
        .unwrap();

    let status = fx.engine.run_status(run_id).await.unwrap();
    assert_eq!(status.run.state, RunState::Succeeded);

    let node = fx.store.get_node("node-1").await.unwrap().unwrap();
    assert_eq!(node.active_run_id, None);
}

#[test_log::test(tokio::test)]
async fn manual_action_requires_waiting_state() {
    let fx = chain_fixture(|s| s);
    let run_id = fx.engine.request_apply("node-1", spec()).await.unwrap();

    let result = fx
        .engine
        .apply_manual_action(run_id, "a", ManualAction::retry("op"))
        .await;
    assert!(matches!(
        result,
        Err(EngineError::StepNotWaitingManual { .. })
    ));
}

#[test_log::test(tokio::test)]
async fn expired_do_lease_is_reaped_and_cancels_the_run() {
    let fx = chain_fixture(|s| s);
    let run_id = fx.engine.request_apply("node-1", spec()).await.unwrap();

    // A worker claims the root step and dies without heartbeating.
    let claim = fx
        .store
        .claim_one_step("dead-worker", Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claim.step_id, "a");
    tokio::time::sleep(Duration::from_millis(120)).await;

    let report = fx.worker.try_drain(10).await.unwrap();
    assert_eq!(report.recovered, 1);
    assert_eq!(report.executed, 0);

    let status = fx.engine.run_status(run_id).await.unwrap();
    let a = step(&status, "a");
    assert_eq!(a.state, StepState::Abandoned);
    assert!(a.last_error.as_deref().unwrap().contains("lease expired"));
    assert_eq!(status.run.state, RunState::CancelRequested);

    // The reaper is idempotent.
    let report = fx.worker.try_drain(10).await.unwrap();
    assert_eq!(report.recovered, 0);
}

#[test_log::test(tokio::test)]
async fn expired_undo_lease_parks_the_step_for_an_operator() {
    let fx = chain_fixture(|s| s);
    fx.engine.request_apply("node-1", spec()).await.unwrap();
    fx.worker.try_drain(10).await.unwrap();

    let run_id = fx.engine.request_teardown("node-1", None).await.unwrap();
    let claim = fx
        .store
        .claim_one_step("dead-worker", Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claim.direction, Direction::Undo);
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert_eq!(
        fx.store.recover_expired_running_steps(100).await.unwrap(),
        1
    );

    let status = fx.engine.run_status(run_id).await.unwrap();
    let parked = step(&status, &claim.step_id);
    assert_eq!(parked.state, StepState::WaitingManual);
    assert!(parked.manual_required_at.is_some());
    // UNDO failure never cancels the teardown run.
    assert_ne!(status.run.state, RunState::CancelRequested);
}

#[test_log::test(tokio::test)]
async fn heartbeat_extends_lease_monotonically() {
    let fx = chain_fixture(|s| s);
    let run_id = fx.engine.request_apply("node-1", spec()).await.unwrap();

    let claim = fx
        .store
        .claim_one_step("w1", Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();

    async fn lease_of(store: &InMemorySchedulerStore, run_id: RunId) -> chrono::DateTime<chrono::Utc> {
        store
            .list_steps(run_id)
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.step_id == "a")
            .unwrap()
            .lease_until
            .unwrap()
    }

    let initial = claim.lease_until;
    fx.store
        .heartbeat_step(&claim, Duration::from_secs(5))
        .await
        .unwrap();
    let first = lease_of(&fx.store, run_id).await;
    assert!(first > initial);

    fx.store
        .heartbeat_step(&claim, Duration::from_secs(5))
        .await
        .unwrap();
    let second = lease_of(&fx.store, run_id).await;
    assert!(second > first);

    // A heartbeat from a worker that lost the claim is a no-op.
    let stolen = StepClaim {
        worker_id: "w2".to_string(),
        ..claim.clone()
    };
    fx.store
        .heartbeat_step(&stolen, Duration::from_secs(60))
        .await
        .unwrap();
    let third = lease_of(&fx.store, run_id).await;
    assert_eq!(third, second);
}

#[test_log::test(tokio::test)]
async fn finalizing_an_old_run_does_not_steal_the_active_pointer() {
    let store = InMemorySchedulerStore::new();
    let request = |spec: serde_json::Value| RunRequest {
        node_id: "node-1".to_string(),
        desired_state: DesiredState::Present,
        desired_spec: Some(spec),
        kind: RunKind::Apply,
        reason: None,
        template: DagTemplate::new("apply").with_node("only"),
    };

    let run1 = store
        .begin_run(request(serde_json::json!({"image": "svc:1"})))
        .await
        .unwrap();
    let run2 = store
        .begin_run(request(serde_json::json!({"image": "svc:2"})))
        .await
        .unwrap();

    let node = store.get_node("node-1").await.unwrap().unwrap();
    assert_eq!(node.active_run_id, Some(run2));
    assert_eq!(node.desired_generation, 2);

    // run1's step was materialized first, so it is claimed first.
    let claim = store
        .claim_one_step("w1", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claim.run_id, run1);
    store.mark_step_succeeded(&claim).await.unwrap();

    // run1 finalizes while run2 is still incomplete: the run succeeds but
    // the node pointer stays with run2.
    assert!(store.try_finalize_run(run1).await.unwrap());
    assert_eq!(
        store.get_run(run1).await.unwrap().unwrap().state,
        RunState::Succeeded
    );
    let node = store.get_node("node-1").await.unwrap().unwrap();
    assert_eq!(node.active_run_id, Some(run2));

    let claim = store
        .claim_one_step("w1", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claim.run_id, run2);
    store.mark_step_succeeded(&claim).await.unwrap();

    assert!(store.try_finalize_run(run2).await.unwrap());
    let node = store.get_node("node-1").await.unwrap().unwrap();
    assert_eq!(node.active_run_id, None);
}

#[test_log::test(tokio::test)]
async fn concurrent_workers_never_double_execute_a_step() {
    let fx = chain_fixture(|s| s);
    let fx2_worker = Worker::new(
        fx.store.clone(),
        fx.engine.registry().clone(),
        Arc::new(StepContext::new()),
        WorkerConfig::default().with_worker_id("test-worker-2"),
    );

    let run_id = fx.engine.request_apply("node-1", spec()).await.unwrap();

    let (r1, r2) = tokio::join!(fx.worker.try_drain(10), fx2_worker.try_drain(10));
    assert_eq!(r1.unwrap().executed + r2.unwrap().executed, 3);

    let log = fx.log.lock().unwrap();
    assert_eq!(log.len(), 3);
    for name in ["do:a", "do:b", "do:c"] {
        assert_eq!(log.iter().filter(|e| e.as_str() == name).count(), 1);
    }
    drop(log);

    let status = fx.engine.run_status(run_id).await.unwrap();
    assert_eq!(status.run.state, RunState::Succeeded);
    assert!(status.steps.iter().all(|s| s.attempt == 1));
}

#[test_log::test(tokio::test)]
async fn missing_handler_abandons_the_step() {
    let store = Arc::new(InMemorySchedulerStore::new());
    let mut registry = StepRegistry::new();
    registry.register_workflow(DagTemplate::new("apply").with_node("ghost"));
    let registry = Arc::new(registry);

    let engine = Engine::new(store.clone(), registry.clone(), EngineConfig::default());
    let worker = Worker::new(
        store,
        registry,
        Arc::new(StepContext::new()),
        WorkerConfig::default(),
    );

    let run_id = engine.request_apply("node-1", spec()).await.unwrap();
    worker.try_drain(10).await.unwrap();

    let status = engine.run_status(run_id).await.unwrap();
    let ghost = step(&status, "ghost");
    assert_eq!(ghost.state, StepState::Abandoned);
    assert!(ghost.last_error.as_deref().unwrap().contains("no handler"));
    assert_eq!(status.run.state, RunState::CancelRequested);
}

#[test_log::test(tokio::test)]
async fn panicking_step_is_contained_and_abandoned() {
    let fx = chain_fixture(|s| if s.name == "a" { s.panic_on_do() } else { s });

    let run_id = fx.engine.request_apply("node-1", spec()).await.unwrap();
    fx.worker.try_drain(10).await.unwrap();

    let status = fx.engine.run_status(run_id).await.unwrap();
    let a = step(&status, "a");
    assert_eq!(a.state, StepState::Abandoned);
    assert!(a.last_error.as_deref().unwrap().contains("panicked"));
    assert_eq!(status.run.state, RunState::CancelRequested);
}

#[test_log::test(tokio::test)]
async fn handlers_read_shared_values_from_the_context() {
    #[derive(Debug)]
    struct Region(String);

    struct RegionReader {
        seen: Arc<Mutex<Option<String>>>,
    }

    #[async_trait]
    impl StepHandler for RegionReader {
        async fn run(&self, ctx: &StepContext, _claim: &StepClaim) -> Result<(), StepError> {
            let region = ctx
                .get::<Region>()
                .ok_or_else(|| StepError::new("region missing from context"))?;
            *self.seen.lock().unwrap() = Some(region.0.clone());
            Ok(())
        }

        async fn undo(&self, _ctx: &StepContext, _claim: &StepClaim) -> Result<(), StepError> {
            Ok(())
        }
    }

    let seen = Arc::new(Mutex::new(None));
    let store = Arc::new(InMemorySchedulerStore::new());
    let mut registry = StepRegistry::new();
    registry.register_step("probe", Arc::new(RegionReader { seen: seen.clone() }));
    registry.register_workflow(DagTemplate::new("apply").with_node("probe"));
    let registry = Arc::new(registry);

    let engine = Engine::new(store.clone(), registry.clone(), EngineConfig::default());
    let worker = Worker::new(
        store,
        registry,
        Arc::new(StepContext::new().with(Region("eu-west-1".to_string()))),
        WorkerConfig::default(),
    );

    engine.request_apply("node-1", spec()).await.unwrap();
    worker.try_drain(10).await.unwrap();

    assert_eq!(seen.lock().unwrap().as_deref(), Some("eu-west-1"));
}

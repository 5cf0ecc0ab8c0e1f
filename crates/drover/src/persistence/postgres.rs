//! PostgreSQL implementation of [`SchedulerStore`].
//!
//! The production store. All cross-worker invariants are expressed as SQL:
//! row locks serialize node-level mutations, a CTE with
//! `FOR UPDATE SKIP LOCKED` hands out step claims without a lock manager,
//! and `NOW()` on the server is the single clock for leases.
//!
//! The transaction-composable primitives (`lock_node`, `set_node_desired`,
//! `create_run`, `set_active_run`, `insert_steps`, `insert_deps`) are
//! inherent methods taking `&mut PgConnection`, so callers can compose them
//! into one atomic sequence; the trait methods run each operation as its own
//! transaction.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::{RunRequest, SchedulerStore, StoreError};
use crate::model::{
    DagTemplate, DesiredState, Direction, ManualAction, ManualActionKind, NodeRecord, RunId,
    RunKind, RunRecord, RunState, StepClaim, StepRecord, StepState,
};

/// Error message recorded on steps reaped by lease-expiry recovery.
const LEASE_EXPIRED_ERROR: &str = "lease expired while running; previous worker likely died";

/// PostgreSQL-backed scheduler store.
///
/// # Example
///
/// ```ignore
/// use drover::persistence::PostgresSchedulerStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/drover").await?;
/// let store = PostgresSchedulerStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresSchedulerStore {
    pool: PgPool,
}

impl PostgresSchedulerStore {
    /// Create a store with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and create a store from a database URL.
    pub async fn from_url(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await.map_err(db_err)?;
        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    // =========================================================================
    // Transaction-composable primitives
    // =========================================================================

    /// Ensure the node row exists, then take a blocking row-level lock on it
    /// for the remainder of the enclosing transaction. Serializes concurrent
    /// desired-state and active-run mutations against the same node.
    pub async fn lock_node(
        &self,
        conn: &mut PgConnection,
        node_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO drover_nodes (node_id, desired_state)
            VALUES ($1, 'present')
            ON CONFLICT (node_id) DO NOTHING
            "#,
        )
        .bind(node_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;

        sqlx::query("SELECT node_id FROM drover_nodes WHERE node_id = $1 FOR UPDATE")
            .bind(node_id)
            .fetch_one(&mut *conn)
            .await
            .map_err(db_err)?;

        Ok(())
    }

    /// Update the node's desired state/spec and bump `desired_generation`,
    /// returning the new generation. A `None` spec keeps the current one.
    /// The caller must hold the node lock.
    pub async fn set_node_desired(
        &self,
        conn: &mut PgConnection,
        node_id: &str,
        desired_state: DesiredState,
        desired_spec: Option<&serde_json::Value>,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE drover_nodes
            SET desired_state = $2,
                desired_spec = COALESCE($3, desired_spec),
                desired_generation = desired_generation + 1,
                modified = NOW()
            WHERE node_id = $1
            RETURNING desired_generation
            "#,
        )
        .bind(node_id)
        .bind(desired_state.as_str())
        .bind(desired_spec)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_err)?;

        Ok(row.get("desired_generation"))
    }

    /// Insert a run row in its kind-appropriate initial state and return the
    /// generated run id.
    pub async fn create_run(
        &self,
        conn: &mut PgConnection,
        node_id: &str,
        generation: i64,
        kind: RunKind,
        reason: Option<&str>,
    ) -> Result<RunId, StoreError> {
        let run_id = Uuid::now_v7();

        sqlx::query(
            r#"
            INSERT INTO drover_runs (run_id, node_id, generation, kind, state, reason)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(run_id)
        .bind(node_id)
        .bind(generation)
        .bind(kind.as_str())
        .bind(kind.initial_state().as_str())
        .bind(reason)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;

        Ok(run_id)
    }

    /// Set or clear the node's `active_run_id` pointer. The caller must hold
    /// the node lock.
    pub async fn set_active_run(
        &self,
        conn: &mut PgConnection,
        node_id: &str,
        run_id: Option<RunId>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE drover_nodes
            SET active_run_id = $2, modified = NOW()
            WHERE node_id = $1
            "#,
        )
        .bind(node_id)
        .bind(run_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    /// Materialize the template's nodes as `Pending` step rows. Idempotent:
    /// a duplicate insert is a no-op, so materialization is safe to retry.
    pub async fn insert_steps(
        &self,
        conn: &mut PgConnection,
        run_id: RunId,
        direction: Direction,
        template: &DagTemplate,
    ) -> Result<(), StoreError> {
        for step_id in &template.nodes {
            sqlx::query(
                r#"
                INSERT INTO drover_step_executions (run_id, step_id, direction, state)
                VALUES ($1, $2, $3, 'pending')
                ON CONFLICT (run_id, step_id, direction) DO NOTHING
                "#,
            )
            .bind(run_id)
            .bind(step_id)
            .bind(direction.as_str())
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
        }

        Ok(())
    }

    /// Materialize the template's edges as dependency rows, with the same
    /// idempotency guarantee as [`insert_steps`](Self::insert_steps).
    pub async fn insert_deps(
        &self,
        conn: &mut PgConnection,
        run_id: RunId,
        direction: Direction,
        template: &DagTemplate,
    ) -> Result<(), StoreError> {
        for (depends_on, step_id) in &template.edges {
            sqlx::query(
                r#"
                INSERT INTO drover_step_deps (run_id, direction, step_id, depends_on_step_id)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (run_id, direction, step_id, depends_on_step_id) DO NOTHING
                "#,
            )
            .bind(run_id)
            .bind(direction.as_str())
            .bind(step_id)
            .bind(depends_on)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
        }

        Ok(())
    }

    /// Flip a run to `CancelRequested` inside the given connection.
    pub async fn mark_run_cancel_requested_on(
        &self,
        conn: &mut PgConnection,
        run_id: RunId,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE drover_runs
            SET state = 'cancel_requested', cancel_requested_at = NOW()
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;

        Ok(())
    }
}

#[async_trait]
impl SchedulerStore for PostgresSchedulerStore {
    #[instrument(skip(self, request), fields(node_id = %request.node_id, kind = %request.kind))]
    async fn begin_run(&self, request: RunRequest) -> Result<RunId, StoreError> {
        let direction = request.kind.relevant_direction();

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        self.lock_node(&mut tx, &request.node_id).await?;
        let generation = self
            .set_node_desired(
                &mut tx,
                &request.node_id,
                request.desired_state,
                request.desired_spec.as_ref(),
            )
            .await?;
        let run_id = self
            .create_run(
                &mut tx,
                &request.node_id,
                generation,
                request.kind,
                request.reason.as_deref(),
            )
            .await?;
        self.set_active_run(&mut tx, &request.node_id, Some(run_id))
            .await?;
        self.insert_steps(&mut tx, run_id, direction, &request.template)
            .await?;
        self.insert_deps(&mut tx, run_id, direction, &request.template)
            .await?;

        tx.commit().await.map_err(db_err)?;

        debug!(%run_id, generation, "opened run");
        Ok(run_id)
    }

    #[instrument(skip(self))]
    async fn get_node(&self, node_id: &str) -> Result<Option<NodeRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT node_id, desired_state, desired_spec, desired_generation, active_run_id
            FROM drover_nodes
            WHERE node_id = $1
            "#,
        )
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|row| {
            Ok(NodeRecord {
                node_id: row.get("node_id"),
                desired_state: parse_desired_state(&row.get::<String, _>("desired_state"))?,
                desired_spec: row.get("desired_spec"),
                desired_generation: row.get("desired_generation"),
                active_run_id: row.get("active_run_id"),
            })
        })
        .transpose()
    }

    #[instrument(skip(self))]
    async fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT run_id, node_id, generation, kind, state, reason, cancel_requested_at
            FROM drover_runs
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(decode_run).transpose()
    }

    #[instrument(skip(self))]
    async fn list_steps(&self, run_id: RunId) -> Result<Vec<StepRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, step_id, direction, state, attempt, worker_id, lease_until,
                   last_error, manual_required_at, manual_action, manual_action_at,
                   manual_action_by, manual_action_reason
            FROM drover_step_executions
            WHERE run_id = $1
            ORDER BY direction, step_id
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(decode_step).collect()
    }

    #[instrument(skip(self))]
    async fn mark_run_cancel_requested(&self, run_id: RunId) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        self.mark_run_cancel_requested_on(&mut conn, run_id).await
    }

    #[instrument(skip(self))]
    async fn try_finalize_run(&self, run_id: RunId) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let run_row = sqlx::query("SELECT node_id, kind FROM drover_runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;

        let Some(run_row) = run_row else {
            return Ok(false);
        };

        let kind = parse_run_kind(&run_row.get::<String, _>("kind"))?;
        let node_id: String = run_row.get("node_id");

        let remaining = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM drover_step_executions
                WHERE run_id = $1
                  AND direction = $2
                  AND state NOT IN ('succeeded', 'skipped')
            ) AS remaining
            "#,
        )
        .bind(run_id)
        .bind(kind.relevant_direction().as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        if remaining.get::<bool, _>("remaining") {
            return Ok(false);
        }

        sqlx::query("UPDATE drover_runs SET state = 'succeeded' WHERE run_id = $1")
            .bind(run_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        // Guard: only clear the pointer if a newer run has not taken over.
        sqlx::query(
            r#"
            UPDATE drover_nodes
            SET active_run_id = NULL, modified = NOW()
            WHERE node_id = $1 AND active_run_id = $2
            "#,
        )
        .bind(&node_id)
        .bind(run_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        debug!(%run_id, %node_id, "run finalized");
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn run_has_problems(&self, run_id: RunId) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM drover_step_executions
                WHERE run_id = $1 AND state IN ('waiting_manual', 'abandoned')
            ) AS has_problems
            "#,
        )
        .bind(run_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.get("has_problems"))
    }

    #[instrument(skip(self, lease_duration))]
    async fn claim_one_step(
        &self,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<StepClaim>, StoreError> {
        // Single atomic statement: the CTE picks the least-recently-modified
        // runnable step and locks it with SKIP LOCKED so competing workers
        // each land on a different row; the UPDATE transitions it to running.
        let row = sqlx::query(
            r#"
            WITH candidate AS (
                SELECT s.run_id, s.step_id, s.direction
                FROM drover_step_executions s
                WHERE s.state = 'pending'
                  AND (s.lease_until IS NULL OR s.lease_until < NOW())
                  AND NOT EXISTS (
                      SELECT 1
                      FROM drover_step_deps d
                      JOIN drover_step_executions p
                        ON p.run_id = d.run_id
                       AND p.direction = d.direction
                       AND p.step_id = d.depends_on_step_id
                      WHERE d.run_id = s.run_id
                        AND d.direction = s.direction
                        AND d.step_id = s.step_id
                        AND p.state NOT IN ('succeeded', 'skipped')
                  )
                ORDER BY s.modified ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE drover_step_executions t
            SET state = 'running',
                attempt = t.attempt + 1,
                worker_id = $1,
                lease_until = NOW() + make_interval(secs => $2),
                modified = NOW()
            FROM candidate c
            WHERE t.run_id = c.run_id
              AND t.step_id = c.step_id
              AND t.direction = c.direction
            RETURNING t.run_id, t.step_id, t.direction, t.attempt, t.worker_id, t.lease_until
            "#,
        )
        .bind(worker_id)
        .bind(lease_duration.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to claim step: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let Some(row) = row else {
            return Ok(None);
        };

        let claim = StepClaim {
            run_id: row.get("run_id"),
            step_id: row.get("step_id"),
            direction: parse_direction(&row.get::<String, _>("direction"))?,
            attempt: row.get("attempt"),
            worker_id: row.get("worker_id"),
            lease_until: row.get("lease_until"),
        };

        debug!(
            run_id = %claim.run_id,
            step_id = %claim.step_id,
            direction = %claim.direction,
            attempt = claim.attempt,
            "claimed step"
        );
        Ok(Some(claim))
    }

    #[instrument(skip(self, claim, extend_by), fields(step_id = %claim.step_id))]
    async fn heartbeat_step(
        &self,
        claim: &StepClaim,
        extend_by: Duration,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE drover_step_executions
            SET lease_until = GREATEST(lease_until, NOW()) + make_interval(secs => $5)
            WHERE run_id = $1
              AND step_id = $2
              AND direction = $3
              AND worker_id = $4
              AND state = 'running'
            "#,
        )
        .bind(claim.run_id)
        .bind(&claim.step_id)
        .bind(claim.direction.as_str())
        .bind(&claim.worker_id)
        .bind(extend_by.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    #[instrument(skip(self, claim), fields(run_id = %claim.run_id, step_id = %claim.step_id))]
    async fn mark_step_succeeded(&self, claim: &StepClaim) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE drover_step_executions
            SET state = 'succeeded', lease_until = NULL, modified = NOW()
            WHERE run_id = $1
              AND step_id = $2
              AND direction = $3
              AND worker_id = $4
            "#,
        )
        .bind(claim.run_id)
        .bind(&claim.step_id)
        .bind(claim.direction.as_str())
        .bind(&claim.worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    #[instrument(skip(self, claim), fields(run_id = %claim.run_id, step_id = %claim.step_id))]
    async fn mark_step_cancelled(&self, claim: &StepClaim) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE drover_step_executions
            SET state = 'cancelled', lease_until = NULL, worker_id = NULL, modified = NOW()
            WHERE run_id = $1
              AND step_id = $2
              AND direction = $3
              AND worker_id = $4
            "#,
        )
        .bind(claim.run_id)
        .bind(&claim.step_id)
        .bind(claim.direction.as_str())
        .bind(&claim.worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    #[instrument(skip(self, claim, error), fields(run_id = %claim.run_id, step_id = %claim.step_id))]
    async fn mark_step_abandoned(&self, claim: &StepClaim, error: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            r#"
            UPDATE drover_step_executions
            SET state = 'abandoned',
                last_error = $5,
                manual_required_at = NULL,
                lease_until = NULL,
                worker_id = NULL,
                modified = NOW()
            WHERE run_id = $1
              AND step_id = $2
              AND direction = $3
              AND worker_id = $4
            "#,
        )
        .bind(claim.run_id)
        .bind(&claim.step_id)
        .bind(claim.direction.as_str())
        .bind(&claim.worker_id)
        .bind(error)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        // A forward failure is fatal to the run's progress.
        if claim.direction == Direction::Do {
            self.mark_run_cancel_requested_on(&mut tx, claim.run_id)
                .await?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self, claim, error), fields(run_id = %claim.run_id, step_id = %claim.step_id))]
    async fn mark_step_waiting_manual(
        &self,
        claim: &StepClaim,
        error: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE drover_step_executions
            SET state = 'waiting_manual',
                last_error = $5,
                manual_required_at = NOW(),
                lease_until = NULL,
                worker_id = NULL,
                modified = NOW()
            WHERE run_id = $1
              AND step_id = $2
              AND direction = $3
              AND worker_id = $4
            "#,
        )
        .bind(claim.run_id)
        .bind(&claim.step_id)
        .bind(claim.direction.as_str())
        .bind(&claim.worker_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn recover_expired_running_steps(&self, limit: i64) -> Result<u64, StoreError> {
        if limit <= 0 {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let rows = sqlx::query(
            r#"
            SELECT run_id, step_id, direction
            FROM drover_step_executions
            WHERE state = 'running'
              AND lease_until IS NOT NULL
              AND lease_until < NOW()
            ORDER BY lease_until ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        let mut reaped = 0u64;

        for row in rows {
            let run_id: RunId = row.get("run_id");
            let step_id: String = row.get("step_id");
            let direction = parse_direction(&row.get::<String, _>("direction"))?;

            let (new_state, manual_required_at_now) = match direction {
                Direction::Do => ("abandoned", false),
                Direction::Undo => ("waiting_manual", true),
            };

            let result = sqlx::query(
                r#"
                UPDATE drover_step_executions
                SET state = $4,
                    last_error = $5,
                    manual_required_at = CASE WHEN $6 THEN NOW() ELSE NULL END,
                    lease_until = NULL,
                    worker_id = NULL,
                    modified = NOW()
                WHERE run_id = $1
                  AND step_id = $2
                  AND direction = $3
                  AND state = 'running'
                  AND lease_until < NOW()
                "#,
            )
            .bind(run_id)
            .bind(&step_id)
            .bind(direction.as_str())
            .bind(new_state)
            .bind(LEASE_EXPIRED_ERROR)
            .bind(manual_required_at_now)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            if result.rows_affected() == 0 {
                continue;
            }

            if direction == Direction::Do {
                self.mark_run_cancel_requested_on(&mut tx, run_id).await?;
            }

            debug!(%run_id, %step_id, %direction, "reaped expired step lease");
            reaped += 1;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(reaped)
    }

    #[instrument(skip(self, action), fields(action = %action.kind))]
    async fn apply_manual_action(
        &self,
        run_id: RunId,
        step_id: &str,
        action: &ManualAction,
    ) -> Result<bool, StoreError> {
        let new_state = match action.kind {
            ManualActionKind::Retry => StepState::Pending,
            ManualActionKind::Skip => StepState::Skipped,
        };

        // RETRY clears last_error so the next attempt starts clean.
        let result = sqlx::query(
            r#"
            UPDATE drover_step_executions
            SET state = $3,
                last_error = CASE WHEN $3 = 'pending' THEN NULL ELSE last_error END,
                manual_action = $4,
                manual_action_at = NOW(),
                manual_action_by = $5,
                manual_action_reason = $6,
                lease_until = NULL,
                worker_id = NULL,
                modified = NOW()
            WHERE run_id = $1
              AND step_id = $2
              AND state = 'waiting_manual'
            "#,
        )
        .bind(run_id)
        .bind(step_id)
        .bind(new_state.as_str())
        .bind(action.kind.as_str())
        .bind(&action.performed_by)
        .bind(&action.reason)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn parse_desired_state(s: &str) -> Result<DesiredState, StoreError> {
    DesiredState::parse(s).ok_or_else(|| StoreError::Decode(format!("unknown desired state: {s}")))
}

fn parse_run_kind(s: &str) -> Result<RunKind, StoreError> {
    RunKind::parse(s).ok_or_else(|| StoreError::Decode(format!("unknown run kind: {s}")))
}

fn parse_run_state(s: &str) -> Result<RunState, StoreError> {
    RunState::parse(s).ok_or_else(|| StoreError::Decode(format!("unknown run state: {s}")))
}

fn parse_step_state(s: &str) -> Result<StepState, StoreError> {
    StepState::parse(s).ok_or_else(|| StoreError::Decode(format!("unknown step state: {s}")))
}

fn parse_direction(s: &str) -> Result<Direction, StoreError> {
    Direction::parse(s).ok_or_else(|| StoreError::Decode(format!("unknown direction: {s}")))
}

fn decode_run(row: sqlx::postgres::PgRow) -> Result<RunRecord, StoreError> {
    Ok(RunRecord {
        run_id: row.get("run_id"),
        node_id: row.get("node_id"),
        generation: row.get("generation"),
        kind: parse_run_kind(&row.get::<String, _>("kind"))?,
        state: parse_run_state(&row.get::<String, _>("state"))?,
        reason: row.get("reason"),
        cancel_requested_at: row.get("cancel_requested_at"),
    })
}

fn decode_step(row: sqlx::postgres::PgRow) -> Result<StepRecord, StoreError> {
    let manual_action = row
        .get::<Option<String>, _>("manual_action")
        .map(|s| {
            ManualActionKind::parse(&s)
                .ok_or_else(|| StoreError::Decode(format!("unknown manual action: {s}")))
        })
        .transpose()?;

    Ok(StepRecord {
        run_id: row.get("run_id"),
        step_id: row.get("step_id"),
        direction: parse_direction(&row.get::<String, _>("direction"))?,
        state: parse_step_state(&row.get::<String, _>("state"))?,
        attempt: row.get("attempt"),
        worker_id: row.get("worker_id"),
        lease_until: row.get("lease_until"),
        last_error: row.get("last_error"),
        manual_required_at: row.get("manual_required_at"),
        manual_action,
        manual_action_by: row.get("manual_action_by"),
        manual_action_at: row.get("manual_action_at"),
        manual_action_reason: row.get("manual_action_reason"),
    })
}

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use super::{RunState, WorkflowRun, WorkflowRunSource, WorkflowService};
use crate::error::WorkflowError;

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    workflow_name: String,
    input: sqlx::types::Json<Value>,
    state: String,
    attempt: i32,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
}

impl RunRow {
    fn into_run(self) -> WorkflowRun {
        let state = self.state.parse().unwrap_or_else(|e| {
            warn!(run_id = %self.id, "{e}, treating as running");
            RunState::Running
        });
        WorkflowRun {
            id: self.id,
            workflow_name: self.workflow_name,
            input: self.input.0,
            state,
            attempt: self.attempt,
            created_at: self.created_at,
            started_at: self.started_at,
        }
    }
}

/// Workflow runs stored in `sdlf_workflow_runs`, claimed with `FOR UPDATE SKIP LOCKED` so any
/// number of workers can share the table.
#[derive(Clone)]
pub struct PgWorkflowService {
    pool: PgPool,
}

impl PgWorkflowService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn query_error(command: &'static str) -> impl FnOnce(sqlx::Error) -> WorkflowError {
    move |error| WorkflowError::QueryError { command, error }
}

#[async_trait]
impl WorkflowService for PgWorkflowService {
    async fn start(&self, workflow_name: &str, input: Value) -> Result<Uuid, WorkflowError> {
        let id = Uuid::now_v7();
        sqlx::query(
            "INSERT INTO sdlf_workflow_runs (id, workflow_name, input, state) VALUES ($1, $2, $3, 'pending')",
        )
        .bind(id)
        .bind(workflow_name)
        .bind(sqlx::types::Json(&input))
        .execute(&self.pool)
        .await
        .map_err(query_error("start"))?;

        Ok(id)
    }
}

#[async_trait]
impl WorkflowRunSource for PgWorkflowService {
    async fn claim(&self, max: usize) -> Result<Vec<WorkflowRun>, WorkflowError> {
        let mut rows: Vec<RunRow> = sqlx::query_as(
            r#"
WITH pending AS (
    SELECT id
    FROM sdlf_workflow_runs
    WHERE state = 'pending'
    ORDER BY created_at ASC
    LIMIT $1
    FOR UPDATE SKIP LOCKED
)
UPDATE sdlf_workflow_runs
SET
    state = 'running',
    attempt = sdlf_workflow_runs.attempt + 1,
    started_at = NOW()
FROM pending
WHERE sdlf_workflow_runs.id = pending.id
RETURNING
    sdlf_workflow_runs.id,
    sdlf_workflow_runs.workflow_name,
    sdlf_workflow_runs.input,
    sdlf_workflow_runs.state,
    sdlf_workflow_runs.attempt,
    sdlf_workflow_runs.created_at,
    sdlf_workflow_runs.started_at
            "#,
        )
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("claim"))?;

        rows.sort_by_key(|row| row.created_at);
        Ok(rows.into_iter().map(RunRow::into_run).collect())
    }

    async fn finish(&self, id: Uuid, state: RunState) -> Result<(), WorkflowError> {
        let result = sqlx::query(
            "UPDATE sdlf_workflow_runs SET state = $2, finished_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(state.as_str())
        .execute(&self.pool)
        .await
        .map_err(query_error("finish"))?;

        if result.rows_affected() == 0 {
            return Err(WorkflowError::RunNotFound(id));
        }
        Ok(())
    }

    async fn reset_stalled(
        &self,
        timeout: Duration,
        max_attempts: i32,
    ) -> Result<u64, WorkflowError> {
        let oldest_valid_start = Utc::now() - timeout;
        let result = sqlx::query(
            r#"
WITH stalled AS (
    SELECT id FROM sdlf_workflow_runs
    WHERE state = 'running' AND COALESCE(started_at, $1) <= $1 AND attempt < $2
    FOR UPDATE SKIP LOCKED
)
UPDATE sdlf_workflow_runs
SET state = 'pending', started_at = NULL
FROM stalled
WHERE sdlf_workflow_runs.id = stalled.id
            "#,
        )
        .bind(oldest_valid_start)
        .bind(max_attempts)
        .execute(&self.pool)
        .await
        .map_err(query_error("reset_stalled"))?;

        Ok(result.rows_affected())
    }

    async fn fail_stalled(
        &self,
        timeout: Duration,
        max_attempts: i32,
    ) -> Result<Vec<WorkflowRun>, WorkflowError> {
        let oldest_valid_start = Utc::now() - timeout;
        let rows: Vec<RunRow> = sqlx::query_as(
            r#"
WITH stalled AS (
    SELECT id FROM sdlf_workflow_runs
    WHERE state = 'running' AND COALESCE(started_at, $1) <= $1 AND attempt >= $2
    FOR UPDATE SKIP LOCKED
)
UPDATE sdlf_workflow_runs
SET state = 'failed', finished_at = NOW()
FROM stalled
WHERE sdlf_workflow_runs.id = stalled.id
RETURNING
    sdlf_workflow_runs.id,
    sdlf_workflow_runs.workflow_name,
    sdlf_workflow_runs.input,
    sdlf_workflow_runs.state,
    sdlf_workflow_runs.attempt,
    sdlf_workflow_runs.created_at,
    sdlf_workflow_runs.started_at
            "#,
        )
        .bind(oldest_valid_start)
        .bind(max_attempts)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("fail_stalled"))?;

        Ok(rows.into_iter().map(RunRow::into_run).collect())
    }
}

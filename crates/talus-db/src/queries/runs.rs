//! Database query functions for the `runs` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Run, RunStatus};

/// Insert a new run row in `pending` status.
pub async fn insert_run(
    pool: &PgPool,
    pipeline_id: Uuid,
    parameters: &serde_json::Value,
    jobs_remaining: i32,
) -> Result<Run> {
    let run = sqlx::query_as::<_, Run>(
        "INSERT INTO runs (pipeline_id, parameters, jobs_remaining) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(pipeline_id)
    .bind(parameters)
    .bind(jobs_remaining)
    .fetch_one(pool)
    .await
    .context("failed to insert run")?;

    Ok(run)
}

/// Fetch a single run by ID.
pub async fn get_run(pool: &PgPool, id: Uuid) -> Result<Option<Run>> {
    let run = sqlx::query_as::<_, Run>("SELECT * FROM runs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch run")?;

    Ok(run)
}

/// List all runs for a pipeline, most recent first.
pub async fn list_runs_for_pipeline(pool: &PgPool, pipeline_id: Uuid) -> Result<Vec<Run>> {
    let runs = sqlx::query_as::<_, Run>(
        "SELECT * FROM runs WHERE pipeline_id = $1 ORDER BY created_at DESC",
    )
    .bind(pipeline_id)
    .fetch_all(pool)
    .await
    .context("failed to list runs for pipeline")?;

    Ok(runs)
}

/// Set a run's status, stamping `started_at`/`completed_at` when provided.
/// Used by the bootstrapper (pending -> running) and by the run-completion
/// accounting path (running -> success/failed/cancelled). Guarded so a run
/// already in a terminal state (success/failed/cancelled) cannot be
/// clobbered by a later, racing terminal-job notification -- e.g. a job's
/// success landing after a sibling has already dead-lettered the run.
pub async fn set_run_status(
    pool: &PgPool,
    run_id: Uuid,
    status: RunStatus,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE runs \
         SET status = $1, \
             started_at = COALESCE($2, started_at), \
             completed_at = COALESCE($3, completed_at) \
         WHERE id = $4 AND status NOT IN ('success', 'failed', 'cancelled')",
    )
    .bind(status)
    .bind(started_at)
    .bind(completed_at)
    .bind(run_id)
    .execute(pool)
    .await
    .context("failed to set run status")?;

    Ok(result.rows_affected())
}

/// Atomically decrement a run's `jobs_remaining` counter by one and return
/// the new value. Called once for every job that reaches a terminal state
/// (success or dead-lettered), per the run-completion accounting rule.
pub async fn decrement_jobs_remaining(pool: &PgPool, run_id: Uuid) -> Result<i32> {
    let row: (i32,) = sqlx::query_as(
        "UPDATE runs SET jobs_remaining = jobs_remaining - 1 WHERE id = $1 RETURNING jobs_remaining",
    )
    .bind(run_id)
    .fetch_one(pool)
    .await
    .context("failed to decrement jobs_remaining")?;

    Ok(row.0)
}

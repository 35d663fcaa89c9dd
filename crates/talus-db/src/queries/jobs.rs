//! Database query functions for the `jobs` and `job_dependencies` tables.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Job, JobStatus};

/// Insert a new job row in `pending` status.
pub async fn insert_job(pool: &PgPool, run_id: Uuid, task_id: &str) -> Result<Job> {
    let job = sqlx::query_as::<_, Job>(
        "INSERT INTO jobs (run_id, task_id) VALUES ($1, $2) RETURNING *",
    )
    .bind(run_id)
    .bind(task_id)
    .fetch_one(pool)
    .await
    .context("failed to insert job")?;

    Ok(job)
}

/// Fetch a single job by ID.
pub async fn get_job(pool: &PgPool, id: Uuid) -> Result<Option<Job>> {
    let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch job")?;

    Ok(job)
}

/// List all jobs belonging to a run.
pub async fn list_jobs_for_run(pool: &PgPool, run_id: Uuid) -> Result<Vec<Job>> {
    let jobs =
        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE run_id = $1 ORDER BY created_at ASC")
            .bind(run_id)
            .fetch_all(pool)
            .await
            .context("failed to list jobs for run")?;

    Ok(jobs)
}

/// Insert a dependency edge: `job_id` depends on `depends_on`.
///
/// Uses `ON CONFLICT DO NOTHING` so this is idempotent.
pub async fn insert_job_dependency(pool: &PgPool, job_id: Uuid, depends_on: Uuid) -> Result<()> {
    sqlx::query(
        "INSERT INTO job_dependencies (job_id, depends_on) VALUES ($1, $2) \
         ON CONFLICT DO NOTHING",
    )
    .bind(job_id)
    .bind(depends_on)
    .execute(pool)
    .await
    .context("failed to insert job dependency")?;

    Ok(())
}

/// Atomically transition a job from one status to another, using optimistic
/// locking: the UPDATE only applies if the row is still in `from`. Returns
/// the number of rows affected (0 means a lost race or a stale caller).
pub async fn transition_job_status(
    pool: &PgPool,
    job_id: Uuid,
    from: JobStatus,
    to: JobStatus,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE jobs \
         SET status = $1, \
             started_at = COALESCE($2, started_at), \
             completed_at = COALESCE($3, completed_at) \
         WHERE id = $4 AND status = $5",
    )
    .bind(to)
    .bind(started_at)
    .bind(completed_at)
    .bind(job_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition job status")?;

    Ok(result.rows_affected())
}

/// Record a job's successful completion, storing its result payload.
pub async fn complete_job_success(
    pool: &PgPool,
    job_id: Uuid,
    result: &serde_json::Value,
) -> Result<u64> {
    let outcome = sqlx::query(
        "UPDATE jobs \
         SET status = 'success', result = $1, completed_at = NOW() \
         WHERE id = $2 AND status = 'running'",
    )
    .bind(result)
    .bind(job_id)
    .execute(pool)
    .await
    .context("failed to record job success")?;

    Ok(outcome.rows_affected())
}

/// Move a job from `running` to `retrying`, recording the failure and
/// incrementing the attempt counter. The worker's own failure path is the
/// only caller that advances `attempt` -- janitor-induced re-queues do not.
pub async fn fail_job_for_retry(pool: &PgPool, job_id: Uuid, error: &str) -> Result<u64> {
    let outcome = sqlx::query(
        "UPDATE jobs \
         SET status = 'retrying', attempt = attempt + 1, error = $1 \
         WHERE id = $2 AND status = 'running'",
    )
    .bind(error)
    .bind(job_id)
    .execute(pool)
    .await
    .context("failed to mark job for retry")?;

    Ok(outcome.rows_affected())
}

/// Move a job from `retrying` to its terminal `failed` (dead-lettered) state.
pub async fn dead_letter_job(pool: &PgPool, job_id: Uuid, error: &str) -> Result<u64> {
    let outcome = sqlx::query(
        "UPDATE jobs \
         SET status = 'failed', error = $1, completed_at = NOW() \
         WHERE id = $2 AND status = 'retrying'",
    )
    .bind(error)
    .bind(job_id)
    .execute(pool)
    .await
    .context("failed to dead-letter job")?;

    Ok(outcome.rows_affected())
}

/// List every job currently in `running` status, across all runs.
///
/// Used by the janitor's zombie scan: for each, it checks whether the
/// broker's per-job lock key still exists.
pub async fn list_running_jobs(pool: &PgPool) -> Result<Vec<Job>> {
    let jobs = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE status = 'running'")
        .fetch_all(pool)
        .await
        .context("failed to list running jobs")?;

    Ok(jobs)
}

/// Reset a zombie job (lease expired, lock key gone) from `running` back to
/// `queued`. Does not touch `attempt` -- a janitor reclaim is a free retry.
pub async fn reclaim_zombie_job(pool: &PgPool, job_id: Uuid) -> Result<u64> {
    let outcome = sqlx::query(
        "UPDATE jobs SET status = 'queued', started_at = NULL WHERE id = $1 AND status = 'running'",
    )
    .bind(job_id)
    .execute(pool)
    .await
    .context("failed to reclaim zombie job")?;

    Ok(outcome.rows_affected())
}

/// Status counts for a run's jobs.
#[derive(Debug, Clone, Default)]
pub struct RunProgress {
    pub pending: i64,
    pub queued: i64,
    pub running: i64,
    pub success: i64,
    pub retrying: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub total: i64,
}

/// Get a summary of job counts by status for a given run.
pub async fn get_run_progress(pool: &PgPool, run_id: Uuid) -> Result<RunProgress> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status::text, COUNT(*) as cnt FROM jobs WHERE run_id = $1 GROUP BY status",
    )
    .bind(run_id)
    .fetch_all(pool)
    .await
    .context("failed to get run progress")?;

    let mut progress = RunProgress::default();
    for (status, count) in &rows {
        match status.as_str() {
            "pending" => progress.pending = *count,
            "queued" => progress.queued = *count,
            "running" => progress.running = *count,
            "success" => progress.success = *count,
            "retrying" => progress.retrying = *count,
            "failed" => progress.failed = *count,
            "cancelled" => progress.cancelled = *count,
            _ => {}
        }
        progress.total += count;
    }
    Ok(progress)
}

//! Database query functions for the `task_logs` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::TaskLog;

/// Append a log line for a job's task body.
pub async fn insert_log(
    pool: &PgPool,
    job_id: Uuid,
    level: &str,
    message: &str,
    metadata: Option<&serde_json::Value>,
) -> Result<TaskLog> {
    let log = sqlx::query_as::<_, TaskLog>(
        "INSERT INTO task_logs (job_id, level, message, metadata) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(job_id)
    .bind(level)
    .bind(message)
    .bind(metadata)
    .fetch_one(pool)
    .await
    .context("failed to insert task log")?;

    Ok(log)
}

/// List all log lines for a job, oldest first.
pub async fn list_logs_for_job(pool: &PgPool, job_id: Uuid) -> Result<Vec<TaskLog>> {
    let logs = sqlx::query_as::<_, TaskLog>(
        "SELECT * FROM task_logs WHERE job_id = $1 ORDER BY recorded_at ASC",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
    .context("failed to list logs for job")?;

    Ok(logs)
}

//! Convenience dispatch helpers that wrap [`super::JobStateMachine`]
//! transitions with semantic names.

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

use talus_db::models::JobStatus;

use super::JobStateMachine;

/// Mark a job as queued: transition `pending -> queued`.
pub async fn queue_job(pool: &PgPool, job_id: Uuid) -> Result<()> {
    JobStateMachine::transition(pool, job_id, JobStatus::Pending, JobStatus::Queued).await
}

/// Start a job: transition `queued -> running`. Sets `started_at`.
pub async fn start_job(pool: &PgPool, job_id: Uuid) -> Result<()> {
    JobStateMachine::transition(pool, job_id, JobStatus::Queued, JobStatus::Running).await
}

/// Promote a job whose backoff delay has elapsed: transition
/// `retrying -> queued`.
pub async fn promote_job(pool: &PgPool, job_id: Uuid) -> Result<()> {
    JobStateMachine::transition(pool, job_id, JobStatus::Retrying, JobStatus::Queued).await
}

/// Cancel a job from any non-terminal state.
pub async fn cancel_job(pool: &PgPool, job_id: Uuid, from: JobStatus) -> Result<()> {
    JobStateMachine::transition(pool, job_id, from, JobStatus::Cancelled).await
}

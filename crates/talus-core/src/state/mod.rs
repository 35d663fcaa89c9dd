//! Job state machine transitions.
//!
//! Validates and executes state transitions for jobs, enforcing the
//! allowed transition graph, optimistic locking, and timestamp management.
//! The retry/backoff and dead-letter decisions themselves live in
//! [`crate::worker`]; this module only enforces that the resulting
//! transition is a legal edge in the graph below.

pub mod dispatch;
pub mod queries;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use talus_db::models::JobStatus;
use talus_db::queries::jobs as db;

/// The job state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// pending   -> queued
/// queued    -> running
/// running   -> success    (terminal)
/// running   -> retrying   (any task-body failure; attempt is incremented here)
/// retrying  -> failed     (terminal: attempt exceeded max_retry, dead-lettered)
/// retrying  -> queued     (janitor promotes once the due time elapses)
/// pending, queued, running, retrying -> cancelled  (administrative, terminal)
/// ```
///
/// Every failure transitions to `retrying` first, even the attempt that
/// exhausts the retry budget; the worker immediately follows up with
/// `retrying -> failed` in the same call when `attempt > max_retry`.
pub struct JobStateMachine;

impl JobStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge
    /// in the state graph.
    pub fn is_valid_transition(from: JobStatus, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (from, to),
            (Pending, Queued)
                | (Queued, Running)
                | (Running, Success)
                | (Running, Retrying)
                | (Retrying, Failed)
                | (Retrying, Queued)
                | (Pending, Cancelled)
                | (Queued, Cancelled)
                | (Running, Cancelled)
                | (Retrying, Cancelled)
        )
    }

    /// Execute a state transition with optimistic locking.
    ///
    /// - Validates the transition is legal.
    /// - Sets `started_at` when transitioning `queued -> running`.
    /// - Sets `completed_at` when transitioning to a terminal status
    ///   (`success`, `failed`, `cancelled`).
    ///
    /// Returns an error if the transition is not a legal edge, or if the
    /// current status in the database does not match `from` (optimistic
    /// lock failure / lost race).
    pub async fn transition(pool: &PgPool, job_id: Uuid, from: JobStatus, to: JobStatus) -> Result<()> {
        if !Self::is_valid_transition(from, to) {
            bail!(
                "invalid job state transition: {} -> {} for job {}",
                from,
                to,
                job_id
            );
        }

        let started_at = if from == JobStatus::Queued && to == JobStatus::Running {
            Some(Utc::now())
        } else {
            None
        };

        let completed_at = match to {
            JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled => Some(Utc::now()),
            _ => None,
        };

        let rows = db::transition_job_status(pool, job_id, from, to, started_at, completed_at)
            .await
            .with_context(|| {
                format!("failed to transition job {} from {} to {}", job_id, from, to)
            })?;

        if rows == 0 {
            let job = db::get_job(pool, job_id).await?;
            match job {
                None => bail!("job {} not found", job_id),
                Some(j) => bail!(
                    "optimistic lock failed: job {} has status {}, expected {}",
                    job_id,
                    j.status,
                    from
                ),
            }
        }

        Ok(())
    }

    /// Validate that all dependencies of a job are in `success` status.
    pub async fn check_dependencies(pool: &PgPool, job_id: Uuid) -> Result<()> {
        let job = db::get_job(pool, job_id)
            .await?
            .with_context(|| format!("job {} not found", job_id))?;

        // Dependency edges live in job_dependencies; reuse its accessor
        // through talus_db directly since this is a read-only cross-check.
        let deps: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT depends_on FROM job_dependencies WHERE job_id = $1",
        )
        .bind(job.id)
        .fetch_all(pool)
        .await
        .context("failed to fetch job dependencies")?;

        for (dep_id,) in deps {
            let dep = db::get_job(pool, dep_id)
                .await?
                .with_context(|| format!("dependency job {} not found", dep_id))?;

            if dep.status != JobStatus::Success {
                bail!(
                    "dependency {} for job {} has status {}, expected success",
                    dep_id,
                    job_id,
                    dep.status
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use JobStatus::*;

    #[test]
    fn valid_transitions_accepted() {
        assert!(JobStateMachine::is_valid_transition(Pending, Queued));
        assert!(JobStateMachine::is_valid_transition(Queued, Running));
        assert!(JobStateMachine::is_valid_transition(Running, Success));
        assert!(JobStateMachine::is_valid_transition(Running, Retrying));
        assert!(JobStateMachine::is_valid_transition(Retrying, Failed));
        assert!(JobStateMachine::is_valid_transition(Retrying, Queued));
    }

    #[test]
    fn cancellation_allowed_from_non_terminal_states() {
        assert!(JobStateMachine::is_valid_transition(Pending, Cancelled));
        assert!(JobStateMachine::is_valid_transition(Queued, Cancelled));
        assert!(JobStateMachine::is_valid_transition(Running, Cancelled));
        assert!(JobStateMachine::is_valid_transition(Retrying, Cancelled));
    }

    #[test]
    fn terminal_states_have_no_outgoing_transitions() {
        for to in [Pending, Queued, Running, Success, Retrying, Failed, Cancelled] {
            assert!(!JobStateMachine::is_valid_transition(Success, to));
            assert!(!JobStateMachine::is_valid_transition(Failed, to));
            assert!(!JobStateMachine::is_valid_transition(Cancelled, to));
        }
    }

    #[test]
    fn skips_are_rejected() {
        assert!(!JobStateMachine::is_valid_transition(Pending, Running));
        assert!(!JobStateMachine::is_valid_transition(Queued, Success));
        assert!(!JobStateMachine::is_valid_transition(Retrying, Running));
        assert!(!JobStateMachine::is_valid_transition(Running, Failed));
    }
}

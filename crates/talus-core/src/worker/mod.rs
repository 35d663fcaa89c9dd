//! Worker loop: pull a ready job, hold a lease while it runs, execute its
//! task body, and route the outcome to success, retry, or the dead letter
//! queue, over the [`JobBroker`] trait and an opaque [`TaskExecutor`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use talus_db::queries::{jobs as jobs_db, pipelines as pipelines_db, runs as runs_db, task_logs as task_logs_db};

use crate::broker::{BrokerConfig, JobBroker};
use crate::dag::PipelineDefinition;
use crate::state::dispatch;

/// Executes the opaque body behind a task's `function` name. The worker
/// loop knows nothing about what a task actually does; it only knows how
/// to move a job through the lease/retry/dead-letter machinery around
/// whatever this returns.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run `function` for `job_id` with the run's `parameters`, returning
    /// the JSON result to persist on success, or an error message to
    /// persist (and possibly retry) on failure.
    async fn execute(
        &self,
        function: &str,
        job_id: Uuid,
        parameters: &serde_json::Value,
    ) -> Result<serde_json::Value, String>;
}

/// Drives the pull/lease/execute/cleanup loop until `shutdown` is
/// cancelled.
pub struct Worker {
    pool: PgPool,
    broker: Arc<dyn JobBroker>,
    executor: Arc<dyn TaskExecutor>,
    config: BrokerConfig,
    worker_id: String,
}

impl Worker {
    pub fn new(
        pool: PgPool,
        broker: Arc<dyn JobBroker>,
        executor: Arc<dyn TaskExecutor>,
        config: BrokerConfig,
        worker_id: String,
    ) -> Self {
        Self { pool, broker, executor, config, worker_id }
    }

    /// Run until `shutdown` is cancelled. Each iteration processes exactly
    /// one job; errors processing a single job are logged and swallowed so
    /// one bad job does not kill the loop.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            let job_id = tokio::select! {
                popped = self.broker.pop_ready_blocking() => popped?,
                _ = shutdown.cancelled() => return Ok(()),
            };

            if let Err(err) = self.process_job(job_id).await {
                warn!(job_id = %job_id, error = %err, "job processing failed");
            }
        }
    }

    /// Process a single job end to end: lease, start, execute, route the
    /// outcome, and always release the lease on the way out.
    async fn process_job(&self, job_id: Uuid) -> Result<()> {
        let acquired = self
            .broker
            .acquire_lease(job_id, &self.worker_id, self.config.lease_ttl)
            .await
            .context("failed to acquire lease")?;

        if !acquired {
            // Another worker already owns this job; drop it silently.
            // It was already removed from the ready list by pop.
            return Ok(());
        }

        let heartbeat_stop = CancellationToken::new();
        let heartbeat_handle = self.spawn_heartbeat(job_id, heartbeat_stop.clone());

        let outcome = self.run_leased_job(job_id).await;

        heartbeat_stop.cancel();
        let _ = heartbeat_handle.await;

        // Cleanup always runs, regardless of outcome.
        if let Err(err) = self.broker.release_lease(job_id).await {
            warn!(job_id = %job_id, error = %err, "failed to release lease");
        }

        outcome
    }

    fn spawn_heartbeat(
        &self,
        job_id: Uuid,
        stop: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let broker = Arc::clone(&self.broker);
        let interval = self.config.heartbeat_interval;
        let ttl = self.config.lease_ttl;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Err(err) = broker.renew_lease(job_id, ttl).await {
                            warn!(job_id = %job_id, error = %err, "failed to renew lease");
                        }
                    }
                    _ = stop.cancelled() => return,
                }
            }
        })
    }

    /// The part of job processing that happens while the lease is held:
    /// start, execute, and route to success/retry/dead-letter.
    async fn run_leased_job(&self, job_id: Uuid) -> Result<()> {
        let job = jobs_db::get_job(&self.pool, job_id)
            .await?
            .with_context(|| format!("job {} not found", job_id))?;

        let run = runs_db::get_run(&self.pool, job.run_id)
            .await?
            .with_context(|| format!("run {} not found", job.run_id))?;

        // Cancellation is observed only at the next pick, never mid-task:
        // a job whose run was cancelled after it was queued is simply
        // skipped here, left QUEUED, rather than claimed.
        if run.status == talus_db::models::RunStatus::Cancelled {
            info!(job_id = %job_id, run_id = %job.run_id, "skipping job, run is cancelled");
            return Ok(());
        }

        let pipeline = pipelines_db::get_pipeline(&self.pool, run.pipeline_id)
            .await?
            .with_context(|| format!("pipeline {} not found", run.pipeline_id))?;

        let definition: PipelineDefinition = serde_json::from_value(pipeline.definition)
            .context("stored pipeline definition failed to deserialize")?;
        let task = definition
            .get(&job.task_id)
            .with_context(|| format!("task {} missing from pipeline definition", job.task_id))?;

        dispatch::start_job(&self.pool, job_id)
            .await
            .context("failed to start job")?;

        info!(job_id = %job_id, function = %task.function, "executing job");
        self.log(job_id, "info", &format!("executing {}", task.function)).await;

        match self.executor.execute(&task.function, job_id, &run.parameters).await {
            Ok(result) => self.handle_success(job_id, job.run_id, result).await,
            Err(message) => self.handle_failure(job_id, job.run_id, job.attempt, &message).await,
        }
    }

    async fn handle_success(&self, job_id: Uuid, run_id: Uuid, result: serde_json::Value) -> Result<()> {
        let rows = jobs_db::complete_job_success(&self.pool, job_id, &result)
            .await
            .context("failed to record job success")?;
        if rows == 0 {
            anyhow::bail!("job {} was not in running status when it completed", job_id);
        }
        self.log(job_id, "info", "job succeeded").await;

        // `complete` is the sole pusher onto the ready list -- its script
        // already RPUSHes every child whose counter just hit zero. Only the
        // store-side pending -> queued transition still needs doing here.
        let newly_ready = self.broker.complete(run_id, job_id).await.context("broker complete failed")?;
        for child_id in newly_ready {
            dispatch::queue_job(&self.pool, child_id)
                .await
                .context("failed to queue newly-ready job")?;
        }

        self.finish_terminal_job(run_id, false).await
    }

    async fn handle_failure(
        &self,
        job_id: Uuid,
        run_id: Uuid,
        attempt_before: i32,
        message: &str,
    ) -> Result<()> {
        jobs_db::fail_job_for_retry(&self.pool, job_id, message)
            .await
            .context("failed to record job failure")?;
        self.log(job_id, "error", message).await;

        let attempt_after = attempt_before + 1;
        if attempt_after > self.config.max_retry as i32 {
            jobs_db::dead_letter_job(&self.pool, job_id, message)
                .await
                .context("failed to dead-letter job")?;
            self.broker.dead_letter(job_id).await.context("broker dead_letter failed")?;
            warn!(job_id = %job_id, attempt = attempt_after, "job dead-lettered");
            self.log(job_id, "error", "retry budget exhausted, dead-lettered").await;
            return self.finish_terminal_job(run_id, true).await;
        }

        // fail_job_for_retry above already performed the running -> retrying
        // transition; no further state-machine call is needed here.
        let delay = self.config.base_delay_seconds * 2u64.pow((attempt_after - 1).max(0) as u32);
        let due = Utc::now().timestamp() + delay as i64;
        self.broker
            .schedule_retry(job_id, due)
            .await
            .context("failed to schedule retry")?;

        Ok(())
    }

    /// Append a task log line, best-effort: a log write failure must never
    /// fail the job it is describing, so errors are swallowed after a
    /// warning.
    async fn log(&self, job_id: Uuid, level: &str, message: &str) {
        if let Err(err) = task_logs_db::insert_log(&self.pool, job_id, level, message, None).await {
            warn!(job_id = %job_id, error = %err, "failed to write task log");
        }
    }

    /// Account for a job reaching a terminal state (success or
    /// dead-lettered failure): decrement the run's jobs-remaining counter
    /// on every terminal transition (Open Question (c): the counter tracks
    /// both outcomes so it never goes stale on a failing run), and decide
    /// run-level completion.
    ///
    /// A dead-letter fails the run immediately, independent of how many
    /// siblings are still outstanding -- per spec §7, "a run that contains
    /// a dead-lettered job becomes FAILED". A success only finalizes the
    /// run once jobs-remaining hits zero, and only to SUCCESS: by the time
    /// remaining reaches zero on a run with no dead-lettered job, every job
    /// must have succeeded.
    async fn finish_terminal_job(&self, run_id: Uuid, is_failure: bool) -> Result<()> {
        let remaining = self
            .broker
            .decr_jobs_remaining(run_id)
            .await
            .context("failed to decrement jobs remaining")?;

        // Keep the persisted counter (shown by `talus pipeline show` /
        // `talus run create`) in step with the broker's.
        runs_db::decrement_jobs_remaining(&self.pool, run_id)
            .await
            .context("failed to decrement persisted jobs_remaining")?;

        if is_failure {
            runs_db::set_run_status(
                &self.pool,
                run_id,
                talus_db::models::RunStatus::Failed,
                None,
                Some(Utc::now()),
            )
            .await
            .context("failed to mark run failed")?;
        } else if remaining <= 0 {
            runs_db::set_run_status(
                &self.pool,
                run_id,
                talus_db::models::RunStatus::Success,
                None,
                Some(Utc::now()),
            )
            .await
            .context("failed to finalize run status")?;
        }

        Ok(())
    }
}

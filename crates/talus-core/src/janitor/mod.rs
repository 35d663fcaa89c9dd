//! Reconciliation daemon: reclaims jobs whose lease has silently expired
//! (worker crashed or was killed) and promotes delayed retries whose
//! backoff has elapsed, on a periodic tick over the [`JobBroker`] trait.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::JobBroker;
use crate::state::dispatch;

pub struct Janitor {
    pool: PgPool,
    broker: Arc<dyn JobBroker>,
    tick_interval: Duration,
}

impl Janitor {
    pub fn new(pool: PgPool, broker: Arc<dyn JobBroker>, tick_interval: Duration) -> Self {
        Self { pool, broker, tick_interval }
    }

    /// Run the reconciliation loop until `shutdown` is cancelled, ticking
    /// every `tick_interval`.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.tick_interval) => {}
                _ = shutdown.cancelled() => return Ok(()),
            }

            if let Err(err) = self.tick().await {
                warn!(error = %err, "janitor tick failed");
            }
        }
    }

    /// Run one reconciliation pass: reclaim zombies, then promote due
    /// retries. Order does not matter -- the two scans touch disjoint job
    /// sets (`running` vs the delayed set).
    pub async fn tick(&self) -> Result<()> {
        self.reclaim_zombies().await?;
        self.promote_delayed().await?;
        Ok(())
    }

    /// Every job the store still thinks is `running` but whose broker
    /// lease key has expired or was never renewed (the worker that held
    /// it died) goes back to `queued` and is re-pushed to the ready list.
    /// The attempt counter is untouched: a janitor reclaim is a free retry,
    /// not a charge against the job's retry budget.
    async fn reclaim_zombies(&self) -> Result<()> {
        let running = talus_db::queries::jobs::list_running_jobs(&self.pool)
            .await
            .context("failed to list running jobs")?;

        for job in running {
            let alive = self
                .broker
                .lease_exists(job.id)
                .await
                .context("failed to check lease existence")?;

            if alive {
                continue;
            }

            let rows = talus_db::queries::jobs::reclaim_zombie_job(&self.pool, job.id)
                .await
                .context("failed to reclaim zombie job")?;
            if rows == 0 {
                // Lost the race with a worker that finished in the gap
                // between the list and the reclaim; leave it alone.
                continue;
            }

            self.broker
                .push_ready(job.id)
                .await
                .context("failed to re-push reclaimed job")?;
            info!(job_id = %job.id, "reclaimed zombie job");
        }

        Ok(())
    }

    /// Move every delayed-set entry whose due time has passed into the
    /// ready list, and mirror the promotion in the store
    /// (`retrying -> queued`).
    async fn promote_delayed(&self) -> Result<()> {
        let now = Utc::now().timestamp();
        let promoted = self
            .broker
            .promote_due(now)
            .await
            .context("failed to promote due retries")?;

        for job_id in promoted {
            dispatch::promote_job(&self.pool, job_id)
                .await
                .context("failed to promote retrying job to queued")?;
            info!(job_id = %job_id, "promoted delayed retry");
        }

        Ok(())
    }
}

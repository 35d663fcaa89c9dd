//! Query helpers for run progress tracking.
//!
//! These re-export and wrap the lower-level DB queries from
//! [`talus_db::queries::jobs`]/[`talus_db::queries::runs`] for use by the
//! orchestration layer (worker, janitor, status reporting).

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

pub use talus_db::queries::jobs::RunProgress;

/// Get a progress summary (counts by status) for a run's jobs.
pub async fn get_run_progress(pool: &PgPool, run_id: Uuid) -> Result<RunProgress> {
    talus_db::queries::jobs::get_run_progress(pool, run_id).await
}

/// Check whether every job in a run has reached a terminal status.
pub async fn is_run_complete(pool: &PgPool, run_id: Uuid) -> Result<bool> {
    let progress = get_run_progress(pool, run_id).await?;
    let terminal = progress.success + progress.failed + progress.cancelled;
    Ok(terminal == progress.total)
}

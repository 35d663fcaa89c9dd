//! `talus status` command: show run progress and per-job status.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use talus_core::state::queries as state_queries;
use talus_db::queries::jobs as jobs_db;
use talus_db::queries::pipelines as pipelines_db;
use talus_db::queries::runs as runs_db;

/// Run the status command.
///
/// When `run_id_str` is `Some`, shows detailed status for that run. When
/// `None`, lists every pipeline's runs with a progress summary.
pub async fn run_status(pool: &PgPool, run_id_str: Option<&str>) -> Result<()> {
    match run_id_str {
        Some(id_str) => run_single_status(pool, id_str).await,
        None => run_fleet_status(pool).await,
    }
}

async fn run_single_status(pool: &PgPool, run_id_str: &str) -> Result<()> {
    let run_id =
        Uuid::parse_str(run_id_str).with_context(|| format!("invalid run ID: {run_id_str}"))?;

    let run = runs_db::get_run(pool, run_id)
        .await?
        .with_context(|| format!("run {run_id} not found"))?;

    let pipeline = pipelines_db::get_pipeline(pool, run.pipeline_id)
        .await?
        .with_context(|| format!("pipeline {} not found", run.pipeline_id))?;

    println!("Run: {} (pipeline {})", run.id, pipeline.name);
    println!("Status: {}", run.status);
    if let Some(started_at) = run.started_at {
        println!("Started: {}", started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(completed_at) = run.completed_at {
        println!("Completed: {}", completed_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!();

    let progress = state_queries::get_run_progress(pool, run_id).await?;
    println!(
        "Progress: {}/{} success",
        progress.success, progress.total
    );
    println!(
        "  pending={} queued={} running={} success={} retrying={} failed={} cancelled={}",
        progress.pending,
        progress.queued,
        progress.running,
        progress.success,
        progress.retrying,
        progress.failed,
        progress.cancelled,
    );
    println!();

    let jobs = jobs_db::list_jobs_for_run(pool, run_id).await?;
    println!("Jobs:");
    for job in &jobs {
        let status_icon = match job.status.to_string().as_str() {
            "pending" => ".",
            "queued" => ">",
            "running" => "*",
            "success" => "+",
            "retrying" => "~",
            "failed" => "!",
            "cancelled" => "x",
            _ => " ",
        };
        println!(
            "  [{}] {} (attempt {}, {})",
            status_icon, job.task_id, job.attempt, job.status
        );
    }

    Ok(())
}

async fn run_fleet_status(pool: &PgPool) -> Result<()> {
    let pipelines = pipelines_db::list_pipelines(pool).await?;

    if pipelines.is_empty() {
        println!("No pipelines found.");
        return Ok(());
    }

    println!(
        "{:<38} {:<30} {:<12} {:>10}",
        "RUN ID", "PIPELINE", "STATUS", "PROGRESS"
    );
    println!("{}", "-".repeat(92));

    for pipeline in &pipelines {
        let runs = runs_db::list_runs_for_pipeline(pool, pipeline.id).await?;
        for run in &runs {
            let progress = state_queries::get_run_progress(pool, run.id).await?;
            let progress_str = if progress.total > 0 {
                format!("{}/{}", progress.success, progress.total)
            } else {
                "0/0".to_string()
            };
            println!(
                "{:<38} {:<30} {:<12} {:>10}",
                run.id, pipeline.name, run.status, progress_str
            );
        }
    }

    Ok(())
}

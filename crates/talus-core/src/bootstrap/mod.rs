//! Run bootstrapper: given a validated pipeline definition and a run-create
//! request, atomically produce a run whose state is immediately usable by
//! workers.

use std::collections::HashMap;

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use talus_db::models::{Pipeline, Run, RunStatus};
use talus_db::queries::{jobs as jobs_db, runs as runs_db};

use crate::broker::JobBroker;
use crate::dag::{self, PipelineDefinition};

/// Create and launch a run of `pipeline` with the given `parameters`.
///
/// Ordering matters (spec §4.2): job identifiers must exist in the store
/// before any broker key references them, so step 1 persists run + jobs
/// before any broker write; step 4 (marking the run RUNNING) is the last
/// write, so a crash between steps leaves state the janitor can reconcile.
///
/// 1. Persist the run (PENDING) and one job per task (PENDING).
/// 2. In a single broker pipelined transaction, seed `jobs_count`,
///    `deps_count`, and `reverse_graph`.
/// 3. Queue every root job (no dependencies): store status QUEUED, pushed
///    to the broker's ready list.
/// 4. Set run status RUNNING.
pub async fn launch_run(
    pool: &PgPool,
    broker: &dyn JobBroker,
    pipeline: &Pipeline,
    parameters: serde_json::Value,
) -> Result<Run> {
    let definition: PipelineDefinition = serde_json::from_value(pipeline.definition.clone())
        .context("stored pipeline definition failed to deserialize")?;

    // Already validated at submission time, but re-validating here is
    // cheap and protects against a pipeline row that was written before a
    // validator change.
    dag::validate(&definition).context("stored pipeline definition is invalid")?;

    // Step 1: persist run + jobs, all PENDING.
    let run = runs_db::insert_run(pool, pipeline.id, &parameters, definition.len() as i32)
        .await
        .context("failed to insert run")?;

    let mut job_ids: HashMap<String, Uuid> = HashMap::with_capacity(definition.len());
    for task_id in definition.keys() {
        let job = jobs_db::insert_job(pool, run.id, task_id)
            .await
            .context("failed to insert job")?;
        job_ids.insert(task_id.clone(), job.id);
    }

    for (task_id, spec) in &definition {
        let job_id = job_ids[task_id];
        for dep_task_id in &spec.dependencies {
            let dep_job_id = job_ids[dep_task_id];
            jobs_db::insert_job_dependency(pool, job_id, dep_job_id)
                .await
                .context("failed to insert job dependency")?;
        }
    }

    // Step 2: seed broker state in one pipelined round trip.
    let deps_count: HashMap<Uuid, i64> = definition
        .iter()
        .map(|(task_id, spec)| (job_ids[task_id], spec.dependencies.len() as i64))
        .collect();

    let reverse_graph: HashMap<Uuid, Vec<Uuid>> = dag::reverse_graph(&definition)
        .into_iter()
        .map(|(task_id, children)| {
            let job_id = job_ids[&task_id];
            let child_job_ids = children.into_iter().map(|c| job_ids[&c]).collect();
            (job_id, child_job_ids)
        })
        .collect();

    broker
        .seed_run(run.id, definition.len() as i64, &deps_count, &reverse_graph)
        .await
        .context("failed to seed broker state for run")?;

    // Step 3: queue root jobs.
    for task_id in dag::roots(&definition) {
        let job_id = job_ids[&task_id];
        jobs_db::transition_job_status(
            pool,
            job_id,
            talus_db::models::JobStatus::Pending,
            talus_db::models::JobStatus::Queued,
            None,
            None,
        )
        .await
        .context("failed to queue root job")?;
        broker
            .push_ready(job_id)
            .await
            .context("failed to push root job to ready queue")?;
    }

    // Step 4: mark the run RUNNING -- the last write.
    runs_db::set_run_status(pool, run.id, RunStatus::Running, Some(chrono::Utc::now()), None)
        .await
        .context("failed to mark run RUNNING")?;

    runs_db::get_run(pool, run.id)
        .await?
        .context("run disappeared immediately after bootstrap")
}

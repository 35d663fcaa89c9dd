//! Integration tests for run bootstrapping: persisted state, seeded broker
//! counters, and root queuing, exercised against a real PostgreSQL database
//! and an in-memory broker.

use std::collections::BTreeMap;

use talus_core::bootstrap::launch_run;
use talus_core::dag::{PipelineDefinition, TaskSpec};
use talus_db::models::{JobStatus, RunStatus};
use talus_db::queries::{jobs as jobs_db, pipelines as pipelines_db};
use talus_test_utils::{create_test_db, drop_test_db, FakeBroker};

fn task(function: &str, dependencies: &[&str]) -> TaskSpec {
    TaskSpec {
        function: function.to_string(),
        dependencies: dependencies.iter().map(|s| s.to_string()).collect(),
    }
}

fn linear_definition() -> PipelineDefinition {
    let mut def = BTreeMap::new();
    def.insert("a".to_string(), task("noop", &[]));
    def.insert("b".to_string(), task("noop", &["a"]));
    def.insert("c".to_string(), task("noop", &["b"]));
    def
}

fn diamond_definition() -> PipelineDefinition {
    let mut def = BTreeMap::new();
    def.insert("a".to_string(), task("noop", &[]));
    def.insert("b".to_string(), task("noop", &["a"]));
    def.insert("c".to_string(), task("noop", &["a"]));
    def.insert("d".to_string(), task("noop", &["b", "c"]));
    def
}

#[tokio::test]
async fn linear_pipeline_queues_only_the_root() {
    let (pool, db_name) = create_test_db().await;
    let broker = FakeBroker::new();

    let definition = linear_definition();
    let definition_json = serde_json::to_value(&definition).unwrap();
    let pipeline = pipelines_db::insert_pipeline(&pool, "linear-3", &definition_json)
        .await
        .unwrap();

    let run = launch_run(&pool, &broker, &pipeline, serde_json::json!({}))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.jobs_remaining, 3);

    let jobs = jobs_db::list_jobs_for_run(&pool, run.id).await.unwrap();
    assert_eq!(jobs.len(), 3);

    let job_a = jobs.iter().find(|j| j.task_id == "a").unwrap();
    let job_b = jobs.iter().find(|j| j.task_id == "b").unwrap();
    let job_c = jobs.iter().find(|j| j.task_id == "c").unwrap();
    assert_eq!(job_a.status, JobStatus::Queued);
    assert_eq!(job_b.status, JobStatus::Pending);
    assert_eq!(job_c.status, JobStatus::Pending);

    let popped = broker.pop_ready_blocking().await.unwrap();
    assert_eq!(popped, job_a.id);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn diamond_pipeline_pushes_sink_exactly_once() {
    let (pool, db_name) = create_test_db().await;
    let broker = FakeBroker::new();

    let definition = diamond_definition();
    let definition_json = serde_json::to_value(&definition).unwrap();
    let pipeline = pipelines_db::insert_pipeline(&pool, "diamond", &definition_json)
        .await
        .unwrap();

    let run = launch_run(&pool, &broker, &pipeline, serde_json::json!({}))
        .await
        .unwrap();

    let jobs = jobs_db::list_jobs_for_run(&pool, run.id).await.unwrap();
    let job_a = jobs.iter().find(|j| j.task_id == "a").unwrap();
    let job_b = jobs.iter().find(|j| j.task_id == "b").unwrap();
    let job_c = jobs.iter().find(|j| j.task_id == "c").unwrap();
    let job_d = jobs.iter().find(|j| j.task_id == "d").unwrap();

    // Only the root is queued; b, c, d wait on their dependency counters.
    assert_eq!(job_a.status, JobStatus::Queued);
    assert_eq!(job_b.status, JobStatus::Pending);
    assert_eq!(job_c.status, JobStatus::Pending);
    assert_eq!(job_d.status, JobStatus::Pending);

    // Completing a pushes both b and c ready, neither touches d yet.
    let newly_ready = broker.complete(run.id, job_a.id).await.unwrap();
    assert_eq!(newly_ready.len(), 2);
    assert!(newly_ready.contains(&job_b.id));
    assert!(newly_ready.contains(&job_c.id));

    // d has two dependencies; completing only one of them must not push it.
    let after_b = broker.complete(run.id, job_b.id).await.unwrap();
    assert!(after_b.is_empty());

    // Completing the second dependency pushes d exactly once.
    let after_c = broker.complete(run.id, job_c.id).await.unwrap();
    assert_eq!(after_c, vec![job_d.id]);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn bootstrap_rejects_a_stored_cycle() {
    // A pipeline row should never contain a cycle (submission validates
    // first), but launch_run re-validates defensively; simulate a row
    // that slipped through by writing raw JSON directly.
    let (pool, db_name) = create_test_db().await;
    let broker = FakeBroker::new();

    let cyclic = serde_json::json!({
        "a": {"function": "noop", "dependencies": ["b"]},
        "b": {"function": "noop", "dependencies": ["a"]},
    });
    let pipeline = pipelines_db::insert_pipeline(&pool, "cyclic", &cyclic).await.unwrap();

    let result = launch_run(&pool, &broker, &pipeline, serde_json::json!({})).await;
    assert!(result.is_err());

    pool.close().await;
    drop_test_db(&db_name).await;
}

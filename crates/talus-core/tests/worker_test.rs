//! Integration tests for the worker loop: success, retry-then-succeed, and
//! dead-letter, driven against a real PostgreSQL database and an in-memory
//! broker so attempt timing is deterministic.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use talus_core::bootstrap::launch_run;
use talus_core::broker::BrokerConfig;
use talus_core::dag::{PipelineDefinition, TaskSpec};
use talus_core::worker::{TaskExecutor, Worker};
use talus_db::models::{JobStatus, RunStatus};
use talus_db::queries::{jobs as jobs_db, pipelines as pipelines_db, runs as runs_db};
use talus_test_utils::{create_test_db, drop_test_db, FakeBroker};

fn single_task_definition() -> PipelineDefinition {
    let mut def = BTreeMap::new();
    def.insert(
        "only".to_string(),
        TaskSpec { function: "work".to_string(), dependencies: vec![] },
    );
    def
}

/// `{a:[], b:[a], c:[b]}` -- spec §8's Linear-3 scenario.
fn linear_three_definition() -> PipelineDefinition {
    let mut def = BTreeMap::new();
    def.insert("a".to_string(), TaskSpec { function: "work".to_string(), dependencies: vec![] });
    def.insert(
        "b".to_string(),
        TaskSpec { function: "work".to_string(), dependencies: vec!["a".to_string()] },
    );
    def.insert(
        "c".to_string(),
        TaskSpec { function: "work".to_string(), dependencies: vec!["b".to_string()] },
    );
    def
}

/// `{a:[], b:[a], c:[a], d:[b,c]}` -- spec §8's Diamond scenario.
fn diamond_definition() -> PipelineDefinition {
    let mut def = BTreeMap::new();
    def.insert("a".to_string(), TaskSpec { function: "work".to_string(), dependencies: vec![] });
    def.insert(
        "b".to_string(),
        TaskSpec { function: "work".to_string(), dependencies: vec!["a".to_string()] },
    );
    def.insert(
        "c".to_string(),
        TaskSpec { function: "work".to_string(), dependencies: vec!["a".to_string()] },
    );
    def.insert(
        "d".to_string(),
        TaskSpec {
            function: "work".to_string(),
            dependencies: vec!["b".to_string(), "c".to_string()],
        },
    );
    def
}

fn test_broker_config() -> BrokerConfig {
    BrokerConfig {
        redis_url: BrokerConfig::DEFAULT_REDIS_URL.to_string(),
        key_prefix: "talus-test".to_string(),
        lease_ttl: Duration::from_secs(30),
        heartbeat_interval: Duration::from_secs(3600),
        max_retry: 3,
        base_delay_seconds: 0,
        janitor_interval_seconds: 30,
    }
}

/// Executor whose outcome is scripted per call: succeeds once `fail_count`
/// calls for a given job have already failed.
struct ScriptedExecutor {
    calls: AtomicUsize,
    fail_first_n: usize,
}

impl ScriptedExecutor {
    fn new(fail_first_n: usize) -> Self {
        Self { calls: AtomicUsize::new(0), fail_first_n }
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        _function: &str,
        _job_id: Uuid,
        _parameters: &serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first_n {
            Err(format!("scripted failure {call}"))
        } else {
            Ok(serde_json::json!({"ok": true}))
        }
    }
}

/// Drive a single worker through exactly one `process_job`-equivalent
/// iteration by popping the next ready job and running it once.
async fn run_one_iteration(worker: &Worker, broker: &FakeBroker) {
    let job_id = broker.pop_ready_blocking().await.unwrap();
    // Re-push so the worker's own pop inside `run` sees it; simplest is to
    // drive the loop for a single tick via a cancellation token fired after
    // the first job completes. Since FakeBroker is a simple queue, push the
    // id back immediately and let `run` consume it under a timeout.
    broker.push_ready(job_id).await.unwrap();
    let shutdown = CancellationToken::new();
    let shutdown_inner = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_inner.cancel();
    });
    let _ = worker.run(shutdown).await;
}

/// Drive a worker through an entire multi-job DAG: `launch_run` has already
/// pushed the roots, and each success's `complete` call pushes its newly-
/// ready children straight onto the same `FakeBroker` queue the worker is
/// popping from, so one continuous `run` drains the whole run to terminal.
async fn run_to_completion(worker: &Worker, timeout: Duration) {
    let shutdown = CancellationToken::new();
    let shutdown_inner = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        shutdown_inner.cancel();
    });
    let _ = worker.run(shutdown).await;
}

#[tokio::test]
async fn worker_completes_a_single_job_successfully() {
    let (pool, db_name) = create_test_db().await;
    let broker = Arc::new(FakeBroker::new());

    let definition = single_task_definition();
    let definition_json = serde_json::to_value(&definition).unwrap();
    let pipeline = pipelines_db::insert_pipeline(&pool, "single-success", &definition_json)
        .await
        .unwrap();
    let run = launch_run(&pool, broker.as_ref(), &pipeline, serde_json::json!({}))
        .await
        .unwrap();

    let executor = Arc::new(ScriptedExecutor::new(0));
    let worker = Worker::new(
        pool.clone(),
        broker.clone(),
        executor,
        test_broker_config(),
        "test-worker-1".to_string(),
    );

    run_one_iteration(&worker, &broker).await;

    let jobs = jobs_db::list_jobs_for_run(&pool, run.id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Success);
    assert_eq!(jobs[0].result, Some(serde_json::json!({"ok": true})));

    let finished_run = runs_db::get_run(&pool, run.id).await.unwrap().unwrap();
    assert_eq!(finished_run.status, RunStatus::Success);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn worker_retries_then_succeeds() {
    let (pool, db_name) = create_test_db().await;
    let broker = Arc::new(FakeBroker::new());

    let definition = single_task_definition();
    let definition_json = serde_json::to_value(&definition).unwrap();
    let pipeline = pipelines_db::insert_pipeline(&pool, "retry-then-succeed", &definition_json)
        .await
        .unwrap();
    let run = launch_run(&pool, broker.as_ref(), &pipeline, serde_json::json!({}))
        .await
        .unwrap();

    // Two failures, then a success, well within max_retry = 3.
    let executor = Arc::new(ScriptedExecutor::new(2));
    let worker = Worker::new(
        pool.clone(),
        broker.clone(),
        executor,
        test_broker_config(),
        "test-worker-1".to_string(),
    );

    // First attempt fails and lands in the delayed set (base_delay_seconds
    // is 0, so it is immediately due).
    run_one_iteration(&worker, &broker).await;
    let jobs = jobs_db::list_jobs_for_run(&pool, run.id).await.unwrap();
    assert_eq!(jobs[0].status, JobStatus::Retrying);
    assert_eq!(jobs[0].attempt, 1);
    assert_eq!(broker.delayed_entries().len(), 1);

    // Promote the due retry back to ready, as the janitor would.
    let promoted = broker.promote_due(i64::MAX).await.unwrap();
    assert_eq!(promoted, vec![jobs[0].id]);
    talus_core::state::dispatch::promote_job(&pool, jobs[0].id).await.unwrap();

    // Second attempt fails too.
    run_one_iteration(&worker, &broker).await;
    let jobs = jobs_db::list_jobs_for_run(&pool, run.id).await.unwrap();
    assert_eq!(jobs[0].status, JobStatus::Retrying);
    assert_eq!(jobs[0].attempt, 2);

    let promoted = broker.promote_due(i64::MAX).await.unwrap();
    assert_eq!(promoted, vec![jobs[0].id]);
    talus_core::state::dispatch::promote_job(&pool, jobs[0].id).await.unwrap();

    // Third attempt succeeds.
    run_one_iteration(&worker, &broker).await;
    let jobs = jobs_db::list_jobs_for_run(&pool, run.id).await.unwrap();
    assert_eq!(jobs[0].status, JobStatus::Success);
    assert_eq!(jobs[0].attempt, 2);

    let finished_run = runs_db::get_run(&pool, run.id).await.unwrap().unwrap();
    assert_eq!(finished_run.status, RunStatus::Success);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn worker_dead_letters_after_exhausting_retry_budget() {
    let (pool, db_name) = create_test_db().await;
    let broker = Arc::new(FakeBroker::new());

    let definition = single_task_definition();
    let definition_json = serde_json::to_value(&definition).unwrap();
    let pipeline = pipelines_db::insert_pipeline(&pool, "always-fails", &definition_json)
        .await
        .unwrap();
    let run = launch_run(&pool, broker.as_ref(), &pipeline, serde_json::json!({}))
        .await
        .unwrap();

    // Always fails; max_retry = 3 means 4 total attempts before dead-letter.
    let executor = Arc::new(ScriptedExecutor::new(usize::MAX));
    let worker = Worker::new(
        pool.clone(),
        broker.clone(),
        executor,
        test_broker_config(),
        "test-worker-1".to_string(),
    );

    for _ in 0..3 {
        run_one_iteration(&worker, &broker).await;
        let jobs = jobs_db::list_jobs_for_run(&pool, run.id).await.unwrap();
        assert_eq!(jobs[0].status, JobStatus::Retrying);

        let job_id = jobs[0].id;
        let promoted = broker.promote_due(i64::MAX).await.unwrap();
        assert_eq!(promoted, vec![job_id]);
        talus_core::state::dispatch::promote_job(&pool, job_id).await.unwrap();
    }

    // Fourth attempt exhausts the budget and dead-letters.
    run_one_iteration(&worker, &broker).await;
    let jobs = jobs_db::list_jobs_for_run(&pool, run.id).await.unwrap();
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert_eq!(jobs[0].attempt, 4);
    assert_eq!(broker.dead_letter_entries(), vec![jobs[0].id]);

    let finished_run = runs_db::get_run(&pool, run.id).await.unwrap().unwrap();
    assert_eq!(finished_run.status, RunStatus::Failed);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn worker_runs_linear_three_to_completion_in_order() {
    let (pool, db_name) = create_test_db().await;
    let broker = Arc::new(FakeBroker::new());

    let definition = linear_three_definition();
    let definition_json = serde_json::to_value(&definition).unwrap();
    let pipeline = pipelines_db::insert_pipeline(&pool, "linear-three", &definition_json)
        .await
        .unwrap();
    let run = launch_run(&pool, broker.as_ref(), &pipeline, serde_json::json!({}))
        .await
        .unwrap();

    let executor = Arc::new(ScriptedExecutor::new(0));
    let worker = Worker::new(
        pool.clone(),
        broker.clone(),
        executor,
        test_broker_config(),
        "test-worker-1".to_string(),
    );

    run_to_completion(&worker, Duration::from_millis(500)).await;

    let jobs = jobs_db::list_jobs_for_run(&pool, run.id).await.unwrap();
    assert_eq!(jobs.len(), 3);
    for job in &jobs {
        assert_eq!(job.status, JobStatus::Success, "task {} did not succeed", job.task_id);
    }

    // Dependency respect (§8 property 3): a child starts no earlier than
    // its parent's successful completion.
    let by_task: std::collections::HashMap<_, _> =
        jobs.iter().map(|j| (j.task_id.clone(), j)).collect();
    let a = by_task["a"];
    let b = by_task["b"];
    let c = by_task["c"];
    assert!(b.started_at.unwrap() >= a.completed_at.unwrap());
    assert!(c.started_at.unwrap() >= b.completed_at.unwrap());

    // Each of b and c was pushed to the ready list exactly once -- no
    // double-push of the sole child at each level of the chain.
    let push_log = broker.ready_push_log();
    assert_eq!(push_log.iter().filter(|&&id| id == b.id).count(), 1);
    assert_eq!(push_log.iter().filter(|&&id| id == c.id).count(), 1);

    // jobs-remaining goes 3 -> 2 -> 1 -> 0 as each job finishes; only the
    // final value is observable after the run completes, but it must have
    // bottomed out at exactly zero, with the run marked SUCCESS to match.
    let finished_run = runs_db::get_run(&pool, run.id).await.unwrap().unwrap();
    assert_eq!(finished_run.status, RunStatus::Success);
    assert_eq!(finished_run.jobs_remaining, 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn worker_runs_diamond_pushing_sink_exactly_once() {
    let (pool, db_name) = create_test_db().await;
    let broker = Arc::new(FakeBroker::new());

    let definition = diamond_definition();
    let definition_json = serde_json::to_value(&definition).unwrap();
    let pipeline = pipelines_db::insert_pipeline(&pool, "diamond-worker", &definition_json)
        .await
        .unwrap();
    let run = launch_run(&pool, broker.as_ref(), &pipeline, serde_json::json!({}))
        .await
        .unwrap();

    let executor = Arc::new(ScriptedExecutor::new(0));
    let worker = Worker::new(
        pool.clone(),
        broker.clone(),
        executor,
        test_broker_config(),
        "test-worker-1".to_string(),
    );

    run_to_completion(&worker, Duration::from_millis(500)).await;

    let jobs = jobs_db::list_jobs_for_run(&pool, run.id).await.unwrap();
    assert_eq!(jobs.len(), 4);
    for job in &jobs {
        assert_eq!(job.status, JobStatus::Success, "task {} did not succeed", job.task_id);
    }

    let by_task: std::collections::HashMap<_, _> =
        jobs.iter().map(|j| (j.task_id.clone(), j)).collect();
    let a = by_task["a"];
    let b = by_task["b"];
    let c = by_task["c"];
    let d = by_task["d"];
    assert!(b.started_at.unwrap() >= a.completed_at.unwrap());
    assert!(c.started_at.unwrap() >= a.completed_at.unwrap());
    assert!(d.started_at.unwrap() >= b.completed_at.unwrap());
    assert!(d.started_at.unwrap() >= c.completed_at.unwrap());

    // §8 property 8 / the Diamond scenario: b and c both complete as
    // siblings of d's dependency set, but d must be pushed to the ready
    // list exactly once despite both of its parents calling `complete`.
    let push_log = broker.ready_push_log();
    assert_eq!(
        push_log.iter().filter(|&&id| id == d.id).count(),
        1,
        "d must be enqueued exactly once, got push log {push_log:?}"
    );

    let finished_run = runs_db::get_run(&pool, run.id).await.unwrap().unwrap();
    assert_eq!(finished_run.status, RunStatus::Success);
    assert_eq!(finished_run.jobs_remaining, 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

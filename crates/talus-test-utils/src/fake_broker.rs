//! In-memory [`JobBroker`] for tests that exercise the bootstrap/worker/
//! janitor logic without a live Redis. Mirrors the key-space semantics of
//! `RedisBroker` with plain `Mutex`-guarded collections.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use talus_core::broker::JobBroker;
use uuid::Uuid;

#[derive(Default)]
struct State {
    ready: VecDeque<Uuid>,
    delayed: Vec<(Uuid, i64)>,
    dead_letter: Vec<Uuid>,
    leases: HashSet<Uuid>,
    deps_count: HashMap<Uuid, i64>,
    reverse_graph: HashMap<Uuid, Vec<Uuid>>,
    jobs_count: HashMap<Uuid, i64>,
    /// Every job id ever appended to the ready list, in order, never
    /// trimmed on pop -- lets tests assert a job was pushed exactly once
    /// over a run's lifetime even after it has since been consumed.
    ready_push_log: Vec<Uuid>,
}

/// An in-memory stand-in for [`RedisBroker`](talus_core::broker::RedisBroker).
///
/// `acquire_lease`/`renew_lease`/`release_lease` track held leases as a set
/// rather than real TTLs; call [`FakeBroker::expire_lease`] to simulate a
/// worker dying, for janitor zombie-reclamation tests.
pub struct FakeBroker {
    state: Mutex<State>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self { state: Mutex::new(State::default()) }
    }

    /// Simulate a lease expiring (the worker holding it died without
    /// renewing), without waiting out a real TTL.
    pub fn expire_lease(&self, job_id: Uuid) {
        self.state.lock().unwrap().leases.remove(&job_id);
    }

    /// Contents of the dead-letter list, for assertions.
    pub fn dead_letter_entries(&self) -> Vec<Uuid> {
        self.state.lock().unwrap().dead_letter.clone()
    }

    /// Contents of the delayed set, for assertions.
    pub fn delayed_entries(&self) -> Vec<(Uuid, i64)> {
        self.state.lock().unwrap().delayed.clone()
    }

    /// Snapshot of the ready list, front to back, for assertions that a job
    /// was enqueued exactly once.
    pub fn ready_entries(&self) -> Vec<Uuid> {
        self.state.lock().unwrap().ready.iter().copied().collect()
    }

    /// Every job id ever pushed to the ready list, in push order, including
    /// ones already popped. Use this (not [`Self::ready_entries`]) to count
    /// how many times a given job was enqueued over a run's lifetime.
    pub fn ready_push_log(&self) -> Vec<Uuid> {
        self.state.lock().unwrap().ready_push_log.clone()
    }
}

impl Default for FakeBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobBroker for FakeBroker {
    async fn push_ready(&self, job_id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.ready.push_back(job_id);
        state.ready_push_log.push(job_id);
        Ok(())
    }

    async fn pop_ready_blocking(&self) -> Result<Uuid> {
        loop {
            if let Some(job_id) = self.state.lock().unwrap().ready.pop_front() {
                return Ok(job_id);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn acquire_lease(&self, job_id: Uuid, _worker_id: &str, _ttl: Duration) -> Result<bool> {
        Ok(self.state.lock().unwrap().leases.insert(job_id))
    }

    async fn renew_lease(&self, _job_id: Uuid, _ttl: Duration) -> Result<()> {
        Ok(())
    }

    async fn release_lease(&self, job_id: Uuid) -> Result<()> {
        self.state.lock().unwrap().leases.remove(&job_id);
        Ok(())
    }

    async fn lease_exists(&self, job_id: Uuid) -> Result<bool> {
        Ok(self.state.lock().unwrap().leases.contains(&job_id))
    }

    async fn complete(&self, _run_id: Uuid, completed_job_id: Uuid) -> Result<Vec<Uuid>> {
        let mut state = self.state.lock().unwrap();
        let children = state.reverse_graph.get(&completed_job_id).cloned().unwrap_or_default();

        let mut newly_ready = Vec::new();
        for child in children {
            let count = state.deps_count.entry(child).or_insert(0);
            *count -= 1;
            if *count == 0 {
                newly_ready.push(child);
            }
        }

        for job_id in &newly_ready {
            state.ready.push_back(*job_id);
            state.ready_push_log.push(*job_id);
        }

        Ok(newly_ready)
    }

    async fn schedule_retry(&self, job_id: Uuid, due_epoch_seconds: i64) -> Result<()> {
        self.state.lock().unwrap().delayed.push((job_id, due_epoch_seconds));
        Ok(())
    }

    async fn promote_due(&self, now_epoch_seconds: i64) -> Result<Vec<Uuid>> {
        let mut state = self.state.lock().unwrap();
        let (due, not_due): (Vec<_>, Vec<_>) =
            state.delayed.drain(..).partition(|(_, due)| *due <= now_epoch_seconds);
        state.delayed = not_due;

        let job_ids: Vec<Uuid> = due.into_iter().map(|(job_id, _)| job_id).collect();
        for job_id in &job_ids {
            state.ready.push_back(*job_id);
            state.ready_push_log.push(*job_id);
        }

        Ok(job_ids)
    }

    async fn dead_letter(&self, job_id: Uuid) -> Result<()> {
        self.state.lock().unwrap().dead_letter.push(job_id);
        Ok(())
    }

    async fn decr_jobs_remaining(&self, run_id: Uuid) -> Result<i64> {
        let mut state = self.state.lock().unwrap();
        let count = state.jobs_count.entry(run_id).or_insert(0);
        *count -= 1;
        Ok(*count)
    }

    async fn seed_run(
        &self,
        run_id: Uuid,
        jobs_count: i64,
        deps_count: &HashMap<Uuid, i64>,
        reverse_graph: &HashMap<Uuid, Vec<Uuid>>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.jobs_count.insert(run_id, jobs_count);
        state.deps_count.extend(deps_count.iter().map(|(k, v)| (*k, *v)));
        state.reverse_graph.extend(reverse_graph.iter().map(|(k, v)| (*k, v.clone())));
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

//! Redis-backed broker: ready list, delayed set, dead-letter list,
//! per-job leases, per-run dependency counters and reverse graph.
//!
//! Keys live under a configurable namespace prefix (`talus` by default)
//! so multiple orchestrator deployments can share a Redis instance.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by broker operations that callers may need to match on,
/// distinct from the `anyhow::Error` used for ordinary I/O failure
/// propagation elsewhere in this crate.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(#[from] redis::RedisError),

    #[error("completion script returned malformed output: {0}")]
    MalformedScriptOutput(String),
}

/// Tunable knobs for the broker and the components that consume it.
/// Every field here is named in the configuration surface; there are no
/// hidden knobs.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub redis_url: String,
    /// Namespace prefix for every broker key (default `talus`).
    pub key_prefix: String,
    pub lease_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub max_retry: u32,
    pub base_delay_seconds: u64,
    pub janitor_interval_seconds: u64,
}

impl BrokerConfig {
    pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

    /// Build a config from the environment, falling back to the
    /// recommended defaults from the worker/janitor design (§4.4/§4.5):
    /// `LEASE_TTL` = 300s, `HEARTBEAT_INTERVAL` = 60s, `MAX_RETRY` = 3,
    /// `BASE_DELAY` = 10s, janitor tick ≈ 30s.
    pub fn from_env() -> Self {
        let redis_url = std::env::var("TALUS_REDIS_URL")
            .unwrap_or_else(|_| Self::DEFAULT_REDIS_URL.to_owned());
        Self {
            redis_url,
            key_prefix: "talus".to_owned(),
            lease_ttl: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(60),
            max_retry: 3,
            base_delay_seconds: 10,
            janitor_interval_seconds: 30,
        }
    }

    fn ready_queue_key(&self) -> String {
        format!("{}:ready_queue", self.key_prefix)
    }

    fn delayed_queue_key(&self) -> String {
        format!("{}:delayed_queue", self.key_prefix)
    }

    fn dead_letter_queue_key(&self) -> String {
        format!("{}:dead_letter_queue", self.key_prefix)
    }

    fn job_lock_key(&self, job_id: Uuid) -> String {
        format!("{}:job:{}:lock", self.key_prefix, job_id)
    }

    fn deps_count_key(&self, run_id: Uuid) -> String {
        format!("{}:run:{}:deps_count", self.key_prefix, run_id)
    }

    fn reverse_graph_key(&self, run_id: Uuid) -> String {
        format!("{}:run:{}:reverse_graph", self.key_prefix, run_id)
    }

    fn jobs_count_key(&self, run_id: Uuid) -> String {
        format!("{}:run:{}:jobs_count", self.key_prefix, run_id)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Broker-side operations the rest of the orchestration core consumes.
/// See spec §4.3; implemented for real use by [`RedisBroker`] and, in
/// `talus-test-utils`, by an in-memory fake for tests that should not
/// require a live Redis.
#[async_trait]
pub trait JobBroker: Send + Sync {
    /// Append a job identifier to the ready list tail.
    async fn push_ready(&self, job_id: Uuid) -> Result<()>;

    /// Block until a job identifier is available at the ready list head,
    /// then return it. Fair (FIFO) and multi-consumer safe: each pushed
    /// identifier is delivered to exactly one caller.
    async fn pop_ready_blocking(&self) -> Result<Uuid>;

    /// Atomic set-if-absent with TTL. Returns `true` iff the caller now
    /// owns the lease.
    async fn acquire_lease(&self, job_id: Uuid, worker_id: &str, ttl: Duration) -> Result<bool>;

    /// Extend a held lease's TTL. Idempotent; no ownership check -- the
    /// heartbeat co-task is trusted because it shares the holder's
    /// process lifetime.
    async fn renew_lease(&self, job_id: Uuid, ttl: Duration) -> Result<()>;

    /// Unconditionally delete a lease.
    async fn release_lease(&self, job_id: Uuid) -> Result<()>;

    /// Whether a job's lease key currently exists. Used by the janitor's
    /// zombie scan.
    async fn lease_exists(&self, job_id: Uuid) -> Result<bool>;

    /// Atomically decrement every direct child of `completed_job_id` in
    /// `run_id`'s dependency counter, collect children whose counter
    /// reached exactly zero, push that collection to the ready list, and
    /// return it. Executes as a single broker-side script.
    async fn complete(&self, run_id: Uuid, completed_job_id: Uuid) -> Result<Vec<Uuid>>;

    /// Insert a job into the delayed set, keyed by its due epoch time.
    async fn schedule_retry(&self, job_id: Uuid, due_epoch_seconds: i64) -> Result<()>;

    /// Atomically move every delayed-set member due at or before `now`
    /// into the ready list, and return the moved identifiers.
    async fn promote_due(&self, now_epoch_seconds: i64) -> Result<Vec<Uuid>>;

    /// Append a job identifier to the dead-letter list.
    async fn dead_letter(&self, job_id: Uuid) -> Result<()>;

    /// Atomically decrement a run's jobs-remaining counter and return the
    /// new value.
    async fn decr_jobs_remaining(&self, run_id: Uuid) -> Result<i64>;

    /// Seed a freshly-bootstrapped run's broker-side state in one
    /// pipelined round trip: jobs count, per-job dependency counters, and
    /// the reverse adjacency graph (job id -> ordered child job ids).
    async fn seed_run(
        &self,
        run_id: Uuid,
        jobs_count: i64,
        deps_count: &HashMap<Uuid, i64>,
        reverse_graph: &HashMap<Uuid, Vec<Uuid>>,
    ) -> Result<()>;

    /// Liveness check for `/health`.
    async fn ping(&self) -> Result<()>;
}

/// The completion script: decrement each downstream job's dependency
/// counter, collect those that hit exactly zero, and right-push the
/// collected set onto the ready queue in one round trip.
const COMPLETE_JOB_SCRIPT: &str = r#"
local deps_count_hash = KEYS[1]
local ready_queue = KEYS[2]

local newly_ready_jobs = {}

for i, downstream_job_id in ipairs(ARGV) do
  local new_dep_count = redis.call('HINCRBY', deps_count_hash, downstream_job_id, -1)
  if new_dep_count == 0 then
    table.insert(newly_ready_jobs, downstream_job_id)
  end
end

if #newly_ready_jobs > 0 then
  redis.call('RPUSH', ready_queue, unpack(newly_ready_jobs))
end

return newly_ready_jobs
"#;

/// Redis-backed implementation of [`JobBroker`].
pub struct RedisBroker {
    conn: ConnectionManager,
    config: BrokerConfig,
    complete_script: Script,
}

impl RedisBroker {
    /// Connect to Redis and prepare the completion script for later
    /// `EVALSHA` invocation (the `redis` crate's `Script` type caches the
    /// SHA and falls back to `EVAL` on a cache miss).
    pub async fn connect(config: BrokerConfig) -> Result<Self, BrokerError> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            config,
            complete_script: Script::new(COMPLETE_JOB_SCRIPT),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }
}

#[async_trait]
impl JobBroker for RedisBroker {
    async fn push_ready(&self, job_id: Uuid) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(self.config.ready_queue_key(), job_id.to_string())
            .await?;
        Ok(())
    }

    async fn pop_ready_blocking(&self) -> Result<Uuid> {
        let mut conn = self.conn.clone();
        // BLPOP timeout 0 blocks indefinitely.
        let (_key, value): (String, String) =
            conn.blpop(self.config.ready_queue_key(), 0.0).await?;
        Ok(Uuid::parse_str(&value)?)
    }

    async fn acquire_lease(&self, job_id: Uuid, worker_id: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let acquired: bool = redis::cmd("SET")
            .arg(self.config.job_lock_key(job_id))
            .arg(worker_id)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<Option<String>>(&mut conn)
            .await?
            .is_some();
        Ok(acquired)
    }

    async fn renew_lease(&self, job_id: Uuid, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.expire::<_, ()>(self.config.job_lock_key(job_id), ttl.as_secs() as i64)
            .await?;
        Ok(())
    }

    async fn release_lease(&self, job_id: Uuid) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.config.job_lock_key(job_id)).await?;
        Ok(())
    }

    async fn lease_exists(&self, job_id: Uuid) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(self.config.job_lock_key(job_id)).await?;
        Ok(exists)
    }

    async fn complete(&self, run_id: Uuid, completed_job_id: Uuid) -> Result<Vec<Uuid>> {
        let mut conn = self.conn.clone();

        let children: Vec<String> = {
            let graph: Option<String> = conn
                .hget(self.config.reverse_graph_key(run_id), completed_job_id.to_string())
                .await?;
            match graph {
                Some(json) => serde_json::from_str(&json)?,
                None => Vec::new(),
            }
        };

        if children.is_empty() {
            return Ok(Vec::new());
        }

        let newly_ready: Vec<String> = self
            .complete_script
            .key(self.config.deps_count_key(run_id))
            .key(self.config.ready_queue_key())
            .arg(&children)
            .invoke_async(&mut conn)
            .await
            .map_err(BrokerError::Connection)?;

        newly_ready
            .into_iter()
            .map(|s| Uuid::parse_str(&s).map_err(Into::into))
            .collect()
    }

    async fn schedule_retry(&self, job_id: Uuid, due_epoch_seconds: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(
            self.config.delayed_queue_key(),
            job_id.to_string(),
            due_epoch_seconds,
        )
        .await?;
        Ok(())
    }

    async fn promote_due(&self, now_epoch_seconds: i64) -> Result<Vec<Uuid>> {
        let mut conn = self.conn.clone();
        let due: Vec<String> = conn
            .zrangebyscore(self.config.delayed_queue_key(), 0, now_epoch_seconds)
            .await?;

        if due.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        pipe.atomic()
            .rpush(self.config.ready_queue_key(), &due)
            .zrembyscore(self.config.delayed_queue_key(), 0, now_epoch_seconds);
        let _: ((), ()) = pipe.query_async(&mut conn).await?;

        due.into_iter()
            .map(|s| Uuid::parse_str(&s).map_err(Into::into))
            .collect()
    }

    async fn dead_letter(&self, job_id: Uuid) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(self.config.dead_letter_queue_key(), job_id.to_string())
            .await?;
        Ok(())
    }

    async fn decr_jobs_remaining(&self, run_id: Uuid) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.decr(self.config.jobs_count_key(run_id), 1).await?;
        Ok(value)
    }

    async fn seed_run(
        &self,
        run_id: Uuid,
        jobs_count: i64,
        deps_count: &HashMap<Uuid, i64>,
        reverse_graph: &HashMap<Uuid, Vec<Uuid>>,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().set(self.config.jobs_count_key(run_id), jobs_count);

        for (job_id, count) in deps_count {
            pipe.hset(self.config.deps_count_key(run_id), job_id.to_string(), *count);
        }

        for (job_id, children) in reverse_graph {
            let encoded = serde_json::to_string(children)?;
            pipe.hset(self.config.reverse_graph_key(run_id), job_id.to_string(), encoded);
        }

        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

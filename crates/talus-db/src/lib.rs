//! Durable storage for the talus orchestrator: pipelines, runs, jobs, their
//! dependency graph, and task logs, backed by PostgreSQL via `sqlx`.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;

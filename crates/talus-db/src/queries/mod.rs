//! Hand-written query functions, one module per table family. No ORM macro
//! magic: every query is a plain `sqlx::query`/`sqlx::query_as` call.

pub mod jobs;
pub mod pipelines;
pub mod runs;
pub mod task_logs;

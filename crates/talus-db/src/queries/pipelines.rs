//! Database query functions for the `pipelines` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::models::Pipeline;

/// Typed error callers need to match on, distinct from the `anyhow::Error`
/// used for ordinary I/O failure propagation elsewhere: a duplicate
/// pipeline name is a validation failure (spec §7), not an infrastructure
/// one, and the HTTP layer needs to tell the two apart to pick 400 vs 500.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline name {0:?} already exists")]
    DuplicateName(String),
}

/// Insert a new pipeline. `definition` must already have passed DAG
/// validation; this function performs no acyclicity checking of its own.
pub async fn insert_pipeline(
    pool: &PgPool,
    name: &str,
    definition: &serde_json::Value,
) -> Result<Pipeline> {
    let result = sqlx::query_as::<_, Pipeline>(
        "INSERT INTO pipelines (name, definition) VALUES ($1, $2) RETURNING *",
    )
    .bind(name)
    .bind(definition)
    .fetch_one(pool)
    .await;

    match result {
        Ok(pipeline) => Ok(pipeline),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            Err(PipelineError::DuplicateName(name.to_string()).into())
        }
        Err(err) => Err(err).context("failed to insert pipeline"),
    }
}

/// Fetch a pipeline by ID.
pub async fn get_pipeline(pool: &PgPool, id: Uuid) -> Result<Option<Pipeline>> {
    let pipeline = sqlx::query_as::<_, Pipeline>("SELECT * FROM pipelines WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch pipeline")?;

    Ok(pipeline)
}

/// Fetch a pipeline by its unique name.
pub async fn get_pipeline_by_name(pool: &PgPool, name: &str) -> Result<Option<Pipeline>> {
    let pipeline = sqlx::query_as::<_, Pipeline>("SELECT * FROM pipelines WHERE name = $1")
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("failed to fetch pipeline by name")?;

    Ok(pipeline)
}

/// List all pipelines, most recently created first.
pub async fn list_pipelines(pool: &PgPool) -> Result<Vec<Pipeline>> {
    let pipelines =
        sqlx::query_as::<_, Pipeline>("SELECT * FROM pipelines ORDER BY created_at DESC")
            .fetch_all(pool)
            .await
            .context("failed to list pipelines")?;

    Ok(pipelines)
}

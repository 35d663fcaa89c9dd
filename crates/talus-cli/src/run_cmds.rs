//! `talus run` subcommands: launch a run of an existing pipeline.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;

use talus_core::broker::{JobBroker, RedisBroker};
use talus_db::queries::pipelines as pipelines_db;

use crate::config::TalusConfig;
use crate::RunCommands;

pub async fn run_run_command(command: RunCommands, pool: &PgPool, config: &TalusConfig) -> Result<()> {
    match command {
        RunCommands::Create { pipeline, params_file } => {
            create_run(pool, config, &pipeline, params_file.as_deref()).await
        }
    }
}

async fn create_run(
    pool: &PgPool,
    config: &TalusConfig,
    pipeline_name: &str,
    params_file: Option<&str>,
) -> Result<()> {
    let pipeline = pipelines_db::get_pipeline_by_name(pool, pipeline_name)
        .await?
        .with_context(|| format!("pipeline {pipeline_name} not found"))?;

    let parameters = match params_file {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read parameters file {path}"))?;
            serde_json::from_str(&contents).context("parameters file is not valid JSON")?
        }
        None => serde_json::json!({}),
    };

    let broker = RedisBroker::connect(config.broker_config.clone())
        .await
        .context("failed to connect to broker")?;
    let broker: Arc<dyn JobBroker> = Arc::new(broker);

    let run = talus_core::bootstrap::launch_run(pool, broker.as_ref(), &pipeline, parameters)
        .await
        .context("failed to launch run")?;

    println!("Run created: {} (pipeline {})", run.id, pipeline.name);
    println!("  status: {}", run.status);
    println!("  jobs: {}", run.jobs_remaining);

    Ok(())
}

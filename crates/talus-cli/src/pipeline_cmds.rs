//! `talus pipeline` subcommands: create from a definition file, show.

use anyhow::{Context, Result};
use sqlx::PgPool;

use talus_core::dag::{self, PipelineDefinition};
use talus_db::queries::pipelines as pipelines_db;
use talus_db::queries::runs as runs_db;

use crate::PipelineCommands;

pub async fn run_pipeline_command(command: PipelineCommands, pool: &PgPool) -> Result<()> {
    match command {
        PipelineCommands::Create { file } => create_pipeline(pool, &file).await,
        PipelineCommands::Show { name } => show_pipeline(pool, name.as_deref()).await,
    }
}

/// Read a pipeline definition from a JSON file, validate it as a DAG, and
/// persist it. The file's top level is `{name, definition}`, where
/// `definition` is the task-id -> `{function, dependencies}` mapping.
async fn create_pipeline(pool: &PgPool, path: &str) -> Result<()> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read pipeline file {path}"))?;

    #[derive(serde::Deserialize)]
    struct PipelineFile {
        name: String,
        definition: PipelineDefinition,
    }

    let parsed: PipelineFile =
        serde_json::from_str(&contents).context("pipeline file is not valid JSON")?;

    dag::validate(&parsed.definition).context("pipeline definition is invalid")?;

    let definition_json = serde_json::to_value(&parsed.definition)
        .context("failed to serialize pipeline definition")?;

    let pipeline = pipelines_db::insert_pipeline(pool, &parsed.name, &definition_json)
        .await
        .context("failed to insert pipeline")?;

    println!("Pipeline created: {} ({})", pipeline.name, pipeline.id);
    println!("  tasks: {}", parsed.definition.len());

    Ok(())
}

/// Show a pipeline's definition and its runs, or list all pipelines if no
/// name is given.
async fn show_pipeline(pool: &PgPool, name: Option<&str>) -> Result<()> {
    let Some(name) = name else {
        let pipelines = pipelines_db::list_pipelines(pool).await?;
        if pipelines.is_empty() {
            println!("No pipelines found.");
            return Ok(());
        }
        println!("{:<38} {:<30} {:>8}", "ID", "NAME", "TASKS");
        println!("{}", "-".repeat(80));
        for pipeline in &pipelines {
            let task_count = pipeline
                .definition
                .as_object()
                .map(|obj| obj.len())
                .unwrap_or(0);
            println!("{:<38} {:<30} {:>8}", pipeline.id, pipeline.name, task_count);
        }
        return Ok(());
    };

    let pipeline = pipelines_db::get_pipeline_by_name(pool, name)
        .await?
        .with_context(|| format!("pipeline {name} not found"))?;

    println!("Pipeline: {} ({})", pipeline.name, pipeline.id);
    println!("Created: {}", pipeline.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!(
        "Definition:\n{}",
        serde_json::to_string_pretty(&pipeline.definition).unwrap_or_default()
    );

    let runs = runs_db::list_runs_for_pipeline(pool, pipeline.id).await?;
    println!("\nRuns ({}):", runs.len());
    for run in &runs {
        println!(
            "  {} status={} jobs_remaining={}",
            run.id, run.status, run.jobs_remaining
        );
    }

    Ok(())
}

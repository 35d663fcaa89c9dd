mod config;
mod pipeline_cmds;
mod run_cmds;
mod serve_cmd;
mod status_cmd;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use talus_core::broker::{JobBroker, RedisBroker};
use talus_core::janitor::Janitor;
use talus_core::worker::{TaskExecutor, Worker};
use talus_db::pool;

use config::TalusConfig;

#[derive(Parser)]
#[command(name = "talus", about = "Distributed DAG job orchestrator")]
struct Cli {
    /// Database URL (overrides TALUS_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,
    /// Redis URL (overrides TALUS_REDIS_URL env var)
    #[arg(long, global = true)]
    redis_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a talus config file (no database required)
    Init {
        #[arg(long, default_value = "postgresql://localhost:5432/talus")]
        db_url: String,
        #[arg(long, default_value = "redis://localhost:6379")]
        redis_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the talus database (requires config file or env vars)
    DbInit,
    /// Pipeline management
    Pipeline {
        #[command(subcommand)]
        command: PipelineCommands,
    },
    /// Run management
    Run {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Start a worker process, pulling jobs until interrupted
    Worker,
    /// Start the janitor reconciliation daemon until interrupted
    Janitor,
    /// Show run status (omit run_id to list all runs)
    Status {
        /// Run ID to show status for (omit to list all)
        run_id: Option<String>,
    },
    /// Serve the HTTP API
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
}

#[derive(Subcommand)]
pub enum PipelineCommands {
    /// Create a pipeline from a JSON definition file
    Create {
        /// Path to the pipeline JSON file: {name, definition}
        file: String,
    },
    /// Show a pipeline's definition and runs (or list all pipelines)
    Show {
        /// Pipeline name to show (omit to list all)
        name: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum RunCommands {
    /// Launch a run of an existing pipeline
    Create {
        /// Pipeline name
        pipeline: String,
        /// Path to a JSON file of run parameters
        #[arg(long)]
        params_file: Option<String>,
    },
}

/// No-op task executor: real task bodies are external to this
/// orchestrator (§1 scope); this stands in so `talus worker` is runnable
/// out of the box, succeeding every job with its function name as the
/// result payload.
struct NoopExecutor;

#[async_trait::async_trait]
impl TaskExecutor for NoopExecutor {
    async fn execute(
        &self,
        function: &str,
        _job_id: uuid::Uuid,
        _parameters: &serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        Ok(serde_json::json!({ "function": function }))
    }
}

/// Execute the `talus init` command: write config file.
fn cmd_init(db_url: &str, redis_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection { url: db_url.to_string() },
        broker: config::BrokerSection { redis_url: redis_url.to_string() },
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!("  broker.redis_url = {redis_url}");
    println!();
    println!("Next: run `talus db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `talus db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>, cli_redis_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = TalusConfig::resolve(cli_db_url, cli_redis_url)?;

    println!("Initializing talus database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = connect_db_with_retry(&resolved).await?;
    pool::run_migrations(&db_pool).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;
    println!("talus db-init complete.");
    Ok(())
}

/// Bounded-retry startup connect, matching the source prototype's
/// `main.py` loop: up to `MAX_STARTUP_ATTEMPTS` tries, `STARTUP_RETRY_DELAY`
/// apart, before giving up so the process can exit non-zero (§6: "Exit
/// codes: ... non-zero on failure to connect to store or broker after
/// bounded retry at startup").
const MAX_STARTUP_ATTEMPTS: u32 = 5;
const STARTUP_RETRY_DELAY: Duration = Duration::from_secs(5);

async fn connect_with_retry<T, F, Fut>(what: &str, mut attempt_connect: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    for attempt in 1..=MAX_STARTUP_ATTEMPTS {
        match attempt_connect().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < MAX_STARTUP_ATTEMPTS => {
                tracing::warn!(
                    attempt,
                    max_attempts = MAX_STARTUP_ATTEMPTS,
                    error = %err,
                    "{what} connection failed, retrying in {STARTUP_RETRY_DELAY:?}"
                );
                tokio::time::sleep(STARTUP_RETRY_DELAY).await;
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!(
                        "could not connect to {what} after {MAX_STARTUP_ATTEMPTS} attempts"
                    )
                });
            }
        }
    }
    unreachable!("loop always returns")
}

async fn connect_db_with_retry(config: &TalusConfig) -> anyhow::Result<sqlx::PgPool> {
    connect_with_retry("database", || pool::create_pool(&config.db_config)).await
}

async fn connect_broker(config: &TalusConfig) -> anyhow::Result<Arc<dyn JobBroker>> {
    let broker: RedisBroker = connect_with_retry("broker", || async {
        RedisBroker::connect(config.broker_config.clone())
            .await
            .map_err(anyhow::Error::from)
    })
    .await?;
    Ok(Arc::new(broker))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, redis_url, force } => {
            cmd_init(&db_url, &redis_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref(), cli.redis_url.as_deref()).await?;
        }
        Commands::Pipeline { command } => {
            let resolved = TalusConfig::resolve(cli.database_url.as_deref(), cli.redis_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = pipeline_cmds::run_pipeline_command(command, &db_pool).await;
            db_pool.close().await;
            result?;
        }
        Commands::Run { command } => {
            let resolved = TalusConfig::resolve(cli.database_url.as_deref(), cli.redis_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = run_cmds::run_run_command(command, &db_pool, &resolved).await;
            db_pool.close().await;
            result?;
        }
        Commands::Worker => {
            let resolved = TalusConfig::resolve(cli.database_url.as_deref(), cli.redis_url.as_deref())?;
            let db_pool = connect_db_with_retry(&resolved).await?;
            let broker = connect_broker(&resolved).await?;
            let worker_id = format!("talus-worker-{}", uuid::Uuid::new_v4());
            let worker = Worker::new(
                db_pool.clone(),
                broker,
                Arc::new(NoopExecutor),
                resolved.broker_config.clone(),
                worker_id,
            );

            let shutdown = CancellationToken::new();
            let shutdown_signal = shutdown.clone();
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                shutdown_signal.cancel();
            });

            tracing::info!("talus worker starting");
            let result = worker.run(shutdown).await;
            db_pool.close().await;
            result?;
        }
        Commands::Janitor => {
            let resolved = TalusConfig::resolve(cli.database_url.as_deref(), cli.redis_url.as_deref())?;
            let db_pool = connect_db_with_retry(&resolved).await?;
            let broker = connect_broker(&resolved).await?;
            let janitor = Janitor::new(
                db_pool.clone(),
                broker,
                Duration::from_secs(resolved.broker_config.janitor_interval_seconds),
            );

            let shutdown = CancellationToken::new();
            let shutdown_signal = shutdown.clone();
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                shutdown_signal.cancel();
            });

            tracing::info!("talus janitor starting");
            let result = janitor.run(shutdown).await;
            db_pool.close().await;
            result?;
        }
        Commands::Status { run_id } => {
            let resolved = TalusConfig::resolve(cli.database_url.as_deref(), cli.redis_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = status_cmd::run_status(&db_pool, run_id.as_deref()).await;
            db_pool.close().await;
            result?;
        }
        Commands::Serve { bind, port } => {
            let resolved = TalusConfig::resolve(cli.database_url.as_deref(), cli.redis_url.as_deref())?;
            let db_pool = connect_db_with_retry(&resolved).await?;
            let broker = connect_broker(&resolved).await?;
            let state = serve_cmd::AppState { pool: db_pool.clone(), broker };
            let result = serve_cmd::run_serve(state, &bind, port).await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}

//! HTTP surface (spec §6): pipeline submission, lookup, run launch, and a
//! health check that exercises both the store and the broker.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use talus_core::broker::JobBroker;
use talus_core::dag::{self, PipelineDefinition};
use talus_db::models::Pipeline;
use talus_db::queries::{pipelines as pipelines_db, runs as runs_db};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: msg.into() }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self { status: StatusCode::NOT_FOUND, message: msg.into() }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, message: format!("{err:#}") }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub broker: Arc<dyn JobBroker>,
}

// ---------------------------------------------------------------------------
// Request/response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreatePipelineRequest {
    pub name: String,
    pub definition: PipelineDefinition,
}

#[derive(Debug, Deserialize)]
pub struct PipelineQuery {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct PipelineResponse {
    #[serde(flatten)]
    pub pipeline: Pipeline,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub store: bool,
    pub broker: bool,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/pipelines", post(create_pipeline))
        .route("/pipeline", get(get_pipeline_by_name))
        .route("/pipelines/{id}/run", post(create_run))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(state: AppState, bind: &str, port: u16) -> Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("talus serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    tracing::info!("talus serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let store = sqlx::query("SELECT 1").execute(&state.pool).await.is_ok();
    let broker = state.broker.ping().await.is_ok();
    Json(HealthResponse { store, broker })
}

async fn create_pipeline(
    State(state): State<AppState>,
    Json(req): Json<CreatePipelineRequest>,
) -> Result<axum::response::Response, AppError> {
    dag::validate(&req.definition)
        .map_err(|e| AppError::bad_request(e.to_string()))?;

    let definition_json = serde_json::to_value(&req.definition)
        .map_err(|e| AppError::internal(e.into()))?;

    let pipeline = pipelines_db::insert_pipeline(&state.pool, &req.name, &definition_json)
        .await
        .map_err(|err| match err.downcast_ref::<pipelines_db::PipelineError>() {
            Some(pipelines_db::PipelineError::DuplicateName(name)) => {
                AppError::bad_request(format!("pipeline name {name:?} already exists"))
            }
            None => AppError::internal(err),
        })?;

    Ok((StatusCode::CREATED, Json(PipelineResponse { pipeline })).into_response())
}

async fn get_pipeline_by_name(
    State(state): State<AppState>,
    Query(query): Query<PipelineQuery>,
) -> Result<axum::response::Response, AppError> {
    let pipeline = pipelines_db::get_pipeline_by_name(&state.pool, &query.name)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("pipeline {} not found", query.name)))?;

    let runs = runs_db::list_runs_for_pipeline(&state.pool, pipeline.id)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(serde_json::json!({
        "pipeline": pipeline,
        "runs": runs,
    }))
    .into_response())
}

async fn create_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<CreateRunRequest>,
) -> Result<axum::response::Response, AppError> {
    let pipeline = pipelines_db::get_pipeline(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("pipeline {id} not found")))?;

    let run = talus_core::bootstrap::launch_run(&state.pool, state.broker.as_ref(), &pipeline, req.parameters)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(run).into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

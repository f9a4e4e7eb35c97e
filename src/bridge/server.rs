//! HTTP surfaces: the standalone bridge router and the orchestrator server
//! (run API plus an in-process bridge).

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{FromRef, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use warden_common::{ProgressSource, QueryError, StatusSource};

use super::ProgressBridge;
use super::ws;
use crate::audit::SessionMutex;
use crate::config::WardenConfig;
use crate::pipeline::RunRegistry;
use crate::pipeline::launch::{self, RunRequest};

pub struct ServerState {
    pub registry: RunRegistry,
    pub config: WardenConfig,
    pub bridge: ProgressBridge,
    pub audit_mutex: SessionMutex,
}

pub type SharedState = Arc<ServerState>;

impl ServerState {
    /// Server state whose bridge observes the local registry.
    pub fn local(config: WardenConfig, registry: RunRegistry, audit_mutex: SessionMutex) -> Self {
        let bridge = ProgressBridge::new(
            Arc::new(registry.clone()),
            Arc::new(registry.clone()),
            config.toml.bridge_settings(),
            Some(config.audit_dir()),
        );
        Self {
            registry,
            config,
            bridge,
            audit_mutex,
        }
    }
}

impl FromRef<SharedState> for ProgressBridge {
    fn from_ref(state: &SharedState) -> Self {
        state.bridge.clone()
    }
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    NotReady(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::NotFound(_) => ApiError::NotFound(e.to_string()),
            QueryError::NotReady(_) => ApiError::NotReady(e.to_string()),
            QueryError::Unreachable(_) | QueryError::Transient(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::NotReady(msg) => (StatusCode::TOO_EARLY, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ── Routers ───────────────────────────────────────────────────────────

/// Bridge-only surface: health check and the observer WebSocket.
pub fn bridge_router(bridge: ProgressBridge) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws::ws_handler))
        .with_state(bridge)
}

/// Orchestrator server: run API, bridge WebSocket and health check.
pub fn orchestrator_router(state: SharedState) -> Router {
    Router::new()
        .route("/api/runs", get(list_runs).post(start_run))
        .route("/api/runs/{id}/progress", get(get_progress))
        .route("/api/runs/{id}/status", get(get_status))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health_check))
        .with_state(state)
}

pub async fn serve(app: Router, port: u16) -> Result<()> {
    let app = app.layer(CorsLayer::permissive());
    let addr = format!("127.0.0.1:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "listening");
    println!("warden listening at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_runs(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.registry.list())
}

async fn start_run(
    State(state): State<SharedState>,
    Json(req): Json<RunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(run_id) = &req.run_id {
        if state.registry.contains(run_id) {
            return Err(ApiError::Conflict(format!("Run {} already exists", run_id)));
        }
    }
    let handle = launch::launch(&state.config, &state.registry, state.audit_mutex.clone(), req)
        .await
        .map_err(|e| ApiError::BadRequest(format!("{:#}", e)))?;
    let run_id = handle.run_id().to_string();

    // The registry supervises the run; the handle is only needed for logging its end.
    tokio::spawn(async move {
        match handle.wait().await {
            Ok(finished) => tracing::info!(
                run_id = %finished.description.run_id,
                status = %finished.description.status,
                "run finished"
            ),
            Err(e) => tracing::error!(error = %e, "run supervisor failed"),
        }
    });

    Ok((StatusCode::CREATED, Json(serde_json::json!({"run_id": run_id}))))
}

async fn get_progress(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.registry.get_progress(&id).await?;
    Ok(Json(snapshot))
}

async fn get_status(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let description = state.registry.describe(&id).await?;
    Ok(Json(description))
}

async fn cancel_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let cancelled = state.registry.cancel(&id)?;
    Ok(Json(serde_json::json!({"run_id": id, "cancelled": cancelled})))
}

// Copyright (c) 2025-2026 dlserve contributors
// Licensed under the MIT License. See LICENSE file for details.

//! HTTP API server
//!
//! Local control surface for the download subsystem.
//!
//! # Endpoints
//!
//! - `GET /health` - Health check
//! - `POST /api/download` - Submit a download (dispatch or queue)
//! - `GET /api/status` - All tracked downloads
//! - `GET /api/status/:id` - One download's state
//! - `GET /api/queue` - Pending queue, in order
//! - `DELETE /api/queue/:id` - Remove a queued task
//! - `POST /api/queue/reorder` - Re-sequence the queue
//! - `POST /api/queue/:id/force` - Launch a queued task out of turn
//! - `POST /api/download/:id/cancel` - Cancel a running download
//! - `POST /api/download/:id/pause` - Pause a running download
//! - `POST /api/download/:id/resume` - Resume a paused download
//! - `POST /api/download/:id/priority` - Priority hint for a running download
//! - `GET /api/history` - Terminal outcome log
//!
//! # Example
//!
//! ```no_run
//! use dlserve::server::Server;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let server = Server::new(dlserve::config::Config::default());
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;

use crate::config::{self, Config};
use crate::context::DownloadContext;
use crate::downloader::{Downloader, ExternalDownloader};
use crate::history::HistoryLog;
use crate::queue::types::{uuid_v4, TaskRecord};
use crate::queue::{Disposition, QueueManager, QueueStore};

// Maximum request body size (1MB); submissions are small JSON documents
const MAX_BODY_SIZE: usize = 1024 * 1024;
// Per-request timeout; every handler is a quick in-memory operation
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Server state shared across handlers.
pub struct AppState {
    pub manager: Arc<QueueManager>,
}

/// API server configuration.
pub struct Server {
    config: Config,
    downloader: Option<Arc<dyn Downloader>>,
}

impl Server {
    /// Create a new server from a loaded config.
    /// By default, binds to 127.0.0.1 (localhost only).
    pub fn new(config: Config) -> Self {
        Self {
            config,
            downloader: None,
        }
    }

    /// Replace the external-tool downloader (used by tests).
    pub fn with_downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    /// Assemble the download subsystem this server fronts.
    pub fn build_manager(&self) -> Result<Arc<QueueManager>> {
        let store = Arc::new(QueueStore::load(config::queue_path()?));
        let ctx = Arc::new(DownloadContext::new(HistoryLog::new(config::history_path()?)));
        let downloader = self
            .downloader
            .clone()
            .unwrap_or_else(|| Arc::new(ExternalDownloader::new(&self.config)));
        Ok(Arc::new(QueueManager::new(
            store,
            ctx,
            downloader,
            Arc::new(config::current_capacity),
            self.config.clone(),
        )))
    }

    /// Build the router with all routes.
    pub fn build_router(&self, manager: Arc<QueueManager>) -> Router {
        let state = Arc::new(AppState { manager });

        Router::new()
            .route("/health", get(health_handler))
            .route("/api/download", post(submit_handler))
            .route("/api/status", get(status_all_handler))
            .route("/api/status/:id", get(status_one_handler))
            .route("/api/queue", get(queue_list_handler))
            .route("/api/queue/reorder", post(queue_reorder_handler))
            .route("/api/queue/:id", delete(queue_remove_handler))
            .route("/api/queue/:id/force", post(force_start_handler))
            .route("/api/download/:id/cancel", post(cancel_handler))
            .route("/api/download/:id/pause", post(pause_handler))
            .route("/api/download/:id/resume", post(resume_handler))
            .route("/api/download/:id/priority", post(priority_handler))
            .route("/api/history", get(history_handler))
            .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
            .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)))
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Start the server with graceful shutdown.
    pub async fn start(&self) -> Result<()> {
        let manager = self.build_manager()?;
        manager.start();

        let router = self.build_router(Arc::clone(&manager));
        let addr = format!("{}:{}", self.config.bind_address, self.config.port);

        tracing::info!("Starting server on {}", addr);

        if self.config.bind_address == "0.0.0.0" {
            tracing::warn!(
                "Server is binding to 0.0.0.0 which exposes the API to the network. \
                Use 127.0.0.1 (default) for local-only access."
            );
        }

        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                anyhow::anyhow!(
                    "Port {} is already in use. This usually means another dlserve \
                    instance is running. Stop it or change the port in ~/.dlserve/config.json",
                    self.config.port
                )
            } else {
                anyhow::anyhow!("Failed to bind to {}: {}", addr, e)
            }
        })?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        manager.stop();
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received, finishing in-flight downloads");
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    active: usize,
    queued: usize,
}

/// Download submission.
#[derive(Deserialize)]
struct DownloadRequest {
    url: String,
    #[serde(rename = "downloadId", alias = "download_id")]
    download_id: Option<String>,
    /// Tool options passed through to the invocation (tool, format,
    /// playlist, outputDir, ...).
    #[serde(flatten)]
    options: serde_json::Map<String, Value>,
}

#[derive(Serialize)]
struct SubmitResponse {
    #[serde(rename = "downloadId")]
    download_id: String,
    status: &'static str,
}

#[derive(Deserialize)]
struct ReorderRequest {
    order: Vec<String>,
}

#[derive(Deserialize, Default)]
struct ForceStartRequest {
    #[serde(rename = "overrideCapacity", alias = "override_capacity", default)]
    override_capacity: bool,
}

#[derive(Deserialize)]
struct PriorityRequest {
    priority: i32,
}

type ApiError = (StatusCode, Json<Value>);

fn not_found(message: &str) -> ApiError {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message })))
}

// =============================================================================
// Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        active: state.manager.context().in_flight(),
        queued: state.manager.list().len(),
    })
}

/// Submit a download. Dispatches immediately when capacity allows,
/// otherwise queues.
async fn submit_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DownloadRequest>,
) -> Result<Json<SubmitResponse>, ApiError> {
    if request.url.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "url must not be empty" })),
        ));
    }

    let download_id = request.download_id.unwrap_or_else(uuid_v4);
    let mut task = TaskRecord::new(&download_id, &request.url);
    task.options = request.options;

    // Fail the submission up front when the destination cannot exist;
    // this is the one pre-dispatch error that belongs to the caller.
    let output_dir = task
        .option_str("outputDir")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| state.manager.config().download_dir.clone());
    if let Err(e) = std::fs::create_dir_all(&output_dir) {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": format!("cannot create download directory {:?}: {}", output_dir, e)
            })),
        ));
    }

    let status = match state.manager.submit(task) {
        Disposition::Dispatched => "started",
        Disposition::Queued => "queued",
    };
    Ok(Json(SubmitResponse {
        download_id,
        status,
    }))
}

/// All tracked downloads. Also sweeps expired terminal entries, so a
/// client that only polls still sees eviction happen.
async fn status_all_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let ctx = state.manager.context();
    let ttl = Duration::from_secs(state.manager.config().finished_ttl_secs);
    ctx.tracker.cleanup_finished(ttl);
    ctx.prune_stale();

    Json(json!({ "downloads": ctx.tracker.summary() }))
}

async fn status_one_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let ctx = state.manager.context();

    if let Some(entry) = ctx.tracker.get(&id) {
        let mut body = serde_json::to_value(&entry).unwrap_or_else(|_| json!({}));
        if let Some(info) = ctx.error_info(&id) {
            body["errorInfo"] = json!(info);
        }
        return Ok(Json(body));
    }

    // A tracker entry may already be evicted while the classification
    // for a recent failure is still worth reporting.
    if let Some(info) = ctx.error_info(&id) {
        return Ok(Json(json!({ "status": "error", "errorInfo": info })));
    }

    Err(not_found("unknown download id"))
}

async fn queue_list_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "queue": state.manager.list() }))
}

async fn queue_remove_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.manager.remove(&id) {
        Ok(Json(json!({ "removed": id })))
    } else {
        Err(not_found("not in queue"))
    }
}

async fn queue_reorder_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ReorderRequest>,
) -> Json<Value> {
    state.manager.reorder(&request.order);
    Json(json!({ "queue": state.manager.list() }))
}

async fn force_start_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<ForceStartRequest>>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = body.unwrap_or_default();
    if state.manager.force_start(&id, request.override_capacity) {
        Ok(Json(json!({ "forced": id })))
    } else {
        Err(not_found("not in queue"))
    }
}

async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let ctx = state.manager.context();
    if let Some(handle) = ctx.handle(&id) {
        handle.terminate();
        return Ok(Json(json!({ "status": "canceling" })));
    }
    // Not running: a queued task is simply removed.
    if state.manager.remove(&id) {
        return Ok(Json(json!({ "status": "removed" })));
    }
    Err(not_found("unknown download id"))
}

async fn pause_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.manager.context().handle(&id) {
        Some(handle) => {
            handle.suspend();
            Ok(Json(json!({ "status": "paused" })))
        }
        None => Err(not_found("not running")),
    }
}

async fn resume_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.manager.context().handle(&id) {
        Some(handle) => {
            handle.resume();
            Ok(Json(json!({ "status": "resumed" })))
        }
        None => Err(not_found("not running")),
    }
}

async fn priority_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<PriorityRequest>,
) -> Result<Json<Value>, ApiError> {
    match state.manager.context().handle(&id) {
        Some(handle) => {
            handle.set_priority(request.priority);
            Ok(Json(json!({ "status": "ok" })))
        }
        None => Err(not_found("not running")),
    }
}

async fn history_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "history": state.manager.context().history().read_all() }))
}

//! API Router and Application State
//!
//! Central routing configuration and shared state.

pub mod network;
pub mod tasks;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use sqlx::SqlitePool;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::gateway;
use crate::orchestrator::{Orchestrator, TaskRouter};
use crate::registry::NodeRegistry;
use crate::reputation::ReputationEngine;
use crate::stream::StreamRegistry;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration
    pub config: Arc<Config>,
    /// Database connection pool
    pub db: SqlitePool,
    /// Connected worker registry
    pub registry: Arc<NodeRegistry>,
    /// Per-task stream queues
    pub streams: Arc<StreamRegistry>,
    /// Request orchestration engine
    pub orchestrator: Arc<Orchestrator>,
    /// Reputation store handle
    pub reputation: ReputationEngine,
    /// Worker frame router (gateway to task drivers)
    pub router: Arc<TaskRouter>,
}

impl AppState {
    /// Create new application state.
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        db: SqlitePool,
        registry: Arc<NodeRegistry>,
        streams: Arc<StreamRegistry>,
        orchestrator: Arc<Orchestrator>,
        reputation: ReputationEngine,
    ) -> Self {
        let router = orchestrator.router();
        Self {
            config,
            db,
            registry,
            streams,
            orchestrator,
            reputation,
            router,
        }
    }
}

/// API errors surfaced to HTTP clients.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Task not found.
    #[error("Task not found")]
    TaskNotFound,

    /// No stream exists for this task.
    #[error("Task has no stream")]
    NoStream,

    /// Request was malformed.
    #[error("Invalid request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            Self::TaskNotFound => (StatusCode::NOT_FOUND, "TASK_NOT_FOUND", self.to_string()),
            Self::NoStream => (StatusCode::NOT_FOUND, "NO_STREAM", self.to_string()),
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", self.to_string()),
        };

        let body = Json(serde_json::json!({
            "error": message,
            "code": code,
        }));

        (status, body).into_response()
    }
}

/// Create the main application router.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/gateway", get(gateway::handler))
        .route("/api/v1/tasks", post(tasks::submit))
        .route("/api/v1/tasks/{task_id}", get(tasks::poll).delete(tasks::cancel))
        .route("/api/v1/tasks/{task_id}/stream", get(tasks::subscribe_stream))
        .route("/api/v1/network", get(network::stats))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

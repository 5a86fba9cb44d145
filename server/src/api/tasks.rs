//! Task Ingress Handlers
//!
//! Submit, poll, cancel and stream-subscribe endpoints consumed by the
//! user-facing boundary.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use iris_common::{Difficulty, TaskFile, TaskMode, TaskStatus};

use super::{ApiError, AppState};
use crate::orchestrator::SubmitRequest;

/// Task submission body.
#[derive(Debug, Deserialize)]
pub struct SubmitTaskRequest {
    pub prompt: String,
    #[serde(default)]
    pub mode: TaskMode,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub files: Vec<TaskFile>,
    pub account_ref: String,
}

/// Submission acknowledgement.
#[derive(Debug, Serialize)]
pub struct SubmitTaskResponse {
    pub task_id: Uuid,
    pub status: TaskStatus,
}

/// Poll response: result and reason appear once terminal.
#[derive(Debug, Serialize)]
pub struct TaskStatusResponse {
    pub task_id: Uuid,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<Difficulty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `POST /api/v1/tasks`
pub async fn submit(
    State(state): State<AppState>,
    Json(request): Json<SubmitTaskRequest>,
) -> Result<Json<SubmitTaskResponse>, ApiError> {
    let handle = state
        .orchestrator
        .submit(SubmitRequest {
            prompt: request.prompt,
            mode: request.mode,
            streaming: request.streaming,
            files: request.files,
            account_ref: request.account_ref,
        })
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    Ok(Json(SubmitTaskResponse {
        task_id: handle.id,
        status: handle.status(),
    }))
}

/// `GET /api/v1/tasks/{task_id}`
pub async fn poll(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskStatusResponse>, ApiError> {
    let handle = state.orchestrator.get(task_id).ok_or(ApiError::TaskNotFound)?;

    Ok(Json(TaskStatusResponse {
        task_id,
        status: handle.status(),
        difficulty: handle.difficulty(),
        result: handle.result(),
        reason: handle.reason().map(|r| r.to_string()),
    }))
}

/// `DELETE /api/v1/tasks/{task_id}`
pub async fn cancel(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !state.orchestrator.cancel(task_id) {
        return Err(ApiError::TaskNotFound);
    }
    Ok(Json(serde_json::json!({ "task_id": task_id, "cancelled": true })))
}

/// `GET /api/v1/tasks/{task_id}/stream`
///
/// Server-sent events, one event per stream frame, ending when the task's
/// stream closes.
pub async fn subscribe_stream(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let stream = state.streams.get(task_id).ok_or(ApiError::NoStream)?;
    let streams = state.streams.clone();

    let events = futures::stream::unfold(
        (stream, streams, task_id),
        |(stream, streams, task_id)| async move {
            match stream.next().await {
                Some(frame) => {
                    let event = Event::default()
                        .json_data(&frame)
                        .unwrap_or_else(|_| Event::default().data("{}"));
                    Some((Ok(event), (stream, streams, task_id)))
                }
                None => {
                    // Fully drained; the queue can go away.
                    streams.remove(task_id);
                    None
                }
            }
        },
    );

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

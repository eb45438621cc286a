// rest/routes.rs — Request intake and status routes.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

use crate::tasks::{TaskPayload, TaskType};
use crate::AppContext;

#[derive(Deserialize)]
pub struct CreateRequestBody {
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub payload: Value,
}

/// Validate and enqueue. Returns 202 with the request id immediately — the
/// caller subscribes to `/requests/{id}/events` for results. Malformed
/// payloads are rejected here and never enter the queue.
pub async fn create_request(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<CreateRequestBody>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let payload = TaskPayload::parse(body.task_type, &body.payload).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        )
    })?;

    match ctx.tasks.create(&payload).await {
        Ok(record) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({
                "request_id": record.id,
                "type": record.task_type,
                "status": record.status,
            })),
        )),
        Err(e) => {
            warn!(err = %e, "task creation failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "task creation failed" })),
            ))
        }
    }
}

/// Durable status of one request. A client that missed the live stream
/// reads the outcome here — the task record, not the broker, is the source
/// of truth for "did this finish".
pub async fn get_request(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match ctx.tasks.get(&id).await {
        Ok(Some(record)) => Ok(Json(json!({
            "request_id": record.id,
            "type": record.task_type,
            "status": record.status,
            "result": record.result,
            "error": record.error,
            "created_at": record.created_at,
            "updated_at": record.updated_at,
        }))),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "request not found" })),
        )),
        Err(e) => {
            warn!(request_id = %id, err = %e, "status lookup failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "status lookup failed" })),
            ))
        }
    }
}

pub async fn health(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    let counts = ctx.tasks.counts().await.unwrap_or_default();
    Json(json!({
        "status": "ok",
        "uptime_secs": ctx.started_at.elapsed().as_secs(),
        "queue": counts,
        "live_streams": ctx.broker.topic_count(),
    }))
}

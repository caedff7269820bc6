//! Health and stats endpoints.

use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;
use serde_json::{Value, json};

use crate::api::{ApiResponse, state::AppState};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthView {
    pub status: String,
    pub checks: Value,
}

/// `GET /health` — 503 when the database is unreachable.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<ApiResponse<HealthView>>) {
    let database_ok = state.storage.ping();
    let queue_check = if state.async_enabled {
        json!({"status": "ok", "depth": state.queue.len()})
    } else {
        json!({"status": "disabled"})
    };

    let view = HealthView {
        status: if database_ok { "ok" } else { "degraded" }.to_string(),
        checks: json!({
            "database": {"status": if database_ok { "ok" } else { "failed" }},
            "queue": queue_check,
        }),
    };
    let code = if database_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(ApiResponse::ok(view)))
}

/// `GET /api/stats` — task counts by status and type, queue depths.
pub async fn stats(State(state): State<AppState>) -> Json<ApiResponse<Value>> {
    match state.storage.tasks.stats() {
        Ok(task_stats) => Json(ApiResponse::ok(json!({
            "tasks": task_stats,
            "queue": state.queue.stats(),
            "executing": state.cancellations.len(),
        }))),
        Err(e) => Json(ApiResponse::error(e.to_string())),
    }
}

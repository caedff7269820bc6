//! Workflow metadata endpoints.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use craftflow_engine::WorkflowMetadata;
use serde::Deserialize;

use crate::api::{ApiResponse, state::AppState};

#[derive(Deserialize)]
pub struct WorkflowListQuery {
    pub category: Option<String>,
    /// Comma-separated tag filter; all listed tags must match.
    pub tags: Option<String>,
}

/// `GET /api/workflows`
pub async fn list_workflows(
    State(state): State<AppState>,
    Query(query): Query<WorkflowListQuery>,
) -> Json<ApiResponse<Vec<WorkflowMetadata>>> {
    let tags: Vec<String> = query
        .tags
        .as_deref()
        .map(|raw| {
            raw.split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect()
        })
        .unwrap_or_default();
    Json(ApiResponse::ok(
        state.registry.list(query.category.as_deref(), &tags),
    ))
}

/// `GET /api/workflows/{type}`
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(workflow_type): Path<String>,
) -> (StatusCode, Json<ApiResponse<WorkflowMetadata>>) {
    match state.registry.get(&workflow_type) {
        Ok(factory) => (StatusCode::OK, Json(ApiResponse::ok(factory.metadata()))),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(e.to_string())),
        ),
    }
}

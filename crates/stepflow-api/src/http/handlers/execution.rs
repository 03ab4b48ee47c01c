//! Execution control handlers for the REST API.
//!
//! Start, inspect, cancel and retry executions, and deliver decisions to
//! waiting human tasks.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use stepflow_types::execution::{Execution, ExecutionDetails, HumanDecision, StartExecution};

use crate::http::error::AppError;
use crate::http::extractors::query::ExecutionListQuery;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// Request body for cancelling an execution.
#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Request body for retrying an execution.
#[derive(Debug, Default, Deserialize)]
pub struct RetryRequest {
    /// Resume from this task; completed tasks upstream of it keep their outputs.
    #[serde(default)]
    pub from_task_id: Option<String>,
}

/// Request body for a human task decision.
///
/// Task ids may contain `/` (nested tasks), so the task travels in the body
/// rather than in the path.
#[derive(Debug, Deserialize)]
pub struct SignalRequest {
    pub task_id: String,
    #[serde(flatten)]
    pub decision: HumanDecision,
}

fn execution_links(resp: ApiResponse<Execution>, id: Uuid) -> ApiResponse<Execution> {
    resp.with_link("self", &format!("/api/v1/executions/{id}"))
        .with_link("logs", &format!("/api/v1/executions/{id}/logs"))
}

/// POST /api/v1/definitions/{id}/executions - Start an execution.
pub async fn start_execution(
    State(state): State<AppState>,
    Path(definition_id): Path<Uuid>,
    Json(body): Json<StartExecution>,
) -> Result<Json<ApiResponse<Execution>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let mut request = body;
    if request.trigger_id.is_none() {
        request.trigger_id = Some("api".to_string());
    }
    let execution = state.engine.start_execution(definition_id, request).await?;
    let id = execution.id;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(execution_links(
        ApiResponse::success(execution, request_id, elapsed),
        id,
    )))
}

/// GET /api/v1/executions - List executions, newest first.
pub async fn list_executions(
    State(state): State<AppState>,
    Query(query): Query<ExecutionListQuery>,
) -> Result<Json<ApiResponse<Vec<Execution>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let filter = query.filter()?;
    let page = query.page(state.engine.config().default_page_limit);
    let executions = state.engine.list_executions(&filter, page).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::page(executions, request_id, elapsed)
        .with_link("self", "/api/v1/executions");
    Ok(Json(resp))
}

/// GET /api/v1/executions/{id} - Execution with all task records.
pub async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<ExecutionDetails>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let details = state.engine.get_execution(id).await?;
    let definition_id = details.execution.definition_id;

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(details, request_id, elapsed)
        .with_link("self", &format!("/api/v1/executions/{id}"))
        .with_link("logs", &format!("/api/v1/executions/{id}/logs"))
        .with_link("definition", &format!("/api/v1/definitions/{definition_id}"));
    Ok(Json(resp))
}

/// POST /api/v1/executions/{id}/cancel - Cancel a running execution.
pub async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<CancelRequest>,
) -> Result<Json<ApiResponse<Execution>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let execution = state.engine.cancel_execution(id, body.reason).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(execution_links(
        ApiResponse::success(execution, request_id, elapsed),
        id,
    )))
}

/// POST /api/v1/executions/{id}/retry - Start a new execution retrying this one.
pub async fn retry_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<RetryRequest>,
) -> Result<Json<ApiResponse<Execution>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let execution = state
        .engine
        .retry_execution(id, body.from_task_id.as_deref())
        .await?;
    let new_id = execution.id;

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = execution_links(ApiResponse::success(execution, request_id, elapsed), new_id)
        .with_link("retry_of", &format!("/api/v1/executions/{id}"));
    Ok(Json(resp))
}

/// POST /api/v1/executions/{id}/signal - Approve or reject a waiting human task.
pub async fn signal_human_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<SignalRequest>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let decision = match &body.decision {
        HumanDecision::Approve { .. } => "approve",
        HumanDecision::Reject { .. } => "reject",
    };
    state
        .engine
        .signal_human_task(id, &body.task_id, body.decision)
        .await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let data = serde_json::json!({
        "execution_id": id,
        "task_id": body.task_id,
        "decision": decision,
    });
    let resp = ApiResponse::success(data, request_id, elapsed)
        .with_link("execution", &format!("/api/v1/executions/{id}"));
    Ok(Json(resp))
}

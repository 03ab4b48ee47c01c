//! Workflow definition and template handlers for the REST API.
//!
//! Definitions are accepted as JSON or, with a YAML content type
//! (`application/yaml`, `text/yaml`, `application/x-yaml`), in the same
//! YAML format the CLI reads from files.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::http::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use stepflow_core::workflow::definition::{parse_definition_json, parse_definition_yaml};
use stepflow_types::workflow::WorkflowDefinition;

use crate::http::error::AppError;
use crate::http::extractors::query::DefinitionListQuery;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// Request body for template instantiation.
#[derive(Debug, Deserialize)]
pub struct InstantiateRequest {
    /// Name of the new definition.
    pub name: String,
    /// Parameter overrides merged over the template's defaults.
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

fn parse_body(headers: &HeaderMap, body: &str) -> Result<WorkflowDefinition, AppError> {
    let is_yaml = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("yaml"));
    let def = if is_yaml {
        parse_definition_yaml(body)?
    } else {
        parse_definition_json(body)?
    };
    Ok(def)
}

fn definition_links(
    resp: ApiResponse<WorkflowDefinition>,
    id: Uuid,
) -> ApiResponse<WorkflowDefinition> {
    resp.with_link("self", &format!("/api/v1/definitions/{id}"))
        .with_link("executions", &format!("/api/v1/executions?definition_id={id}"))
}

/// POST /api/v1/definitions - Create a workflow definition.
pub async fn create_definition(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<ApiResponse<WorkflowDefinition>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let def = parse_body(&headers, &body)?;
    let def = state.engine.create_definition(def).await?;
    let id = def.id;

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = definition_links(ApiResponse::success(def, request_id, elapsed), id);
    Ok(Json(resp))
}

/// GET /api/v1/definitions - List definitions, newest first.
pub async fn list_definitions(
    State(state): State<AppState>,
    Query(query): Query<DefinitionListQuery>,
) -> Result<Json<ApiResponse<Vec<WorkflowDefinition>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let page = query.page(state.engine.config().default_page_limit);
    let defs = state
        .engine
        .list_definitions(query.tenant_id.as_deref(), page)
        .await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::page(defs, request_id, elapsed).with_link("self", "/api/v1/definitions");
    Ok(Json(resp))
}

/// GET /api/v1/definitions/{id} - Get a definition by ID.
pub async fn get_definition(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<WorkflowDefinition>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let def = state.engine.get_definition(id).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(definition_links(
        ApiResponse::success(def, request_id, elapsed),
        id,
    )))
}

/// PUT /api/v1/definitions/{id} - Replace a definition that no execution references.
pub async fn update_definition(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<ApiResponse<WorkflowDefinition>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let def = parse_body(&headers, &body)?;
    let def = state.engine.update_definition(id, def).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    Ok(Json(definition_links(
        ApiResponse::success(def, request_id, elapsed),
        id,
    )))
}

/// DELETE /api/v1/definitions/{id} - Delete a definition that no execution references.
pub async fn delete_definition(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    state.engine.delete_definition(id).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let data = serde_json::json!({ "deleted": true, "id": id });
    Ok(Json(ApiResponse::success(data, request_id, elapsed)))
}

/// POST /api/v1/templates/{id}/instantiate - Create a definition from a template.
pub async fn instantiate_template(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<InstantiateRequest>,
) -> Result<Json<ApiResponse<WorkflowDefinition>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let def = state
        .engine
        .instantiate_template(id, &body.name, &body.parameters)
        .await?;
    let new_id = def.id;

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = definition_links(ApiResponse::success(def, request_id, elapsed), new_id)
        .with_link("template", &format!("/api/v1/definitions/{id}"));
    Ok(Json(resp))
}

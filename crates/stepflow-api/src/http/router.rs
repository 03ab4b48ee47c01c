//! Axum router configuration with middleware.
//!
//! All routes are under `/api/v1/`.
//! Middleware: CORS, tracing.

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Definitions
        .route(
            "/definitions",
            post(handlers::definition::create_definition)
                .get(handlers::definition::list_definitions),
        )
        .route(
            "/definitions/{id}",
            get(handlers::definition::get_definition)
                .put(handlers::definition::update_definition)
                .delete(handlers::definition::delete_definition),
        )
        .route(
            "/definitions/{id}/executions",
            post(handlers::execution::start_execution),
        )
        // Templates
        .route(
            "/templates/{id}/instantiate",
            post(handlers::definition::instantiate_template),
        )
        // Executions
        .route("/executions", get(handlers::execution::list_executions))
        .route("/executions/{id}", get(handlers::execution::get_execution))
        .route(
            "/executions/{id}/cancel",
            post(handlers::execution::cancel_execution),
        )
        .route(
            "/executions/{id}/retry",
            post(handlers::execution::retry_execution),
        )
        .route(
            "/executions/{id}/signal",
            post(handlers::execution::signal_human_task),
        )
        .route("/executions/{id}/logs", get(handlers::logs::stream_logs));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - Simple health check endpoint.
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use stepflow_core::repository::memory::InMemoryWorkflowRepository;
    use stepflow_types::config::EngineConfig;
    use tower::ServiceExt;

    use super::*;
    use crate::state::EngineRepository;

    const APPROVAL_YAML: &str = r#"
name: release
steps:
  - id: pause
    config:
      type: wait
      duration_ms: 1
  - id: approve
    depends_on: [pause]
    config:
      type: human_task
      assignee: ops
"#;

    fn test_router() -> (Router, AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::with_repository(
            EngineRepository::Memory(InMemoryWorkflowRepository::new()),
            EngineConfig::default(),
            dir.path().to_path_buf(),
        )
        .unwrap();
        (build_router(state.clone()), state, dir)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn create_yaml(app: &Router, yaml: &str) -> (StatusCode, Value) {
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/definitions")
                    .header("content-type", "application/yaml")
                    .body(Body::from(yaml.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn wait_for_status(app: &Router, id: &str, status: &str) -> Value {
        let poll = async {
            loop {
                let (_, body) = send(app, "GET", &format!("/api/v1/executions/{id}"), None).await;
                if body["data"]["status"] == status {
                    return body;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), poll)
            .await
            .unwrap_or_else(|_| panic!("execution {id} never reached {status}"))
    }

    async fn wait_for_task_running(app: &Router, id: &str, task_id: &str) {
        let poll = async {
            loop {
                let (_, body) = send(app, "GET", &format!("/api/v1/executions/{id}"), None).await;
                let running = body["data"]["tasks"]
                    .as_array()
                    .into_iter()
                    .flatten()
                    .any(|t| t["task_id"] == task_id && t["status"] == "running");
                if running {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), poll)
            .await
            .unwrap_or_else(|_| panic!("task {task_id} never started"));
    }

    #[tokio::test]
    async fn test_health_returns_ok() {
        let (app, _state, _dir) = test_router();
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_definition_crud_over_http() {
        let (app, _state, _dir) = test_router();

        let (status, created) = create_yaml(&app, APPROVAL_YAML).await;
        assert_eq!(status, StatusCode::OK);
        let id = created["data"]["id"].as_str().unwrap().to_string();
        assert_eq!(created["data"]["name"], "release");
        assert_eq!(created["_links"]["self"], format!("/api/v1/definitions/{id}"));

        let (status, listed) = send(&app, "GET", "/api/v1/definitions", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed["meta"]["pagination"]["total"], 1);

        let mut replacement = created["data"].clone();
        replacement["name"] = json!("release-v2");
        let (status, updated) = send(
            &app,
            "PUT",
            &format!("/api/v1/definitions/{id}"),
            Some(replacement),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["data"]["name"], "release-v2");
        assert_eq!(updated["data"]["id"], id);

        let (status, _) = send(&app, "DELETE", &format!("/api/v1/definitions/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, missing) = send(&app, "GET", &format!("/api/v1/definitions/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(missing["errors"][0]["code"], "DEFINITION_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_invalid_definition_is_rejected() {
        let (app, _state, _dir) = test_router();
        let cyclic = json!({
            "name": "loop",
            "steps": [
                { "id": "a", "depends_on": ["b"], "config": { "type": "wait", "duration_ms": 1 } },
                { "id": "b", "depends_on": ["a"], "config": { "type": "wait", "duration_ms": 1 } }
            ]
        });
        let (status, body) = send(&app, "POST", "/api/v1/definitions", Some(cyclic)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errors"][0]["code"], "VALIDATION_ERROR");

        let (status, _) = create_yaml(&app, "name: [unclosed").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_approval_flow_over_http() {
        let (app, _state, _dir) = test_router();
        let (_, created) = create_yaml(&app, APPROVAL_YAML).await;
        let def_id = created["data"]["id"].as_str().unwrap().to_string();

        let (status, started) = send(
            &app,
            "POST",
            &format!("/api/v1/definitions/{def_id}/executions"),
            Some(json!({ "input": { "release": "1.2.0" } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let exec_id = started["data"]["id"].as_str().unwrap().to_string();
        assert_eq!(started["data"]["trigger_id"], "api");

        // Referenced definitions are frozen.
        let (status, body) =
            send(&app, "DELETE", &format!("/api/v1/definitions/{def_id}"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["errors"][0]["code"], "DEFINITION_IN_USE");

        wait_for_task_running(&app, &exec_id, "approve").await;
        let (status, signalled) = send(
            &app,
            "POST",
            &format!("/api/v1/executions/{exec_id}/signal"),
            Some(json!({ "task_id": "approve", "decision": "approve", "actor": "alice" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(signalled["data"]["decision"], "approve");

        let done = wait_for_status(&app, &exec_id, "completed").await;
        let approve = done["data"]["tasks"]
            .as_array()
            .unwrap()
            .iter()
            .find(|t| t["task_id"] == "approve")
            .unwrap()
            .clone();
        assert_eq!(approve["output"]["actor"], "alice");

        let (status, listed) = send(
            &app,
            "GET",
            &format!("/api/v1/executions?definition_id={def_id}&status=completed"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed["data"].as_array().unwrap().len(), 1);

        // A completed execution cannot be cancelled or retried.
        let (status, _) = send(
            &app,
            "POST",
            &format!("/api/v1/executions/{exec_id}/cancel"),
            Some(json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        let (status, _) = send(
            &app,
            "POST",
            &format!("/api/v1/executions/{exec_id}/retry"),
            Some(json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_cancel_then_retry_over_http() {
        let (app, _state, _dir) = test_router();
        let (_, created) = create_yaml(&app, APPROVAL_YAML).await;
        let def_id = created["data"]["id"].as_str().unwrap().to_string();

        let (_, started) = send(
            &app,
            "POST",
            &format!("/api/v1/definitions/{def_id}/executions"),
            Some(json!({})),
        )
        .await;
        let exec_id = started["data"]["id"].as_str().unwrap().to_string();
        wait_for_task_running(&app, &exec_id, "approve").await;

        let (status, cancelled) = send(
            &app,
            "POST",
            &format!("/api/v1/executions/{exec_id}/cancel"),
            Some(json!({ "reason": "wrong build" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancelled["data"]["status"], "cancelled");

        let (status, retried) = send(
            &app,
            "POST",
            &format!("/api/v1/executions/{exec_id}/retry"),
            Some(json!({ "from_task_id": "approve" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(retried["data"]["retry_of"], exec_id);
        assert_eq!(retried["_links"]["retry_of"], format!("/api/v1/executions/{exec_id}"));
    }

    #[tokio::test]
    async fn test_unknown_execution_is_not_found() {
        let (app, _state, _dir) = test_router();
        let id = uuid::Uuid::now_v7();
        let (status, body) = send(&app, "GET", &format!("/api/v1/executions/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["errors"][0]["code"], "EXECUTION_NOT_FOUND");

        let (status, _) = send(&app, "GET", &format!("/api/v1/executions/{id}/logs"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "GET", "/api/v1/executions?status=sleeping", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_finished_execution_log_stream_only_ends() {
        let (app, state, _dir) = test_router();
        let (_, created) = create_yaml(
            &app,
            "name: quick\nsteps:\n  - id: pause\n    config:\n      type: wait\n      duration_ms: 1\n",
        )
        .await;
        let def_id: uuid::Uuid = created["data"]["id"].as_str().unwrap().parse().unwrap();
        let execution = state
            .engine
            .start_execution(def_id, Default::default())
            .await
            .unwrap();
        state.engine.wait_for_execution(execution.id).await.unwrap();

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/v1/executions/{}/logs", execution.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("event: end"));
        assert!(text.contains(r#""status":"completed""#));
        assert!(!text.contains("event: log"));
    }
}

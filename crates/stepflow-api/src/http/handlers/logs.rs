//! SSE log streaming endpoint.
//!
//! GET /api/v1/executions/{id}/logs?task_id=...&min_level=...
//!
//! Streams the execution's log events as Server-Sent Events until the
//! execution finishes or the client disconnects. Subscribing to an execution
//! that already finished yields only the closing event.
//!
//! SSE event types:
//! - `log` -- one serialized log event
//! - `end` -- stream complete: `{ "status": "<execution status>" }`

use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use tokio_stream::Stream;
use uuid::Uuid;

use crate::http::error::AppError;
use crate::http::extractors::query::LogStreamQuery;
use crate::state::AppState;

/// GET /api/v1/executions/{id}/logs - Live log stream.
pub async fn stream_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<LogStreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let filter = query.filter()?;
    let mut subscription = state.engine.subscribe_logs(id, filter).await?;
    tracing::debug!(execution_id = %id, "log stream opened");

    let stream = async_stream::stream! {
        while let Some(event) = subscription.recv().await {
            let data = serde_json::to_string(&event).unwrap_or_default();
            yield Ok::<_, Infallible>(Event::default().event("log").data(data));
        }

        let status = match state.engine.get_execution(id).await {
            Ok(details) => details.execution.status.to_string(),
            Err(e) => {
                tracing::warn!(execution_id = %id, "log stream could not read final status: {e}");
                "unknown".to_string()
            }
        };
        let data = serde_json::json!({ "status": status });
        yield Ok(Event::default().event("end").data(data.to_string()));
        tracing::debug!(execution_id = %id, "log stream closed");
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
